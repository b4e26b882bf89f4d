use thiserror::Error;

use crate::state::ClientState;

/// Errors returned by the public client surface.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid JID '{jid}': {reason}")]
    InvalidJid { jid: String, reason: String },

    #[error("account '{0}' is not available (state: {1})")]
    NotAvailable(String, ClientState),

    #[error("unknown account: {0}")]
    UnknownAccount(String),

    #[error("account '{0}' already exists")]
    DuplicateAccount(String),

    #[error("runtime for account '{0}' is gone")]
    RuntimeClosed(String),
}
