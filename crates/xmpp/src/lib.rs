//! Per-account XMPP session core.
//!
//! A [`Client`] drives one account through its connection lifecycle on top
//! of a protocol [`Engine`](engine::Engine). Protocol features live in
//! [`modules`], network notifications reach the outside world through the
//! [`Ged`] event bus, and [`AppContext`] ties the accounts of one process
//! together.

pub mod client;
pub mod context;
pub mod core;
pub mod engine;
pub mod error;
pub mod events;
pub mod ged;
pub mod idle;
pub mod manager;
pub mod modules;
pub mod runtime;
pub mod stanza;
pub mod state;
pub mod storage;
pub mod xep;

#[cfg(test)]
pub(crate) mod test_support;

/// Re-export tokio-xmpp's minidom to avoid version conflicts.
/// All modules in this crate should use `crate::minidom` instead of
/// importing minidom directly.
pub use tokio_xmpp::minidom;

pub use {
    client::{Client, ClientCommand, OutgoingMessage},
    context::{AppCommand, AppContext, Services},
    error::ClientError,
    events::{Event, EventKind},
    ged::{Dispatch, Ged, HandlerResult},
    manager::AccountManager,
    runtime::{Runtime, start_event_loop},
    state::{AccountSnapshot, AccountStateMap, ClientState, ConnectPhase},
};
