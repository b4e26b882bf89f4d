use thiserror::Error;

/// Errors shared by the session core crates.
#[derive(Debug, Error)]
pub enum Error {
    #[error("timer {0} is not scheduled")]
    UnknownTimer(u64),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(i64),
}

pub type Result<T> = std::result::Result<T, Error>;
