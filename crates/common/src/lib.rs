//! Shared primitives used by the gajim session core.
//!
//! Nothing in here knows about XMPP. The crate provides the clock seam, the
//! deterministic timer wheel every per-account loop drives, and a couple of
//! small helpers.

pub mod clock;
pub mod error;
pub mod timers;

pub use {
    clock::{Clock, ManualClock, SystemClock},
    error::{Error, Result},
    timers::{TimerId, TimerWheel},
};

/// Generate a random alphanumeric string of `len` characters.
///
/// Used for resource randomisation and query ids.
pub fn random_string(len: usize) -> String {
    use rand::{Rng, distr::Alphanumeric};

    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
