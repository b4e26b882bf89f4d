//! Settings for the gajim session core.
//!
//! Accounts and global idle behaviour are described by serde structs with
//! `#[serde(default)]` so that a minimal TOML file is enough to get going.

pub mod account;
pub mod app;
pub mod error;
pub mod status;

pub use {
    account::{AccountConfig, MucRoomConfig, SendChatstate, ShowPriorities, SyncThreshold},
    app::{AppConfig, IdleConfig},
    error::ConfigError,
    status::Show,
};
