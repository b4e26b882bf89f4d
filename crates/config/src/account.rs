use std::collections::HashMap;

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

use crate::status::Show;

/// Resource template applied after a resource conflict.
pub const RANDOM_RESOURCE: &str = "gajim.$rand";

/// Which chat states we send to a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendChatstate {
    All,
    /// Only `active` and `composing`.
    #[default]
    ComposingOnly,
    Disabled,
}

/// How far back to fetch a room archive after a long absence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncThreshold {
    /// Always resume from the last archive id.
    NoThreshold,
    /// Fetch at most this many days if the last visit is older than that.
    Days(u32),
}

impl From<u32> for SyncThreshold {
    fn from(days: u32) -> Self {
        match days {
            0 => Self::NoThreshold,
            n => Self::Days(n),
        }
    }
}

/// Per-show presence priorities used when `adjust_priority_with_status` is on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShowPriorities {
    pub online: i8,
    pub chat: i8,
    pub away: i8,
    pub xa: i8,
    pub dnd: i8,
}

impl Default for ShowPriorities {
    fn default() -> Self {
        Self {
            online: 50,
            chat: 50,
            away: 40,
            xa: 30,
            dnd: 20,
        }
    }
}

/// Per-MUC room settings, keyed by room JID.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MucRoomConfig {
    /// Join the room after sign-in even without a bookmark.
    pub autojoin: bool,
    /// Nickname override for this room.
    pub nick: Option<String>,
    /// Sync threshold in days, `0` disables it. Falls back to the account default.
    pub sync_threshold: Option<u32>,
    /// Public rooms use the public threshold by default.
    pub public: bool,
}

/// Configuration for a single XMPP account.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    /// User JID (e.g. "juliet@capulet.lit").
    pub jid: String,

    /// Account password. Only used when `savepass` is set.
    #[serde(serialize_with = "serialize_secret")]
    pub password: Secret<String>,

    /// Whether the password is stored in this config.
    pub savepass: bool,

    /// Resource template, `$rand` and `$hostname` are substituted.
    pub resource: String,

    /// Disabled accounts are loaded but never connected.
    pub enabled: bool,

    pub anonymous_auth: bool,

    /// Skip TLS entirely.
    pub use_plain_connection: bool,

    /// Ask before connecting without TLS.
    pub confirm_unencrypted_connection: bool,

    /// TLS error names the user has chosen to ignore permanently.
    pub ignored_tls_errors: Vec<String>,

    /// Use per-show priorities instead of the fixed `priority`.
    pub adjust_priority_with_status: bool,

    pub priority: i8,

    pub priorities: ShowPriorities,

    /// Default chat state policy for contacts of this account.
    pub send_chatstate: SendChatstate,

    /// Sync threshold in days for private rooms, `0` disables it.
    pub private_room_sync_threshold: u32,

    /// Sync threshold in days for public rooms, `0` disables it.
    pub public_room_sync_threshold: u32,

    /// Per-room configuration overrides, keyed by room JID.
    pub muc_rooms: HashMap<String, MucRoomConfig>,

    /// Nickname used in rooms without an explicit one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nick: Option<String>,

    /// Archive cursor from before cursors moved into the archive store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_mam_id: Option<String>,
}

impl std::fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountConfig")
            .field("jid", &self.jid)
            .field("password", &"[REDACTED]")
            .field("resource", &self.resource)
            .field("enabled", &self.enabled)
            .field("use_plain_connection", &self.use_plain_connection)
            .field("muc_rooms", &self.muc_rooms.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

fn serialize_secret<S: serde::Serializer>(
    secret: &Secret<String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            jid: String::new(),
            password: Secret::new(String::new()),
            savepass: true,
            resource: RANDOM_RESOURCE.into(),
            enabled: true,
            anonymous_auth: false,
            use_plain_connection: false,
            confirm_unencrypted_connection: true,
            ignored_tls_errors: Vec::new(),
            adjust_priority_with_status: false,
            priority: 0,
            priorities: ShowPriorities::default(),
            send_chatstate: SendChatstate::default(),
            private_room_sync_threshold: 0,
            public_room_sync_threshold: 1,
            muc_rooms: HashMap::new(),
            nick: None,
            last_mam_id: None,
        }
    }
}

impl AccountConfig {
    /// Stored password, if the user chose to save one.
    pub fn saved_password(&self) -> Option<Secret<String>> {
        if !self.savepass || self.password.expose_secret().is_empty() {
            return None;
        }
        Some(self.password.clone())
    }

    /// Priority to advertise for `show`.
    pub fn get_priority(&self, show: Show) -> i8 {
        if !self.adjust_priority_with_status {
            return self.priority;
        }
        match show {
            Show::Online => self.priorities.online,
            Show::Chat => self.priorities.chat,
            Show::Away => self.priorities.away,
            Show::Xa => self.priorities.xa,
            Show::Dnd => self.priorities.dnd,
            Show::Offline => self.priority,
        }
    }

    /// Sync threshold for a room.
    pub fn sync_threshold(&self, room_jid: &str) -> SyncThreshold {
        let room = self.muc_rooms.get(room_jid);
        if let Some(days) = room.and_then(|r| r.sync_threshold) {
            return days.into();
        }
        if room.is_some_and(|r| r.public) {
            self.public_room_sync_threshold.into()
        } else {
            self.private_room_sync_threshold.into()
        }
    }

    /// Nickname to use in `room_jid`.
    pub fn muc_nick(&self, room_jid: &str) -> String {
        if let Some(nick) = self.muc_rooms.get(room_jid).and_then(|r| r.nick.clone()) {
            return nick;
        }
        if let Some(nick) = &self.nick {
            return nick.clone();
        }
        self.jid.split('@').next().unwrap_or(&self.jid).to_string()
    }

    /// Expand the resource template.
    pub fn render_resource(&self) -> Option<String> {
        render_resource(&self.resource)
    }
}

/// Substitute `$hostname` and `$rand` in a resource template.
///
/// Returns `None` for an empty template so the server assigns one.
pub fn render_resource(template: &str) -> Option<String> {
    if template.is_empty() {
        return None;
    }
    let mut rendered = template.to_string();
    if rendered.contains("$hostname") {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".into());
        rendered = rendered.replace("$hostname", &host);
    }
    if rendered.contains("$rand") {
        rendered = rendered.replace("$rand", &gajim_common::random_string(8));
    }
    Some(rendered)
}
