use std::{collections::HashMap, fmt, sync::Arc};

/// Lifecycle state of one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ClientState {
    Disconnecting,
    #[default]
    Disconnected,
    ReconnectScheduled,
    Connecting,
    /// Stream is up, the sign-in sequence is running.
    Connected,
    /// Signed in and initial presence sent.
    Available,
}

impl ClientState {
    pub fn is_disconnecting(self) -> bool {
        self == Self::Disconnecting
    }

    pub fn is_disconnected(self) -> bool {
        self == Self::Disconnected
    }

    pub fn is_reconnect_scheduled(self) -> bool {
        self == Self::ReconnectScheduled
    }

    pub fn is_connecting(self) -> bool {
        self == Self::Connecting
    }

    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }

    pub fn is_available(self) -> bool {
        self == Self::Available
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnecting => "disconnecting",
            Self::Disconnected => "disconnected",
            Self::ReconnectScheduled => "reconnect-scheduled",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Available => "available",
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of the sign-in sequence that runs after the stream is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectPhase {
    #[default]
    Idle,
    DiscoveringMetacontacts,
    RequestingDelimiter,
    RequestingRoster,
    Finished,
}

impl ConnectPhase {
    pub fn next(self) -> Self {
        match self {
            Self::Idle => Self::DiscoveringMetacontacts,
            Self::DiscoveringMetacontacts => Self::RequestingDelimiter,
            Self::RequestingDelimiter => Self::RequestingRoster,
            Self::RequestingRoster | Self::Finished => Self::Finished,
        }
    }
}

/// What the runtime publishes about an account after every step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSnapshot {
    pub state: ClientState,
    pub show: String,
    pub bound_jid: Option<String>,
}

/// Shared account state map.
pub type AccountStateMap = Arc<tokio::sync::RwLock<HashMap<String, AccountSnapshot>>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_advance_to_finished() {
        let mut phase = ConnectPhase::Idle;
        let mut seen = vec![phase];
        while phase != ConnectPhase::Finished {
            phase = phase.next();
            seen.push(phase);
        }
        assert_eq!(seen, vec![
            ConnectPhase::Idle,
            ConnectPhase::DiscoveringMetacontacts,
            ConnectPhase::RequestingDelimiter,
            ConnectPhase::RequestingRoster,
            ConnectPhase::Finished,
        ]);
        assert_eq!(ConnectPhase::Finished.next(), ConnectPhase::Finished);
    }

    #[test]
    fn state_predicates() {
        assert!(ClientState::default().is_disconnected());
        assert!(ClientState::Available.is_available());
        assert!(!ClientState::Available.is_connected());
        assert_eq!(ClientState::ReconnectScheduled.to_string(), "reconnect-scheduled");
    }
}
