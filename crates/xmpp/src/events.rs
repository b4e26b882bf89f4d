//! Events raised on the [`Ged`](crate::ged::Ged).

use {jid::BareJid, secrecy::Secret, tokio::sync::mpsc, tracing::warn};

use crate::{
    client::ClientCommand,
    context::AppCommand,
    minidom::Element,
    modules::{bookmarks::Bookmark, roster::RosterItem},
    storage::{LogEntry, MessageKind},
    xep::chat_states::ChatState,
};

/// An event together with the account it concerns.
#[derive(Debug, Clone)]
pub struct Event {
    pub account: String,
    pub kind: EventKind,
}

impl Event {
    pub fn new(account: &str, kind: EventKind) -> Self {
        Self {
            account: account.to_string(),
            kind,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

#[derive(Debug, Clone)]
pub enum EventKind {
    /// Asks whether to continue over an unencrypted connection.
    PlainConnection { responder: PlainConnectionResponder },
    PasswordRequired { responder: PasswordResponder },
    /// Certificate problems were reported for the connection.
    SslError {
        errors: Vec<String>,
        responder: TlsResponder,
    },
    OurShow { show: String },
    AccountConnected,
    AccountDisconnected,
    SignedIn,
    SimpleNotification {
        kind: String,
        title: String,
        text: String,
    },
    StanzaSent { stanza: Element },
    StanzaReceived { stanza: Element },
    FeatureDiscovered { feature: String },
    ServerDiscoReceived,
    RosterReceived {
        items: Vec<RosterItem>,
        received_from_server: bool,
    },
    BookmarksReceived { bookmarks: Vec<Bookmark> },
    MucJoined { room: BareJid, nick: String },
    VcardReceived { nickname: Option<String> },
    BlockingListReceived { jids: Vec<String> },
    ReceiptReceived { jid: String, receipt_id: String },
    MessageSent {
        jid: String,
        message: String,
        message_id: Option<String>,
    },
    ChatstateUpdate {
        jid: String,
        chatstate: Option<ChatState>,
    },
    MamMessageReceived {
        archive: BareJid,
        query_id: Option<String>,
    },
    MamDecryptedMessageReceived {
        archive: BareJid,
        kind: MessageKind,
        entry: LogEntry,
    },
    ArchivingIntervalFinished { query_id: String },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PlainConnection { .. } => "plain-connection",
            Self::PasswordRequired { .. } => "password-required",
            Self::SslError { .. } => "ssl-error",
            Self::OurShow { .. } => "our-show",
            Self::AccountConnected => "account-connected",
            Self::AccountDisconnected => "account-disconnected",
            Self::SignedIn => "signed-in",
            Self::SimpleNotification { .. } => "simple-notification",
            Self::StanzaSent { .. } => "stanza-sent",
            Self::StanzaReceived { .. } => "stanza-received",
            Self::FeatureDiscovered { .. } => "feature-discovered",
            Self::ServerDiscoReceived => "server-disco-received",
            Self::RosterReceived { .. } => "roster-received",
            Self::BookmarksReceived { .. } => "bookmarks-received",
            Self::MucJoined { .. } => "muc-joined",
            Self::VcardReceived { .. } => "vcard-received",
            Self::BlockingListReceived { .. } => "blocking-list-received",
            Self::ReceiptReceived { .. } => "receipt-received",
            Self::MessageSent { .. } => "message-sent",
            Self::ChatstateUpdate { .. } => "chatstate-update",
            Self::MamMessageReceived { .. } => "mam-message-received",
            Self::MamDecryptedMessageReceived { .. } => "mam-decrypted-message-received",
            Self::ArchivingIntervalFinished { .. } => "archiving-interval-finished",
        }
    }
}

/// Sends a user decision back to the account that asked for it.
#[derive(Debug, Clone)]
pub struct Responder {
    account: String,
    commands: mpsc::UnboundedSender<AppCommand>,
}

impl Responder {
    pub(crate) fn new(account: &str, commands: mpsc::UnboundedSender<AppCommand>) -> Self {
        Self {
            account: account.to_string(),
            commands,
        }
    }

    fn send(&self, command: ClientCommand) -> bool {
        let sent = self
            .commands
            .send(AppCommand::Client {
                account: self.account.clone(),
                command,
            })
            .is_ok();
        if !sent {
            warn!(account = %self.account, "account is gone, dropping response");
        }
        sent
    }
}

#[derive(Debug, Clone)]
pub struct PasswordResponder(pub(crate) Responder);

impl PasswordResponder {
    /// Retry the connection with `password`.
    pub fn submit(&self, password: Secret<String>) -> bool {
        self.0.send(ClientCommand::PasswordProvided(password))
    }
}

#[derive(Debug, Clone)]
pub struct PlainConnectionResponder(pub(crate) Responder);

impl PlainConnectionResponder {
    pub fn proceed(&self) -> bool {
        self.0.send(ClientCommand::ConfirmPlainConnection)
    }

    pub fn abort(&self) -> bool {
        self.0.send(ClientCommand::AbortConnect)
    }
}

#[derive(Debug, Clone)]
pub struct TlsResponder(pub(crate) Responder);

impl TlsResponder {
    /// Connect despite the reported errors, optionally remembering them.
    pub fn accept(&self, ignore_permanently: bool) -> bool {
        self.0.send(ClientCommand::AcceptTlsErrors { ignore_permanently })
    }

    pub fn reject(&self) -> bool {
        self.0.send(ClientCommand::AbortConnect)
    }
}
