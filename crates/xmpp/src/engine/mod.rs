//! The seam between the client state machine and the XMPP stream.
//!
//! An [`Engine`] owns one connection attempt. It reports what happens on
//! the stream as [`EngineSignal`]s tagged with the generation it was created
//! for, so signals from a replaced engine can be told apart.

pub mod network;

use std::fmt;

use secrecy::Secret;

use crate::minidom::Element;

pub use network::TokioXmppFactory;

/// Default priority of stanza handlers.
pub const DEFAULT_HANDLER_PRIORITY: i32 = 50;

/// Routes matching inbound stanzas to a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StanzaHandler {
    /// `message`, `presence` or `iq`.
    pub name: &'static str,
    /// Only match stanzas carrying a child in this namespace.
    pub ns: Option<&'static str>,
    /// Only match this `type` attribute.
    pub typ: Option<&'static str>,
    pub priority: i32,
    pub module: &'static str,
    /// Passed back to the module to tell its handlers apart.
    pub tag: &'static str,
}

impl StanzaHandler {
    pub fn new(name: &'static str, module: &'static str, tag: &'static str) -> Self {
        Self {
            name,
            ns: None,
            typ: None,
            priority: DEFAULT_HANDLER_PRIORITY,
            module,
            tag,
        }
    }

    pub fn ns(mut self, ns: &'static str) -> Self {
        self.ns = Some(ns);
        self
    }

    pub fn typ(mut self, typ: &'static str) -> Self {
        self.typ = Some(typ);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn matches(&self, stanza: &Element) -> bool {
        if stanza.name() != self.name {
            return false;
        }
        if let Some(typ) = self.typ
            && stanza.attr("type") != Some(typ)
        {
            return false;
        }
        match self.ns {
            Some(ns) => stanza.children().any(|c| c.ns() == ns),
            None => true,
        }
    }
}

/// Registered stanza handlers, kept sorted by priority.
#[derive(Debug, Clone, Default)]
pub struct HandlerTable {
    handlers: Vec<StanzaHandler>,
}

impl HandlerTable {
    pub fn register(&mut self, handler: StanzaHandler) {
        if self.handlers.contains(&handler) {
            return;
        }
        let pos = self
            .handlers
            .iter()
            .position(|h| h.priority > handler.priority)
            .unwrap_or(self.handlers.len());
        self.handlers.insert(pos, handler);
    }

    pub fn unregister(&mut self, handler: &StanzaHandler) {
        self.handlers.retain(|h| h != handler);
    }

    pub fn matching(&self, stanza: &Element) -> Vec<StanzaHandler> {
        self.handlers
            .iter()
            .filter(|h| h.matches(stanza))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDomain {
    BadCertificate,
    Stream,
    Bind,
    Sasl,
    Connection,
    Other,
}

/// Why the last connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionError {
    pub domain: ErrorDomain,
    /// e.g. `conflict`, `not-authorized`, `no-password`.
    pub condition: String,
    pub text: Option<String>,
}

impl ConnectionError {
    pub fn new(domain: ErrorDomain, condition: &str) -> Self {
        Self {
            domain,
            condition: condition.to_string(),
            text: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn is_resource_conflict(&self) -> bool {
        matches!(self.domain, ErrorDomain::Stream | ErrorDomain::Bind) && self.condition == "conflict"
    }

    pub fn is_auth_failure(&self) -> bool {
        self.domain == ErrorDomain::Sasl
            && matches!(self.condition.as_str(), "not-authorized" | "no-password")
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.domain, self.condition)?;
        if let Some(text) = &self.text {
            write!(f, " ({text})")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    DirectTls,
    StartTls,
    Plain,
}

/// What happened on the stream.
#[derive(Debug, Clone)]
pub enum EngineSignal {
    Connected,
    Disconnected,
    ConnectionFailed,
    ResumeSuccessful,
    ResumeFailed,
    StanzaSent(Element),
    StanzaReceived(Element),
}

/// A signal from the engine of `generation` for `account`.
#[derive(Debug, Clone)]
pub struct EngineEvent {
    pub account: String,
    pub generation: u64,
    pub signal: EngineSignal,
}

/// Connection parameters for one engine.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub account: String,
    pub generation: u64,
    pub jid: String,
    pub resource: Option<String>,
    pub password: Option<Secret<String>>,
    pub anonymous: bool,
    pub connection_types: Vec<ConnectionType>,
    pub ignored_tls_errors: Vec<String>,
}

pub trait Engine: Send {
    fn connect(&mut self);

    /// Close the stream. An immediate disconnect skips the stream close handshake.
    fn disconnect(&mut self, immediate: bool);

    /// Queue a stanza. Returns its id.
    fn send_stanza(&mut self, stanza: Element) -> Option<String>;

    fn register_handler(&mut self, handler: StanzaHandler);

    fn unregister_handler(&mut self, handler: &StanzaHandler);

    fn matching_handlers(&self, stanza: &Element) -> Vec<StanzaHandler>;

    /// Error that ended the last connection.
    fn error(&self) -> Option<ConnectionError>;

    fn peer_certificate_errors(&self) -> Vec<String>;

    fn set_password(&mut self, password: Option<Secret<String>>);

    fn set_ignore_tls_errors(&mut self, ignore: bool);

    fn connection_types(&self) -> Vec<ConnectionType>;

    /// Full JID bound by the server.
    fn bound_jid(&self) -> Option<String>;

    /// Drop handlers and release the connection for good.
    fn destroy(&mut self);
}

pub trait EngineFactory: Send + Sync {
    fn create(&self, options: EngineOptions) -> Box<dyn Engine>;
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::{build_iq, ns};

    #[test]
    fn handler_matching() {
        let roster = StanzaHandler::new("iq", "Roster", "push")
            .ns(ns::ROSTER)
            .typ("set");
        let push = build_iq(
            "p1",
            "set",
            None,
            Some(Element::builder("query", ns::ROSTER).build()),
        );
        let get = build_iq(
            "p2",
            "get",
            None,
            Some(Element::builder("query", ns::ROSTER).build()),
        );
        assert!(roster.matches(&push));
        assert!(!roster.matches(&get));
        assert!(!StanzaHandler::new("message", "X", "x").matches(&push));
    }

    #[test]
    fn table_orders_by_priority_stably() {
        let mut table = HandlerTable::default();
        table.register(StanzaHandler::new("message", "B", "b").priority(51));
        table.register(StanzaHandler::new("message", "A", "a").priority(41));
        table.register(StanzaHandler::new("message", "C", "c").priority(51));
        table.register(StanzaHandler::new("message", "C", "c").priority(51));
        assert_eq!(table.len(), 3);

        let msg = Element::builder("message", ns::JABBER_CLIENT).build();
        let order: Vec<_> = table.matching(&msg).iter().map(|h| h.module).collect();
        assert_eq!(order, vec!["A", "B", "C"]);

        table.unregister(&StanzaHandler::new("message", "B", "b").priority(51));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn error_classification_helpers() {
        assert!(ConnectionError::new(ErrorDomain::Bind, "conflict").is_resource_conflict());
        assert!(!ConnectionError::new(ErrorDomain::Sasl, "conflict").is_resource_conflict());
        assert!(ConnectionError::new(ErrorDomain::Sasl, "no-password").is_auth_failure());
        let err = ConnectionError::new(ErrorDomain::Connection, "timeout").with_text("no route");
        assert_eq!(err.to_string(), "Connection: timeout (no route)");
    }
}
