//! Stanza building helpers for messages, presence, and IQ.

use {
    chrono::{DateTime, SecondsFormat, Utc},
    jid::BareJid,
};

use crate::minidom::{Element, rxml::NcName};

/// XMPP namespace constants.
pub mod ns {
    pub const JABBER_CLIENT: &str = "jabber:client";
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    pub const MUC: &str = "http://jabber.org/protocol/muc";
    pub const MUC_USER: &str = "http://jabber.org/protocol/muc#user";
    pub const CHAT_STATES: &str = "http://jabber.org/protocol/chatstates";
    pub const OOB: &str = "jabber:x:oob";
    pub const DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
    pub const DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";
    pub const ROSTER: &str = "jabber:iq:roster";
    pub const PRIVATE: &str = "jabber:iq:private";
    pub const BOOKMARKS: &str = "storage:bookmarks";
    pub const METACONTACTS: &str = "storage:metacontacts";
    pub const ROSTER_DELIMITER: &str = "roster:delimiter";
    pub const VCARD: &str = "vcard-temp";
    pub const BLOCKING: &str = "urn:xmpp:blocking";
    pub const RECEIPTS: &str = "urn:xmpp:receipts";
    pub const IDLE: &str = "urn:xmpp:idle:1";
    pub const MAM_2: &str = "urn:xmpp:mam:2";
    pub const RSM: &str = "http://jabber.org/protocol/rsm";
    pub const DATA_FORMS: &str = "jabber:x:data";
    pub const FORWARD: &str = "urn:xmpp:forward:0";
    pub const DELAY: &str = "urn:xmpp:delay";
    pub const STANZA_ID: &str = "urn:xmpp:sid:0";
    pub const CARBONS: &str = "urn:xmpp:carbons:2";
    pub const PUBSUB_EVENT: &str = "http://jabber.org/protocol/pubsub#event";
}

/// Convert a static string to an `NcName` for use with minidom's attribute API.
///
/// Panics if the string is not a valid NCName (should only be used with known-good names).
pub(crate) fn ncname(s: &str) -> NcName {
    NcName::try_from(s).unwrap_or_else(|_| panic!("invalid NCName: {s}"))
}

/// Fresh random stanza id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Bare part of a JID string, without validation.
pub fn bare_str(jid: &str) -> &str {
    jid.split('/').next().unwrap_or(jid)
}

/// Resource part of a JID string.
pub fn resource_str(jid: &str) -> Option<&str> {
    jid.split_once('/').map(|(_, res)| res)
}

/// Parse the bare part of a (possibly full) JID.
pub fn parse_bare(jid: &str) -> Option<BareJid> {
    bare_str(jid).parse().ok()
}

/// XEP-0082 timestamp.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Build a `<message>` stanza with an id.
///
/// `msg_type` should be `"chat"` for 1:1 or `"groupchat"` for MUC.
pub fn build_message(id: &str, to: &str, msg_type: &str, body: &str) -> Element {
    Element::builder("message", ns::JABBER_CLIENT)
        .attr(ncname("id"), id)
        .attr(ncname("to"), to)
        .attr(ncname("type"), msg_type)
        .append(
            Element::builder("body", ns::JABBER_CLIENT)
                .append(body)
                .build(),
        )
        .build()
}

/// Content of an available presence.
#[derive(Debug, Clone, Default)]
pub struct PresenceContent<'a> {
    pub to: Option<&'a str>,
    /// `away`, `chat`, `dnd` or `xa`. `None` means plain online.
    pub show: Option<&'a str>,
    pub status: Option<&'a str>,
    pub priority: i8,
    /// XEP-0319 last user interaction.
    pub idle_since: Option<DateTime<Utc>>,
}

/// Build an available `<presence>` stanza (initial or directed).
pub fn build_presence(content: &PresenceContent<'_>) -> Element {
    let mut builder = Element::builder("presence", ns::JABBER_CLIENT);
    if let Some(to) = content.to {
        builder = builder.attr(ncname("to"), to);
    }
    if let Some(show) = content.show {
        builder = builder.append(Element::builder("show", ns::JABBER_CLIENT).append(show).build());
    }
    if let Some(status) = content.status.filter(|s| !s.is_empty()) {
        builder =
            builder.append(Element::builder("status", ns::JABBER_CLIENT).append(status).build());
    }
    builder = builder.append(
        Element::builder("priority", ns::JABBER_CLIENT)
            .append(content.priority.to_string())
            .build(),
    );
    if let Some(since) = content.idle_since {
        builder = builder.append(
            Element::builder("idle", ns::IDLE)
                .attr(ncname("since"), format_timestamp(since))
                .build(),
        );
    }
    builder.build()
}

/// Build a `<presence type="unavailable">` stanza.
pub fn build_unavailable(to: Option<&str>, status: Option<&str>) -> Element {
    let mut builder =
        Element::builder("presence", ns::JABBER_CLIENT).attr(ncname("type"), "unavailable");
    if let Some(to) = to {
        builder = builder.attr(ncname("to"), to);
    }
    if let Some(status) = status.filter(|s| !s.is_empty()) {
        builder =
            builder.append(Element::builder("status", ns::JABBER_CLIENT).append(status).build());
    }
    builder.build()
}

/// Build an `<iq>` with a single payload child.
pub fn build_iq(id: &str, iq_type: &str, to: Option<&str>, payload: Option<Element>) -> Element {
    let mut builder = Element::builder("iq", ns::JABBER_CLIENT)
        .attr(ncname("id"), id)
        .attr(ncname("type"), iq_type);
    if let Some(to) = to {
        builder = builder.attr(ncname("to"), to);
    }
    if let Some(payload) = payload {
        builder = builder.append(payload);
    }
    builder.build()
}

/// Empty `result` answering a server push.
pub fn build_iq_result(request: &Element) -> Element {
    let id = request.attr("id").unwrap_or_default();
    build_iq(id, "result", request.attr("from"), None)
}

/// Whether `stanza` answers an IQ we sent.
pub fn is_iq_response(stanza: &Element) -> bool {
    stanza.name() == "iq" && matches!(stanza.attr("type"), Some("result" | "error"))
}

/// Defined condition of an `error` stanza, e.g. `item-not-found`.
pub fn error_condition(stanza: &Element) -> Option<String> {
    let error = stanza.children().find(|c| c.name() == "error")?;
    error
        .children()
        .find(|c| c.ns() == ns::STANZAS && c.name() != "text")
        .map(|c| c.name().to_string())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_chat_message() {
        let el = build_message("m1", "romeo@montague.lit", "chat", "Hello!");
        assert_eq!(el.name(), "message");
        assert_eq!(el.attr("type"), Some("chat"));
        assert_eq!(el.attr("id"), Some("m1"));
        assert_eq!(el.attr("to"), Some("romeo@montague.lit"));
        let body = el.get_child("body", ns::JABBER_CLIENT).unwrap();
        assert_eq!(body.text(), "Hello!");
    }

    #[test]
    fn build_initial_presence() {
        let el = build_presence(&PresenceContent {
            show: Some("away"),
            status: Some("brb"),
            priority: 5,
            ..Default::default()
        });
        assert_eq!(el.name(), "presence");
        assert!(el.attr("to").is_none());
        assert!(el.attr("type").is_none());
        assert_eq!(el.get_child("show", ns::JABBER_CLIENT).unwrap().text(), "away");
        assert_eq!(el.get_child("status", ns::JABBER_CLIENT).unwrap().text(), "brb");
        assert_eq!(el.get_child("priority", ns::JABBER_CLIENT).unwrap().text(), "5");
        assert!(el.get_child("idle", ns::IDLE).is_none());
    }

    #[test]
    fn presence_with_idle_time() {
        let since = parse_timestamp("2024-03-01T10:00:00Z").unwrap();
        let el = build_presence(&PresenceContent {
            idle_since: Some(since),
            ..Default::default()
        });
        let idle = el.get_child("idle", ns::IDLE).unwrap();
        assert_eq!(idle.attr("since"), Some("2024-03-01T10:00:00Z"));
    }

    #[test]
    fn unavailable_presence() {
        let el = build_unavailable(None, Some("bye"));
        assert_eq!(el.attr("type"), Some("unavailable"));
        assert_eq!(el.get_child("status", ns::JABBER_CLIENT).unwrap().text(), "bye");
    }

    #[test]
    fn iq_helpers() {
        let query = Element::builder("query", ns::ROSTER).build();
        let iq = build_iq("q1", "get", None, Some(query));
        assert_eq!(iq.attr("type"), Some("get"));
        assert!(iq.get_child("query", ns::ROSTER).is_some());
        assert!(!is_iq_response(&iq));

        let result = build_iq("q1", "result", Some("capulet.lit"), None);
        assert!(is_iq_response(&result));
    }

    #[test]
    fn error_condition_is_extracted() {
        let error = Element::builder("error", ns::JABBER_CLIENT)
            .attr(ncname("type"), "cancel")
            .append(Element::builder("item-not-found", ns::STANZAS).build())
            .build();
        let iq = Element::builder("iq", ns::JABBER_CLIENT)
            .attr(ncname("type"), "error")
            .append(error)
            .build();
        assert_eq!(error_condition(&iq).as_deref(), Some("item-not-found"));
    }

    #[test]
    fn jid_string_helpers() {
        assert_eq!(bare_str("juliet@capulet.lit/balcony"), "juliet@capulet.lit");
        assert_eq!(resource_str("juliet@capulet.lit/balcony"), Some("balcony"));
        assert_eq!(resource_str("juliet@capulet.lit"), None);
        assert_eq!(
            parse_bare("juliet@capulet.lit/balcony").unwrap().to_string(),
            "juliet@capulet.lit"
        );
    }
}
