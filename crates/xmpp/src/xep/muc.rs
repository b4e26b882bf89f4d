//! XEP-0045: Multi-User Chat join/leave helpers.

use crate::minidom::Element;

use crate::stanza::{PresenceContent, build_presence, ncname, ns};

/// Build a directed presence to join a MUC room.
///
/// `room_jid_with_nick` should be `room@conference.example.com/nickname`.
/// Room history is not requested since it comes from the room archive.
pub fn build_join_presence(room_jid_with_nick: &str, content: &PresenceContent<'_>) -> Element {
    let muc_ext = Element::builder("x", ns::MUC)
        .append(
            Element::builder("history", ns::MUC)
                .attr(ncname("maxchars"), "0")
                .build(),
        )
        .build();
    let mut presence = build_presence(&PresenceContent {
        to: Some(room_jid_with_nick),
        ..content.clone()
    });
    presence.append_child(muc_ext);
    presence
}

/// Build a presence to leave a MUC room.
pub fn build_leave_presence(room_jid_with_nick: &str) -> Element {
    Element::builder("presence", ns::JABBER_CLIENT)
        .attr(ncname("to"), room_jid_with_nick)
        .attr(ncname("type"), "unavailable")
        .build()
}

/// Extract the nickname (resource part) from a full MUC JID.
///
/// e.g. `room@conference.example.com/nick` → `Some("nick")`
pub fn extract_nick(full_jid: &str) -> Option<&str> {
    full_jid.split_once('/').map(|(_, nick)| nick)
}

/// Check if a presence stanza indicates a MUC self-presence
/// (i.e. the server echoing our own join back to us).
pub fn is_self_presence(element: &Element) -> bool {
    if let Some(x) = element.get_child("x", ns::MUC_USER) {
        for status in x.children().filter(|c| c.name() == "status") {
            // Status code 110 means "this is your own presence"
            if status.attr("code") == Some("110") {
                return true;
            }
        }
    }
    false
}

/// Whether a stanza carries a MUC user payload (room presence or PM).
pub fn has_muc_user(element: &Element) -> bool {
    element.get_child("x", ns::MUC_USER).is_some()
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_presence_has_muc_extension() {
        let el = build_join_presence("room@conference.example.com/Juliet", &PresenceContent {
            show: Some("away"),
            ..Default::default()
        });
        assert_eq!(el.name(), "presence");
        assert!(el.attr("type").is_none()); // Available presence has no type
        assert_eq!(el.attr("to"), Some("room@conference.example.com/Juliet"));
        let x = el.get_child("x", ns::MUC).unwrap();
        assert_eq!(
            x.get_child("history", ns::MUC).unwrap().attr("maxchars"),
            Some("0")
        );
        assert!(el.get_child("show", ns::JABBER_CLIENT).is_some());
    }

    #[test]
    fn leave_presence_is_unavailable() {
        let el = build_leave_presence("room@conference.example.com/Juliet");
        assert_eq!(el.attr("type"), Some("unavailable"));
    }

    #[test]
    fn extract_nick_works() {
        assert_eq!(extract_nick("room@conference.example.com/Juliet"), Some("Juliet"));
        assert_eq!(extract_nick("room@conference.example.com"), None);
    }

    #[test]
    fn self_presence_detection() {
        let status = Element::builder("status", ns::MUC_USER)
            .attr(ncname("code"), "110")
            .build();
        let x = Element::builder("x", ns::MUC_USER).append(status).build();
        let el = Element::builder("presence", ns::JABBER_CLIENT).append(x).build();
        assert!(is_self_presence(&el));
        assert!(has_muc_user(&el));

        let plain = Element::builder("presence", ns::JABBER_CLIENT).build();
        assert!(!is_self_presence(&plain));
    }
}
