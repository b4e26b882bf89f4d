//! XEP-0085: Chat State Notifications.

use std::{fmt, str::FromStr};

use crate::minidom::Element;

use crate::stanza::{ncname, ns};

/// Chat state types per XEP-0085.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatState {
    Active,
    Composing,
    Paused,
    Inactive,
    Gone,
}

impl ChatState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Composing => "composing",
            Self::Paused => "paused",
            Self::Inactive => "inactive",
            Self::Gone => "gone",
        }
    }
}

impl fmt::Display for ChatState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChatState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "composing" => Ok(Self::Composing),
            "paused" => Ok(Self::Paused),
            "inactive" => Ok(Self::Inactive),
            "gone" => Ok(Self::Gone),
            other => Err(format!("unknown chat state: {other}")),
        }
    }
}

/// Build a standalone chat state notification.
///
/// This creates a `<message>` with a chat state child element and no `<body>`.
pub fn build_chat_state(id: &str, to: &str, msg_type: &str, state: ChatState) -> Element {
    Element::builder("message", ns::JABBER_CLIENT)
        .attr(ncname("id"), id)
        .attr(ncname("to"), to)
        .attr(ncname("type"), msg_type)
        .append(Element::builder(state.as_str(), ns::CHAT_STATES).build())
        .build()
}

/// Parse a chat state from a message element, if present.
pub fn parse_chat_state(element: &Element) -> Option<ChatState> {
    element
        .children()
        .find(|child| child.ns() == ns::CHAT_STATES)
        .and_then(|child| child.name().parse().ok())
}
