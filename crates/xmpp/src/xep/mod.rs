//! XEP (XMPP Extension Protocol) payload builders and parsers.

pub mod chat_states;
pub mod disco;
pub mod mam;
pub mod muc;
pub mod oob;
