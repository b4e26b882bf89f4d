//! Our own presence and the presence of our contacts.

use std::collections::HashMap;

use {
    anyhow::Result,
    chrono::{DateTime, Utc},
    gajim_config::Show,
    tracing::debug,
};

use crate::{
    core::Core,
    engine::StanzaHandler,
    minidom::Element,
    modules::{Module, NamedModule, StanzaOutcome},
    stanza::{PresenceContent, build_presence, build_unavailable, ns},
    state::ClientState,
    xep::muc,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactPresence {
    pub show: String,
    pub status: Option<String>,
}

#[derive(Debug, Default)]
pub struct Presence {
    /// Available resources, keyed by full JID.
    contacts: HashMap<String, ContactPresence>,
}

impl NamedModule for Presence {
    const NAME: &'static str = "Presence";
}

impl Presence {
    /// Broadcast an available presence.
    pub fn send_presence(
        &mut self,
        core: &mut Core,
        show: Show,
        status: &str,
        idle_since: Option<DateTime<Utc>>,
    ) {
        let priority = core.config().get_priority(show);
        let stanza = build_presence(&PresenceContent {
            to: None,
            show: show.presence_show(),
            status: Some(status),
            priority,
            idle_since,
        });
        debug!(account = %core.account(), %show, priority, "sending presence");
        core.send_stanza(stanza);
    }

    pub fn send_unavailable(&mut self, core: &mut Core, status: &str) {
        core.send_stanza(build_unavailable(None, Some(status)));
    }

    /// Presence of one resource.
    pub fn get_presence(&self, full_jid: &str) -> Option<&ContactPresence> {
        self.contacts.get(full_jid)
    }

    fn on_presence(&mut self, stanza: &Element) {
        let Some(from) = stanza.attr("from") else {
            return;
        };
        if muc::has_muc_user(stanza) {
            return;
        }
        match stanza.attr("type") {
            None => {
                let show = stanza
                    .get_child("show", ns::JABBER_CLIENT)
                    .map(|s| s.text())
                    .unwrap_or_else(|| "online".to_string());
                let status = stanza
                    .get_child("status", ns::JABBER_CLIENT)
                    .map(|s| s.text());
                self.contacts
                    .insert(from.to_string(), ContactPresence { show, status });
            },
            Some("unavailable" | "error") => {
                self.contacts.remove(from);
            },
            Some(_) => {},
        }
    }
}

impl Module for Presence {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn handlers(&self) -> Vec<StanzaHandler> {
        vec![StanzaHandler::new("presence", Self::NAME, "presence")]
    }

    fn handle_stanza(
        &mut self,
        _core: &mut Core,
        _tag: &'static str,
        stanza: &Element,
    ) -> Result<StanzaOutcome> {
        self.on_presence(stanza);
        Ok(StanzaOutcome::Continue)
    }

    fn on_state_changed(&mut self, _core: &mut Core, state: ClientState) {
        if state.is_disconnected() {
            self.contacts.clear();
        }
    }
}
