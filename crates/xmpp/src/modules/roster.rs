//! RFC 6121 roster with versioning and pushes.

use std::collections::BTreeMap;

use {anyhow::Result, tracing::{debug, info, warn}};

use crate::{
    core::{Core, Deferred, UserData},
    engine::StanzaHandler,
    events::EventKind,
    minidom::Element,
    modules::{Module, NamedModule, StanzaOutcome},
    stanza::{bare_str, build_iq, build_iq_result, ncname, new_id, ns},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterItem {
    pub jid: String,
    pub name: Option<String>,
    /// `none`, `to`, `from`, `both` or `remove`.
    pub subscription: String,
    pub ask: Option<String>,
    pub groups: Vec<String>,
}

impl RosterItem {
    fn parse(item: &Element) -> Option<Self> {
        Some(Self {
            jid: item.attr("jid")?.to_string(),
            name: item.attr("name").map(String::from),
            subscription: item.attr("subscription").unwrap_or("none").to_string(),
            ask: item.attr("ask").map(String::from),
            groups: item
                .children()
                .filter(|c| c.name() == "group")
                .map(|c| c.text())
                .collect(),
        })
    }
}

#[derive(Debug, Default)]
pub struct Roster {
    items: BTreeMap<String, RosterItem>,
    version: Option<String>,
}

impl NamedModule for Roster {
    const NAME: &'static str = "Roster";
}

impl Roster {
    pub fn items(&self) -> impl Iterator<Item = &RosterItem> {
        self.items.values()
    }

    pub fn get_item(&self, jid: &str) -> Option<&RosterItem> {
        self.items.get(jid)
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Request the roster, sending our cached version if we have one.
    pub fn request_roster(&mut self, core: &mut Core) {
        let mut query = Element::builder("query", ns::ROSTER);
        if let Some(version) = &self.version {
            query = query.attr(ncname("ver"), version.as_str());
        }
        let iq = build_iq(&new_id(), "get", None, Some(query.build()));
        core.send_iq(Self::NAME, iq, Box::new(()));
    }

    fn apply_items(&mut self, query: &Element) -> Vec<RosterItem> {
        let mut changed = Vec::new();
        for item in query
            .children()
            .filter(|c| c.name() == "item")
            .filter_map(RosterItem::parse)
        {
            if item.subscription == "remove" {
                self.items.remove(&item.jid);
            } else {
                self.items.insert(item.jid.clone(), item.clone());
            }
            changed.push(item);
        }
        if let Some(version) = query.attr("ver") {
            self.version = Some(version.to_string());
        }
        changed
    }

    fn on_push(&mut self, core: &mut Core, stanza: &Element) {
        if let Some(from) = stanza.attr("from")
            && bare_str(from) != core.own_jid().to_string()
        {
            warn!(account = %core.account(), from, "ignoring roster push from foreign entity");
            return;
        }
        let Some(query) = stanza.get_child("query", ns::ROSTER) else {
            return;
        };
        let changed = self.apply_items(query);
        debug!(account = %core.account(), count = changed.len(), "roster push");
        core.send_stanza(build_iq_result(stanza));
        core.raise(EventKind::RosterReceived {
            items: changed,
            received_from_server: true,
        });
    }
}

impl Module for Roster {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn handlers(&self) -> Vec<StanzaHandler> {
        vec![
            StanzaHandler::new("iq", Self::NAME, "push")
                .ns(ns::ROSTER)
                .typ("set"),
        ]
    }

    fn handle_stanza(
        &mut self,
        core: &mut Core,
        _tag: &'static str,
        stanza: &Element,
    ) -> Result<StanzaOutcome> {
        self.on_push(core, stanza);
        Ok(StanzaOutcome::Processed)
    }

    fn on_iq_response(&mut self, core: &mut Core, response: &Element, _user_data: UserData) -> Result<()> {
        if response.attr("type") == Some("error") {
            warn!(account = %core.account(), "roster request failed");
        } else {
            match response.get_child("query", ns::ROSTER) {
                Some(query) => {
                    self.items.clear();
                    self.apply_items(query);
                    info!(account = %core.account(), count = self.items.len(), "roster received");
                    core.raise(EventKind::RosterReceived {
                        items: self.items.values().cloned().collect(),
                        received_from_server: true,
                    });
                },
                None => {
                    // Our cached version is current.
                    debug!(account = %core.account(), "roster unchanged");
                    core.raise(EventKind::RosterReceived {
                        items: self.items.values().cloned().collect(),
                        received_from_server: false,
                    });
                },
            }
        }
        core.defer(Deferred::ConnectMachine { restart: false });
        Ok(())
    }
}
