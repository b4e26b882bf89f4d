//! XEP-0191 blocking command.

use std::collections::BTreeSet;

use {anyhow::Result, tracing::{debug, info, warn}};

use crate::{
    core::{Core, UserData},
    engine::StanzaHandler,
    events::EventKind,
    minidom::Element,
    modules::{Module, NamedModule, StanzaOutcome},
    stanza::{bare_str, build_iq, build_iq_result, new_id, ns},
    xep::disco::DiscoInfo,
};

#[derive(Debug, Default)]
pub struct Blocking {
    supported: bool,
    blocked: BTreeSet<String>,
}

impl NamedModule for Blocking {
    const NAME: &'static str = "Blocking";
}

fn item_jids(el: &Element) -> impl Iterator<Item = String> + '_ {
    el.children()
        .filter(|c| c.name() == "item")
        .filter_map(|c| c.attr("jid").map(String::from))
}

impl Blocking {
    pub fn supported(&self) -> bool {
        self.supported
    }

    pub fn is_blocked(&self, jid: &str) -> bool {
        self.blocked.contains(jid)
    }

    pub fn get_blocking_list(&mut self, core: &mut Core) {
        if !self.supported {
            return;
        }
        let payload = Element::builder("blocklist", ns::BLOCKING).build();
        let iq = build_iq(&new_id(), "get", None, Some(payload));
        core.send_iq(Self::NAME, iq, Box::new(()));
    }

    fn raise_list(&self, core: &Core) {
        core.raise(EventKind::BlockingListReceived {
            jids: self.blocked.iter().cloned().collect(),
        });
    }
}

impl Module for Blocking {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn handlers(&self) -> Vec<StanzaHandler> {
        vec![
            StanzaHandler::new("iq", Self::NAME, "push")
                .ns(ns::BLOCKING)
                .typ("set"),
        ]
    }

    fn handle_stanza(
        &mut self,
        core: &mut Core,
        _tag: &'static str,
        stanza: &Element,
    ) -> Result<StanzaOutcome> {
        if let Some(from) = stanza.attr("from")
            && bare_str(from) != core.own_jid().to_string()
        {
            warn!(account = %core.account(), from, "ignoring blocking push from foreign entity");
            return Ok(StanzaOutcome::Processed);
        }
        if let Some(block) = stanza.get_child("block", ns::BLOCKING) {
            self.blocked.extend(item_jids(block));
        } else if let Some(unblock) = stanza.get_child("unblock", ns::BLOCKING) {
            let jids: Vec<String> = item_jids(unblock).collect();
            if jids.is_empty() {
                self.blocked.clear();
            }
            for jid in jids {
                self.blocked.remove(&jid);
            }
        }
        debug!(account = %core.account(), count = self.blocked.len(), "blocking push");
        core.send_stanza(build_iq_result(stanza));
        self.raise_list(core);
        Ok(StanzaOutcome::Processed)
    }

    fn on_iq_response(&mut self, core: &mut Core, response: &Element, _user_data: UserData) -> Result<()> {
        if response.attr("type") == Some("error") {
            warn!(account = %core.account(), "blocking list request failed");
            return Ok(());
        }
        self.blocked = response
            .get_child("blocklist", ns::BLOCKING)
            .map(|list| item_jids(list).collect())
            .unwrap_or_default();
        info!(account = %core.account(), count = self.blocked.len(), "blocking list received");
        self.raise_list(core);
        Ok(())
    }

    fn pass_disco(&mut self, core: &mut Core, info: &DiscoInfo) {
        if info.jid == core.domain() && info.supports(ns::BLOCKING) {
            self.supported = true;
            core.raise(EventKind::FeatureDiscovered {
                feature: ns::BLOCKING.to_string(),
            });
        }
    }
}
