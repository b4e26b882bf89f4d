//! XEP-0209 metacontact tags from private storage.

use std::collections::HashMap;

use {anyhow::Result, tracing::{debug, info}};

use crate::{
    core::{Core, Deferred, UserData},
    minidom::Element,
    modules::{Module, NamedModule},
    stanza::{build_iq, new_id, ns},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaContact {
    pub tag: String,
    pub order: Option<u32>,
}

#[derive(Debug, Default)]
pub struct MetaContacts {
    contacts: HashMap<String, MetaContact>,
}

impl NamedModule for MetaContacts {
    const NAME: &'static str = "MetaContacts";
}

impl MetaContacts {
    pub fn get_metacontacts(&mut self, core: &mut Core) {
        let query = Element::builder("query", ns::PRIVATE)
            .append(Element::builder("storage", ns::METACONTACTS).build())
            .build();
        let iq = build_iq(&new_id(), "get", None, Some(query));
        core.send_iq(Self::NAME, iq, Box::new(()));
    }

    pub fn get(&self, jid: &str) -> Option<&MetaContact> {
        self.contacts.get(jid)
    }
}

impl Module for MetaContacts {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn on_iq_response(&mut self, core: &mut Core, response: &Element, _user_data: UserData) -> Result<()> {
        if response.attr("type") == Some("error") {
            info!(account = %core.account(), "metacontacts not available");
        } else if let Some(storage) = response
            .get_child("query", ns::PRIVATE)
            .and_then(|q| q.get_child("storage", ns::METACONTACTS))
        {
            self.contacts = storage
                .children()
                .filter(|c| c.name() == "meta")
                .filter_map(|c| {
                    let jid = c.attr("jid")?.to_string();
                    let tag = c.attr("tag")?.to_string();
                    let order = c.attr("order").and_then(|o| o.parse().ok());
                    Some((jid, MetaContact { tag, order }))
                })
                .collect();
            debug!(account = %core.account(), count = self.contacts.len(), "metacontacts received");
        }
        core.defer(Deferred::ConnectMachine { restart: false });
        Ok(())
    }
}
