//! XEP-0184 message delivery receipts.

use {anyhow::Result, tracing::debug};

use crate::{
    core::Core,
    engine::StanzaHandler,
    events::EventKind,
    minidom::Element,
    modules::{Module, NamedModule, StanzaOutcome},
    stanza::{bare_str, ncname, new_id, ns},
};

#[derive(Debug, Default)]
pub struct Receipts;

impl NamedModule for Receipts {
    const NAME: &'static str = "Receipts";
}

pub fn build_receipt(id: &str, to: &str, receipt_id: &str) -> Element {
    Element::builder("message", ns::JABBER_CLIENT)
        .attr(ncname("id"), id)
        .attr(ncname("to"), to)
        .append(
            Element::builder("received", ns::RECEIPTS)
                .attr(ncname("id"), receipt_id)
                .build(),
        )
        .build()
}

impl Module for Receipts {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn handlers(&self) -> Vec<StanzaHandler> {
        vec![
            StanzaHandler::new("message", Self::NAME, "receipt")
                .ns(ns::RECEIPTS)
                .priority(48),
        ]
    }

    fn handle_stanza(
        &mut self,
        core: &mut Core,
        _tag: &'static str,
        stanza: &Element,
    ) -> Result<StanzaOutcome> {
        let Some(from) = stanza.attr("from") else {
            return Ok(StanzaOutcome::Continue);
        };

        if let Some(received) = stanza.get_child("received", ns::RECEIPTS) {
            if let Some(receipt_id) = received.attr("id") {
                core.raise(EventKind::ReceiptReceived {
                    jid: from.to_string(),
                    receipt_id: receipt_id.to_string(),
                });
            }
            return Ok(StanzaOutcome::Continue);
        }

        let wants_receipt = stanza.get_child("request", ns::RECEIPTS).is_some();
        let is_groupchat = stanza.attr("type") == Some("groupchat");
        let from_self = bare_str(from) == core.own_jid().to_string();
        if wants_receipt
            && !is_groupchat
            && !from_self
            && core.state().is_available()
            && let Some(id) = stanza.attr("id")
        {
            debug!(account = %core.account(), to = from, "sending receipt");
            core.send_stanza(build_receipt(&new_id(), from, id));
        }
        Ok(StanzaOutcome::Continue)
    }
}
