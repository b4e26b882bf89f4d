//! XEP-0054 own vCard.

use {anyhow::Result, tracing::debug};

use crate::{
    core::{Core, UserData},
    events::EventKind,
    minidom::Element,
    modules::{Module, NamedModule},
    stanza::{build_iq, new_id, ns},
};

#[derive(Debug, Default)]
pub struct VCardTemp {
    nickname: Option<String>,
}

impl NamedModule for VCardTemp {
    const NAME: &'static str = "VCardTemp";
}

impl VCardTemp {
    pub fn nickname(&self) -> Option<&str> {
        self.nickname.as_deref()
    }

    pub fn request_vcard(&mut self, core: &mut Core) {
        let own = core.own_jid().to_string();
        let vcard = Element::builder("vCard", ns::VCARD).build();
        let iq = build_iq(&new_id(), "get", Some(&own), Some(vcard));
        core.send_iq(Self::NAME, iq, Box::new(()));
    }
}

impl Module for VCardTemp {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn on_iq_response(&mut self, core: &mut Core, response: &Element, _user_data: UserData) -> Result<()> {
        if response.attr("type") == Some("error") {
            debug!(account = %core.account(), "no vcard published");
            return Ok(());
        }
        self.nickname = response
            .get_child("vCard", ns::VCARD)
            .and_then(|v| v.get_child("NICKNAME", ns::VCARD))
            .map(|n| n.text())
            .filter(|n| !n.is_empty());
        core.raise(EventKind::VcardReceived {
            nickname: self.nickname.clone(),
        });
        Ok(())
    }
}
