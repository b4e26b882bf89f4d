//! Protocol feature modules.
//!
//! Every account owns one instance of each module in a [`ModuleSet`].
//! Modules receive the stanzas matched by their [`StanzaHandler`]s and the
//! responses to the IQs they sent, always together with the account's
//! [`Core`].

pub mod blocking;
pub mod bookmarks;
pub mod chatstate;
pub mod delimiter;
pub mod discovery;
pub mod mam;
pub mod metacontacts;
pub mod muc;
pub mod presence;
pub mod receipts;
pub mod roster;
pub mod vcard_temp;

use std::any::Any;

use tracing::debug;

use crate::{
    core::{Core, UserData},
    engine::StanzaHandler,
    minidom::Element,
    state::ClientState,
    xep::disco::DiscoInfo,
};

pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Whether lower-priority handlers should still see a stanza.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaOutcome {
    Continue,
    Processed,
}

pub trait Module: AsAny + Send + 'static {
    fn name(&self) -> &'static str;

    fn handlers(&self) -> Vec<StanzaHandler> {
        Vec::new()
    }

    fn handle_stanza(
        &mut self,
        _core: &mut Core,
        _tag: &'static str,
        _stanza: &Element,
    ) -> anyhow::Result<StanzaOutcome> {
        Ok(StanzaOutcome::Continue)
    }

    fn on_iq_response(
        &mut self,
        _core: &mut Core,
        _response: &Element,
        _user_data: UserData,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Discovery results for the server or our own account.
    fn pass_disco(&mut self, _core: &mut Core, _info: &DiscoInfo) {}

    fn on_state_changed(&mut self, _core: &mut Core, _state: ClientState) {}

    fn cleanup(&mut self, _core: &mut Core) {}
}

/// Modules addressable by type.
pub trait NamedModule {
    const NAME: &'static str;
}

/// The module instances of one account.
#[derive(Default)]
pub struct ModuleSet {
    modules: Vec<Box<dyn Module>>,
}

impl ModuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instantiate every module. A second call is a no-op.
    pub fn register(&mut self, core: &Core) -> bool {
        if !self.modules.is_empty() {
            return false;
        }
        self.modules = vec![
            Box::new(discovery::Discovery::default()),
            Box::new(metacontacts::MetaContacts::default()),
            Box::new(delimiter::Delimiter::default()),
            Box::new(roster::Roster::default()),
            Box::new(presence::Presence::default()),
            Box::new(muc::Muc::default()),
            Box::new(bookmarks::Bookmarks::default()),
            Box::new(vcard_temp::VCardTemp::default()),
            Box::new(blocking::Blocking::default()),
            Box::new(receipts::Receipts::default()),
            Box::new(mam::Mam::default()),
            Box::new(chatstate::Chatstate::new(core.config().send_chatstate)),
        ];
        debug!(account = %core.account(), count = self.modules.len(), "modules registered");
        true
    }

    /// Drop every module after letting it clean up.
    pub fn unregister(&mut self, core: &mut Core) {
        for module in &mut self.modules {
            module.cleanup(core);
        }
        self.modules.clear();
    }

    pub fn is_registered(&self) -> bool {
        !self.modules.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&dyn Module> {
        self.modules
            .iter()
            .find(|m| m.name() == name)
            .map(|m| &**m)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut (dyn Module + 'static)> {
        self.modules
            .iter_mut()
            .find(|m| m.name() == name)
            .map(|m| &mut **m)
    }

    pub fn typed<M: Module + NamedModule>(&self) -> Option<&M> {
        self.get(M::NAME)?.as_any().downcast_ref()
    }

    pub fn typed_mut<M: Module + NamedModule>(&mut self) -> Option<&mut M> {
        self.get_mut(M::NAME)?.as_any_mut().downcast_mut()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.modules.iter().map(|m| m.name()).collect()
    }

    /// Stanza handlers of all modules.
    pub fn get_handlers(&self) -> Vec<StanzaHandler> {
        self.modules.iter().flat_map(|m| m.handlers()).collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn Module>> {
        self.modules.iter_mut()
    }
}
