//! Account context shared between the client and its modules.

use std::{
    any::Any,
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};

use {
    chrono::{DateTime, Utc},
    gajim_common::{Clock, TimerId, TimerWheel},
    gajim_config::AccountConfig,
    jid::BareJid,
    tracing::{debug, warn},
};

use crate::{
    engine::Engine,
    events::EventKind,
    ged::{Dispatch, Ged},
    minidom::Element,
    state::ClientState,
    storage::ArchiveStore,
    xep::{chat_states::ChatState, disco::DiscoInfo},
};

/// Context a module attaches to an outgoing IQ and gets back with the response.
pub type UserData = Box<dyn Any + Send>;

struct PendingIq {
    module: &'static str,
    user_data: UserData,
}

/// Work a module hands back to the client instead of calling it directly.
#[derive(Debug)]
pub enum Deferred {
    /// Advance the sign-in sequence.
    ConnectMachine { restart: bool },
    /// Offer discovery results to every module.
    PassDisco(DiscoInfo),
    /// The room supports MAM and was just joined.
    RequestMucArchive(BareJid),
    /// We are no longer in the room.
    MucLeft(BareJid),
    JoinMuc { room: BareJid, nick: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerAction {
    Reconnect,
    ChatstatePoll,
    ChatstateDelayed { jid: String, state: ChatState },
}

/// Everything a module may touch while it handles a stanza or a response.
pub struct Core {
    pub(crate) account: String,
    pub(crate) config: AccountConfig,
    pub(crate) own_jid: BareJid,
    domain: String,
    pub(crate) state: ClientState,
    pub(crate) engine: Option<Box<dyn Engine>>,
    pub(crate) generation: u64,
    pub(crate) ged: Arc<Ged>,
    pub(crate) archive: Arc<dyn ArchiveStore>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) timers: TimerWheel<TimerAction>,
    pending_iqs: HashMap<String, PendingIq>,
    deferred: VecDeque<Deferred>,
}

impl Core {
    pub(crate) fn new(
        account: &str,
        config: AccountConfig,
        own_jid: BareJid,
        ged: Arc<Ged>,
        archive: Arc<dyn ArchiveStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let bare = own_jid.to_string();
        let domain = bare.split_once('@').map_or(bare.as_str(), |(_, d)| d).to_string();
        Self {
            account: account.to_string(),
            config,
            own_jid,
            domain,
            state: ClientState::Disconnected,
            engine: None,
            generation: 0,
            ged,
            archive,
            clock,
            timers: TimerWheel::new(),
            pending_iqs: HashMap::new(),
            deferred: VecDeque::new(),
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn config(&self) -> &AccountConfig {
        &self.config
    }

    pub fn own_jid(&self) -> &BareJid {
        &self.own_jid
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Our full JID if bound, the bare account JID otherwise.
    pub fn bound_jid(&self) -> String {
        self.engine
            .as_ref()
            .and_then(|e| e.bound_jid())
            .unwrap_or_else(|| self.own_jid.to_string())
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn archive(&self) -> &Arc<dyn ArchiveStore> {
        &self.archive
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn now_utc(&self) -> DateTime<Utc> {
        self.clock.now_utc()
    }

    pub fn raise(&self, kind: EventKind) -> Dispatch {
        self.ged.raise(&self.account, kind)
    }

    pub fn send_stanza(&mut self, stanza: Element) -> Option<String> {
        match self.engine.as_mut() {
            Some(engine) => engine.send_stanza(stanza),
            None => {
                warn!(account = %self.account, name = stanza.name(), "no engine, dropping stanza");
                None
            },
        }
    }

    /// Send an IQ and route its response to `module` together with `user_data`.
    pub fn send_iq(&mut self, module: &'static str, iq: Element, user_data: UserData) -> Option<String> {
        let Some(id) = iq.attr("id").map(String::from) else {
            warn!(account = %self.account, module, "refusing to send IQ without id");
            return None;
        };
        self.send_stanza(iq)?;
        debug!(account = %self.account, module, id, "IQ sent");
        self.pending_iqs.insert(id.clone(), PendingIq { module, user_data });
        Some(id)
    }

    /// Claim the route of an IQ response.
    pub(crate) fn take_pending_iq(&mut self, id: &str) -> Option<(&'static str, UserData)> {
        self.pending_iqs
            .remove(id)
            .map(|pending| (pending.module, pending.user_data))
    }

    pub(crate) fn clear_pending_iqs(&mut self) {
        if !self.pending_iqs.is_empty() {
            debug!(account = %self.account, count = self.pending_iqs.len(), "dropping pending IQs");
        }
        self.pending_iqs.clear();
    }

    pub fn pending_iq_count(&self) -> usize {
        self.pending_iqs.len()
    }

    pub fn defer(&mut self, action: Deferred) {
        self.deferred.push_back(action);
    }

    pub(crate) fn pop_deferred(&mut self) -> Option<Deferred> {
        self.deferred.pop_front()
    }

    pub fn schedule(&mut self, delay: Duration, action: TimerAction) -> TimerId {
        let now = self.clock.now();
        self.timers.schedule(now, delay, action)
    }

    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        self.timers.cancel(id)
    }
}
