//! XEP-0085 chat states we send and receive.
//!
//! While enabled, a poll timer downgrades our state per contact: composing
//! turns paused after [`PAUSED_AFTER`] without typing, and any state turns
//! inactive after [`INACTIVE_AFTER`] without interaction. Inactive and gone
//! are never downgraded further.

use std::{
    collections::{HashMap, HashSet},
    time::{Duration, Instant},
};

use {
    anyhow::Result,
    gajim_common::TimerId,
    gajim_config::SendChatstate,
    tracing::{debug, info},
};

use crate::{
    core::{Core, TimerAction},
    engine::StanzaHandler,
    events::EventKind,
    minidom::Element,
    modules::{Module, NamedModule, StanzaOutcome},
    stanza::{bare_str, new_id, ns},
    state::ClientState,
    xep::{
        chat_states::{ChatState, build_chat_state, parse_chat_state},
        muc,
    },
};

pub const INACTIVE_AFTER: Duration = Duration::from_secs(60);
pub const PAUSED_AFTER: Duration = Duration::from_secs(10);
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Delay before a deferred state is sent.
pub const DELAY: Duration = Duration::from_secs(2);

/// What the chat state logic needs to know about a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatContact {
    /// Bare JID, or the full occupant JID for private messages.
    pub jid: String,
    pub is_groupchat: bool,
    pub is_pm: bool,
    pub available: bool,
    pub supports_chatstates: bool,
    /// Per-contact override of the account policy.
    pub send_chatstate: Option<SendChatstate>,
}

impl ChatContact {
    pub fn chat(jid: &str) -> Self {
        Self {
            jid: jid.to_string(),
            is_groupchat: false,
            is_pm: false,
            available: true,
            supports_chatstates: true,
            send_chatstate: None,
        }
    }

    pub fn groupchat(room: &str) -> Self {
        Self {
            is_groupchat: true,
            ..Self::chat(room)
        }
    }
}

pub struct Chatstate {
    enabled: bool,
    default_policy: SendChatstate,
    /// Our current state per contact.
    chatstates: HashMap<String, ChatState>,
    /// Last state received from each contact.
    remote: HashMap<String, ChatState>,
    last_keyboard_activity: HashMap<String, Instant>,
    last_mouse_activity: HashMap<String, Instant>,
    contacts: HashMap<String, ChatContact>,
    poll_timer: Option<TimerId>,
    delay_timers: HashMap<String, TimerId>,
    blocked: HashSet<String>,
}

impl NamedModule for Chatstate {
    const NAME: &'static str = "Chatstate";
}

impl Chatstate {
    pub fn new(default_policy: SendChatstate) -> Self {
        Self {
            enabled: false,
            default_policy,
            chatstates: HashMap::new(),
            remote: HashMap::new(),
            last_keyboard_activity: HashMap::new(),
            last_mouse_activity: HashMap::new(),
            contacts: HashMap::new(),
            poll_timer: None,
            delay_timers: HashMap::new(),
            blocked: HashSet::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    fn policy(&self, contact: &ChatContact) -> SendChatstate {
        contact.send_chatstate.unwrap_or(self.default_policy)
    }

    fn remember(&mut self, contact: &ChatContact) {
        self.contacts.insert(contact.jid.clone(), contact.clone());
    }

    pub fn set_enabled(&mut self, core: &mut Core, value: bool) {
        if self.enabled == value {
            return;
        }
        info!(account = %core.account(), "chatstate module {}", if value { "enabled" } else { "disabled" });
        self.enabled = value;
        if value {
            self.poll_timer = Some(core.schedule(POLL_INTERVAL, TimerAction::ChatstatePoll));
        } else {
            self.reset(core);
        }
    }

    /// Our current state towards `jid`.
    pub fn chatstate(&self, jid: &str) -> Option<ChatState> {
        self.chatstates.get(jid).copied()
    }

    pub fn get_remote_chatstate(&self, jid: &str) -> Option<ChatState> {
        self.remote.get(jid).copied()
    }

    /// Poll tick: downgrade stale states and schedule the next tick.
    pub fn check_last_interaction(&mut self, core: &mut Core) {
        self.poll_timer = None;
        if !self.enabled {
            return;
        }
        let now = core.now();
        let jids: Vec<String> = self.last_mouse_activity.keys().cloned().collect();
        for jid in jids {
            let Some(current) = self.chatstates.get(&jid).copied() else {
                self.last_mouse_activity.remove(&jid);
                self.last_keyboard_activity.remove(&jid);
                continue;
            };
            if matches!(current, ChatState::Gone | ChatState::Inactive) {
                continue;
            }

            let mouse = self.last_mouse_activity.get(&jid).copied().unwrap_or(now);
            let new_state = if now.duration_since(mouse) > INACTIVE_AFTER {
                Some(ChatState::Inactive)
            } else if current == ChatState::Composing {
                let keyboard = self
                    .last_keyboard_activity
                    .get(&jid)
                    .copied()
                    .unwrap_or(mouse);
                (now.duration_since(keyboard) > PAUSED_AFTER).then_some(ChatState::Paused)
            } else {
                None
            };

            if let Some(state) = new_state
                && Some(state) != self.chatstates.get(&jid).copied()
                && let Some(contact) = self.contacts.get(&jid).cloned()
            {
                self.set_chatstate(core, &contact, state);
            }
        }
        self.poll_timer = Some(core.schedule(POLL_INTERVAL, TimerAction::ChatstatePoll));
    }

    pub fn set_active(&mut self, core: &mut Core, contact: &ChatContact) {
        if !self.enabled || self.policy(contact) == SendChatstate::Disabled {
            return;
        }
        self.remember(contact);
        self.last_mouse_activity.insert(contact.jid.clone(), core.now());
        self.chatstates.insert(contact.jid.clone(), ChatState::Active);
    }

    /// State to attach to an outgoing message, if any.
    pub fn get_active_chatstate(&mut self, core: &mut Core, contact: &ChatContact) -> Option<ChatState> {
        if self.policy(contact) == SendChatstate::Disabled {
            return None;
        }
        if !contact.is_groupchat {
            if bare_str(&contact.jid) == core.own_jid().to_string() {
                return None;
            }
            if !contact.supports_chatstates {
                return None;
            }
        }
        self.set_active(core, contact);
        Some(ChatState::Active)
    }

    /// Suppress chat states towards a contact, e.g. while cycling nick completions.
    pub fn block_chatstates(&mut self, contact: &ChatContact, block: bool) {
        if !self.enabled {
            return;
        }
        if block {
            self.blocked.insert(contact.jid.clone());
        } else {
            self.blocked.remove(&contact.jid);
        }
    }

    /// Send `state` after [`DELAY`] unless something else is sent first.
    pub fn set_chatstate_delayed(&mut self, core: &mut Core, contact: &ChatContact, state: ChatState) {
        if !self.enabled {
            return;
        }
        self.remove_delay_timeout(core, &contact.jid);
        self.remember(contact);
        let id = core.schedule(DELAY, TimerAction::ChatstateDelayed {
            jid: contact.jid.clone(),
            state,
        });
        self.delay_timers.insert(contact.jid.clone(), id);
    }

    /// A delayed state came due.
    pub fn on_delay_elapsed(&mut self, core: &mut Core, jid: &str, state: ChatState) {
        self.delay_timers.remove(jid);
        if let Some(contact) = self.contacts.get(jid).cloned() {
            self.set_chatstate(core, &contact, state);
        }
    }

    pub fn set_chatstate(&mut self, core: &mut Core, contact: &ChatContact, state: ChatState) {
        if !self.enabled {
            return;
        }
        if bare_str(&contact.jid) == core.own_jid().to_string() {
            return;
        }
        if self.blocked.contains(&contact.jid) {
            return;
        }
        self.remove_delay_timeout(core, &contact.jid);
        self.remember(contact);
        let current = self.chatstates.get(&contact.jid).copied();
        let policy = self.policy(contact);

        if policy == SendChatstate::Disabled {
            // One last active so the contact does not see us typing forever.
            if current.is_some() {
                info!(account = %core.account(), jid = %contact.jid, "chat states disabled, sending last active");
                self.send_chatstate(core, contact, ChatState::Active);
            }
            self.chatstates.remove(&contact.jid);
            self.last_mouse_activity.remove(&contact.jid);
            self.last_keyboard_activity.remove(&contact.jid);
            return;
        }

        if !contact.is_groupchat {
            if !contact.available {
                debug!(account = %core.account(), jid = %contact.jid, "contact offline");
                return;
            }
            if !contact.supports_chatstates {
                debug!(account = %core.account(), jid = %contact.jid, "chat states not supported");
                return;
            }
        }

        if matches!(state, ChatState::Active | ChatState::Composing) {
            self.last_mouse_activity.insert(contact.jid.clone(), core.now());
        }

        let state = match (policy, state) {
            (SendChatstate::ComposingOnly, ChatState::Inactive | ChatState::Gone) => ChatState::Active,
            (_, state) => state,
        };

        if current == Some(state) {
            return;
        }
        self.send_chatstate(core, contact, state);
        self.chatstates.insert(contact.jid.clone(), state);
    }

    fn send_chatstate(&mut self, core: &mut Core, contact: &ChatContact, state: ChatState) {
        if !core.state().is_available() {
            debug!(account = %core.account(), "not available, chat state not sent");
            return;
        }
        info!(account = %core.account(), jid = %contact.jid, %state, "send chat state");
        let msg_type = if contact.is_groupchat { "groupchat" } else { "chat" };
        core.send_stanza(build_chat_state(&new_id(), &contact.jid, msg_type, state));
    }

    pub fn set_mouse_activity(&mut self, core: &mut Core, contact: &ChatContact, was_paused: bool) {
        if !self.enabled || self.policy(contact) == SendChatstate::Disabled {
            return;
        }
        self.remember(contact);
        self.last_mouse_activity.insert(contact.jid.clone(), core.now());
        if self.chatstates.get(&contact.jid) == Some(&ChatState::Inactive) {
            let state = if was_paused {
                ChatState::Paused
            } else {
                ChatState::Active
            };
            self.set_chatstate(core, contact, state);
        }
    }

    pub fn set_keyboard_activity(&mut self, core: &mut Core, contact: &ChatContact) {
        if !self.enabled {
            return;
        }
        self.remember(contact);
        self.last_keyboard_activity
            .insert(contact.jid.clone(), core.now());
    }

    pub fn remove_delay_timeout(&mut self, core: &mut Core, jid: &str) {
        if let Some(id) = self.delay_timers.remove(jid) {
            core.cancel_timer(id);
        }
    }

    pub fn remove_all_delay_timeouts(&mut self, core: &mut Core) {
        for (_, id) in self.delay_timers.drain() {
            core.cancel_timer(id);
        }
    }

    fn reset(&mut self, core: &mut Core) {
        self.remove_all_delay_timeouts(core);
        if let Some(id) = self.poll_timer.take() {
            core.cancel_timer(id);
        }
        self.chatstates.clear();
        self.remote.clear();
        self.last_keyboard_activity.clear();
        self.last_mouse_activity.clear();
        self.contacts.clear();
        self.blocked.clear();
    }

    fn remote_key(stanza: &Element, from: &str) -> String {
        if muc::has_muc_user(stanza) {
            from.to_string()
        } else {
            bare_str(from).to_string()
        }
    }

    fn on_presence(&mut self, core: &mut Core, stanza: &Element) {
        if !self.enabled || !matches!(stanza.attr("type"), Some("unavailable" | "error")) {
            return;
        }
        let Some(from) = stanza.attr("from") else {
            return;
        };
        if from == core.own_jid().to_string() {
            return;
        }
        let jid = Self::remote_key(stanza, from);
        self.remote.remove(&jid);
        self.chatstates.remove(&jid);
        self.last_mouse_activity.remove(&jid);
        self.last_keyboard_activity.remove(&jid);
        debug!(account = %core.account(), jid, "reset chat state");

        let is_groupchat = muc::has_muc_user(stanza) && muc::is_self_presence(stanza);
        if !is_groupchat {
            core.raise(EventKind::ChatstateUpdate {
                jid,
                chatstate: None,
            });
        }
    }

    fn on_message(&mut self, core: &mut Core, stanza: &Element) {
        let Some(state) = parse_chat_state(stanza) else {
            return;
        };
        let Some(from) = stanza.attr("from") else {
            return;
        };
        let is_self = bare_str(from) == core.own_jid().to_string();
        let is_groupchat = stanza.attr("type") == Some("groupchat");
        let is_mam = stanza.get_child("result", ns::MAM_2).is_some();
        let is_sent_carbon = stanza.get_child("sent", ns::CARBONS).is_some();
        if is_self || is_groupchat || is_mam || is_sent_carbon {
            return;
        }
        let jid = Self::remote_key(stanza, from);
        info!(account = %core.account(), %state, jid, "received chat state");
        self.remote.insert(jid.clone(), state);
        core.raise(EventKind::ChatstateUpdate {
            jid,
            chatstate: Some(state),
        });
    }
}

impl Module for Chatstate {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn handlers(&self) -> Vec<StanzaHandler> {
        vec![
            StanzaHandler::new("presence", Self::NAME, "presence"),
            StanzaHandler::new("message", Self::NAME, "message")
                .ns(ns::CHAT_STATES)
                .priority(46),
        ]
    }

    fn handle_stanza(
        &mut self,
        core: &mut Core,
        tag: &'static str,
        stanza: &Element,
    ) -> Result<StanzaOutcome> {
        match tag {
            "presence" => self.on_presence(core, stanza),
            _ => self.on_message(core, stanza),
        }
        Ok(StanzaOutcome::Continue)
    }

    fn on_state_changed(&mut self, core: &mut Core, state: ClientState) {
        if state.is_disconnected() {
            self.set_enabled(core, false);
        } else if state.is_connected() {
            self.set_enabled(core, true);
        }
    }

    fn cleanup(&mut self, core: &mut Core) {
        self.reset(core);
    }
}
