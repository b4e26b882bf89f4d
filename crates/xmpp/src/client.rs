//! Per-account connection state machine.
//!
//! A [`Client`] owns the [`Core`] of one account, its [`ModuleSet`] and the
//! current protocol engine. It is driven from outside by three inputs:
//! engine signals ([`Client::process_signal`]), user commands
//! ([`Client::handle_command`]) and due timers ([`Client::fire_due_timers`]).

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use {
    chrono::{DateTime, Utc},
    gajim_common::TimerId,
    gajim_config::{AccountConfig, IdleConfig, Show, account::RANDOM_RESOURCE},
    jid::BareJid,
    secrecy::Secret,
    tokio::sync::mpsc,
    tracing::{debug, info, warn},
};

use crate::{
    context::{AppCommand, Services},
    core::{Core, Deferred, TimerAction},
    engine::{ConnectionType, EngineFactory, EngineOptions, EngineSignal, ErrorDomain},
    error::ClientError,
    events::{EventKind, PasswordResponder, PlainConnectionResponder, Responder, TlsResponder},
    idle::IdleState,
    minidom::Element,
    modules::{
        Module, ModuleSet, NamedModule, StanzaOutcome,
        blocking::Blocking,
        bookmarks::Bookmarks,
        chatstate::{ChatContact, Chatstate},
        delimiter::Delimiter,
        discovery::Discovery,
        mam::Mam,
        metacontacts::MetaContacts,
        muc::Muc,
        presence::Presence,
        roster::Roster,
        vcard_temp::VCardTemp,
    },
    stanza::{PresenceContent, bare_str, build_iq, build_message, is_iq_response, ncname, new_id, ns},
    state::{AccountSnapshot, ClientState, ConnectPhase},
    storage::{LogEntry, MessageKind},
    xep::{chat_states::ChatState, oob},
};

/// Flat delay before every reconnect attempt.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageType {
    #[default]
    Chat,
    Groupchat,
    Normal,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Groupchat => "groupchat",
            Self::Normal => "normal",
        }
    }
}

/// A message the user wants to send.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    pub to: String,
    pub body: String,
    pub message_type: MessageType,
    pub chatstate: Option<ChatState>,
    pub oob_url: Option<String>,
    pub request_receipt: bool,
}

/// Requests delivered to a client through the runtime.
#[derive(Debug)]
pub enum ClientCommand {
    Connect,
    Disconnect {
        gracefully: bool,
        reconnect: bool,
        destroy_client: bool,
    },
    ChangeStatus { show: Show, message: String },
    PasswordProvided(Secret<String>),
    ConfirmPlainConnection,
    AbortConnect,
    AcceptTlsErrors { ignore_permanently: bool },
    SendMessage(OutgoingMessage),
    JoinMuc { room: String, nick: Option<String> },
    LeaveMuc { room: String },
    RequestArchiveInterval {
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    },
    SetChatstate { contact: ChatContact, state: ChatState },
}

pub struct Client {
    core: Core,
    modules: ModuleSet,
    factory: Arc<dyn EngineFactory>,
    commands: mpsc::UnboundedSender<AppCommand>,
    idle_config: IdleConfig,
    phase: ConnectPhase,
    status: Show,
    status_message: String,
    our_show: String,
    idle_state: IdleState,
    idle_since: Option<DateTime<Utc>>,
    status_sync_on_resume: bool,
    reconnect: bool,
    destroy_client: bool,
    remove_account: bool,
    reconnect_timer: Option<TimerId>,
    password: Option<Secret<String>>,
    tls_errors: Vec<String>,
}

impl Client {
    pub fn new(
        account: &str,
        config: AccountConfig,
        idle_config: IdleConfig,
        services: &Services,
    ) -> Result<Self, ClientError> {
        let own_jid = config
            .jid
            .parse::<BareJid>()
            .map_err(|e| ClientError::InvalidJid {
                jid: config.jid.clone(),
                reason: e.to_string(),
            })?;
        let password = config.saved_password();
        let core = Core::new(
            account,
            config,
            own_jid,
            Arc::clone(&services.ged),
            Arc::clone(&services.archive),
            Arc::clone(&services.clock),
        );
        let mut client = Self {
            core,
            modules: ModuleSet::new(),
            factory: Arc::clone(&services.factory),
            commands: services.commands.clone(),
            idle_config,
            phase: ConnectPhase::Idle,
            status: Show::Online,
            status_message: String::new(),
            our_show: Show::Offline.as_str().to_string(),
            idle_state: IdleState::Awake,
            idle_since: None,
            status_sync_on_resume: false,
            reconnect: false,
            destroy_client: false,
            remove_account: false,
            reconnect_timer: None,
            password,
            tls_errors: Vec::new(),
        };
        client.modules.register(&client.core);
        client.create_client();
        Ok(client)
    }

    pub fn account(&self) -> &str {
        self.core.account()
    }

    pub fn state(&self) -> ClientState {
        self.core.state()
    }

    pub fn phase(&self) -> ConnectPhase {
        self.phase
    }

    pub fn core(&self) -> &Core {
        &self.core
    }

    pub fn status(&self) -> Show {
        self.status
    }

    pub fn status_message(&self) -> &str {
        &self.status_message
    }

    /// Last value raised as `our-show`.
    pub fn our_show(&self) -> &str {
        &self.our_show
    }

    /// Generation of the current engine.
    pub fn generation(&self) -> u64 {
        self.core.generation
    }

    pub fn is_reconnect_scheduled(&self) -> bool {
        self.reconnect_timer
            .is_some_and(|id| self.core.timers.is_scheduled(id))
    }

    pub fn snapshot(&self) -> AccountSnapshot {
        AccountSnapshot {
            state: self.core.state(),
            show: self.our_show.clone(),
            bound_jid: self
                .core
                .engine
                .as_ref()
                .filter(|_| !self.core.state().is_disconnected())
                .and_then(|e| e.bound_jid()),
        }
    }

    /// Look up a module by name.
    pub fn get_module(&self, name: &str) -> Option<&dyn Module> {
        self.modules.get(name)
    }

    pub fn module<M: Module + NamedModule>(&self) -> Option<&M> {
        self.modules.typed()
    }

    /// Run `f` against a module, then process whatever it deferred.
    pub fn with_module<M: Module + NamedModule, R>(
        &mut self,
        f: impl FnOnce(&mut M, &mut Core) -> R,
    ) -> Option<R> {
        let result = self.call_module(f);
        self.run_deferred();
        result
    }

    fn call_module<M: Module + NamedModule, R>(
        &mut self,
        f: impl FnOnce(&mut M, &mut Core) -> R,
    ) -> Option<R> {
        let Self { core, modules, .. } = self;
        match modules.typed_mut::<M>() {
            Some(module) => Some(f(module, core)),
            None => {
                warn!(account = %core.account(), module = M::NAME, "module not registered");
                None
            },
        }
    }

    pub fn set_remove_account(&mut self, value: bool) {
        self.remove_account = value;
    }

    fn set_state(&mut self, state: ClientState) {
        if self.core.state == state {
            return;
        }
        info!(account = %self.core.account(), from = %self.core.state, to = %state, "state changed");
        self.core.state = state;
        let Self { core, modules, .. } = self;
        for module in modules.iter_mut() {
            module.on_state_changed(core, state);
        }
    }

    fn set_our_show(&mut self, show: &str) {
        self.our_show = show.to_string();
        self.core.raise(EventKind::OurShow {
            show: show.to_string(),
        });
    }

    fn responder(&self) -> Responder {
        Responder::new(self.core.account(), self.commands.clone())
    }

    /// Build a fresh engine for the next connection attempt.
    fn create_client(&mut self) {
        self.core.generation += 1;
        let config = self.core.config();
        let connection_types = if config.use_plain_connection {
            vec![ConnectionType::Plain]
        } else {
            vec![ConnectionType::DirectTls, ConnectionType::StartTls]
        };
        let options = EngineOptions {
            account: self.core.account().to_string(),
            generation: self.core.generation,
            jid: self.core.own_jid().to_string(),
            resource: config.render_resource(),
            password: self.password.clone(),
            anonymous: config.anonymous_auth,
            connection_types,
            ignored_tls_errors: config.ignored_tls_errors.clone(),
        };
        debug!(account = %self.core.account(), generation = options.generation, resource = ?options.resource, "creating engine");
        let mut engine = self.factory.create(options);
        for handler in self.modules.get_handlers() {
            engine.register_handler(handler);
        }
        self.core.engine = Some(engine);
    }

    fn destroy_engine(&mut self) {
        if let Some(mut engine) = self.core.engine.take() {
            for handler in self.modules.get_handlers() {
                engine.unregister_handler(&handler);
            }
            engine.destroy();
        }
    }

    fn recreate_engine(&mut self) {
        self.destroy_engine();
        self.destroy_client = false;
        self.create_client();
    }

    pub fn connect(&mut self, ignore_all_errors: bool) {
        let state = self.core.state();
        if !(state.is_disconnected() || state.is_reconnect_scheduled()) {
            debug!(account = %self.core.account(), %state, "connect ignored");
            return;
        }
        info!(account = %self.core.account(), "connect");
        self.reconnect = true;
        self.disable_reconnect_timer();
        if self.core.engine.is_none() {
            self.create_client();
        }
        if let Some(engine) = self.core.engine.as_mut() {
            engine.set_ignore_tls_errors(ignore_all_errors);
        }
        self.set_state(ClientState::Connecting);

        let config = self.core.config();
        if config.use_plain_connection && config.confirm_unencrypted_connection {
            info!(account = %self.core.account(), "asking before connecting without encryption");
            let responder = PlainConnectionResponder(self.responder());
            self.core.raise(EventKind::PlainConnection { responder });
            return;
        }
        self.engine_connect();
    }

    fn engine_connect(&mut self) {
        if let Some(engine) = self.core.engine.as_mut() {
            engine.connect();
        }
    }

    fn confirm_plain_connection(&mut self) {
        if !self.core.state().is_connecting() {
            warn!(account = %self.core.account(), state = %self.core.state(), "no connection waiting for confirmation");
            return;
        }
        self.engine_connect();
    }

    /// Feed a signal from the engine of `generation`.
    pub fn process_signal(&mut self, generation: u64, signal: EngineSignal) {
        if generation != self.core.generation {
            debug!(account = %self.core.account(), generation, current = self.core.generation, "ignoring signal of a discarded engine");
            return;
        }
        match signal {
            EngineSignal::Connected => self.on_connected(),
            EngineSignal::Disconnected => self.on_disconnected(),
            EngineSignal::ConnectionFailed => {
                info!(account = %self.core.account(), "connection failed");
                self.on_disconnected();
            },
            EngineSignal::ResumeSuccessful => self.on_resume_successful(),
            EngineSignal::ResumeFailed => self.on_resume_failed(),
            EngineSignal::StanzaSent(stanza) => {
                self.core.raise(EventKind::StanzaSent { stanza });
            },
            EngineSignal::StanzaReceived(stanza) => self.dispatch_stanza(&stanza),
        }
        self.run_deferred();
    }

    fn on_connected(&mut self) {
        self.set_state(ClientState::Connected);
        self.phase = ConnectPhase::Idle;
        self.call_module::<Mam, _>(|mam, _| mam.reset_state());
        self.call_module::<Discovery, _>(|disco, core| {
            disco.discover_server_info(core);
            disco.discover_account_info(core);
            disco.discover_server_items(core);
        });
    }

    fn on_disconnected(&mut self) {
        let error = self.core.engine.as_ref().and_then(|e| e.error());
        info!(
            account = %self.core.account(),
            error = error.as_ref().map(ToString::to_string),
            reconnect = self.reconnect,
            "disconnected"
        );
        self.set_state(ClientState::Disconnected);
        self.core.clear_pending_iqs();
        self.phase = ConnectPhase::Idle;

        let mut retry_ignoring_tls = false;
        if self.remove_account {
            self.reconnect = false;
            self.destroy_client = true;
        } else if let Some(error) = error {
            match error.domain {
                ErrorDomain::BadCertificate => {
                    self.reconnect = false;
                    self.destroy_client = true;
                    self.tls_errors = self
                        .core
                        .engine
                        .as_ref()
                        .map(|e| e.peer_certificate_errors())
                        .unwrap_or_default();
                    if self.tls_errors.is_empty() {
                        info!(account = %self.core.account(), "certificate rejected without details, retrying");
                        retry_ignoring_tls = true;
                    } else {
                        let responder = TlsResponder(self.responder());
                        self.core.raise(EventKind::SslError {
                            errors: self.tls_errors.clone(),
                            responder,
                        });
                    }
                },
                ErrorDomain::Stream | ErrorDomain::Bind if error.is_resource_conflict() => {
                    info!(account = %self.core.account(), "resource conflict, picking a random resource");
                    self.core.config.resource = RANDOM_RESOURCE.to_string();
                    self.destroy_client = true;
                },
                ErrorDomain::Sasl => {
                    self.reconnect = false;
                    self.destroy_client = true;
                    if error.is_auth_failure() {
                        let responder = PasswordResponder(self.responder());
                        self.core.raise(EventKind::PasswordRequired { responder });
                    }
                    self.core.raise(EventKind::SimpleNotification {
                        kind: "connection-failed".into(),
                        title: "Authentication failed".into(),
                        text: error.text.clone().unwrap_or(error.condition),
                    });
                },
                _ => {},
            }
        }

        if self.reconnect {
            self.after_disconnect();
            self.schedule_reconnect();
            self.set_our_show("error");
        } else {
            self.set_our_show(Show::Offline.as_str());
            self.after_disconnect();
        }

        if retry_ignoring_tls {
            self.connect(true);
        }
    }

    fn after_disconnect(&mut self) {
        self.disable_reconnect_timer();
        if self.destroy_client {
            self.recreate_engine();
        }
        self.core.raise(EventKind::AccountDisconnected);
        if self.remove_account {
            let name = self.core.account().to_string();
            if self.commands.send(AppCommand::RemoveAccount { name }).is_err() {
                warn!(account = %self.core.account(), "runtime gone, account not removed");
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        self.set_state(ClientState::ReconnectScheduled);
        self.disable_reconnect_timer();
        info!(account = %self.core.account(), delay_secs = RECONNECT_DELAY.as_secs(), "reconnect scheduled");
        self.reconnect_timer = Some(self.core.schedule(RECONNECT_DELAY, TimerAction::Reconnect));
    }

    fn disable_reconnect_timer(&mut self) {
        if let Some(id) = self.reconnect_timer.take() {
            self.core.cancel_timer(id);
        }
    }

    fn abort_reconnect(&mut self) {
        info!(account = %self.core.account(), "connection attempt aborted");
        self.set_state(ClientState::Disconnected);
        self.disable_reconnect_timer();
        self.set_our_show(Show::Offline.as_str());
        if self.destroy_client {
            self.recreate_engine();
        }
    }

    fn on_resume_successful(&mut self) {
        info!(account = %self.core.account(), "stream resumed");
        self.set_state(ClientState::Connected);
        self.set_client_available();
        if self.status_sync_on_resume {
            self.status_sync_on_resume = false;
            self.update_presence(true);
        } else {
            // No presence reflection arrives when nothing changed.
            self.set_our_show(self.status.as_str());
        }
    }

    fn on_resume_failed(&mut self) {
        info!(account = %self.core.account(), "stream resumption failed");
        self.set_our_show(Show::Offline.as_str());
    }

    fn set_client_available(&mut self) {
        self.set_state(ClientState::Available);
        self.core.raise(EventKind::AccountConnected);
    }

    pub fn disconnect(&mut self, gracefully: bool, reconnect: bool, destroy_client: bool) {
        if self.core.state().is_disconnecting() {
            warn!(account = %self.core.account(), "disconnect already in progress");
            return;
        }
        self.set_state(ClientState::Disconnecting);
        self.reconnect = reconnect;
        self.destroy_client = destroy_client;
        info!(account = %self.core.account(), gracefully, reconnect, destroy_client, "starting to disconnect");
        match self.core.engine.as_mut() {
            Some(engine) => engine.disconnect(!gracefully),
            None => self.on_disconnected(),
        }
    }

    /// Single entry point for presence changes requested by the user.
    pub fn change_status(&mut self, show: Show, message: &str) {
        let state = self.core.state();
        info!(account = %self.core.account(), %show, %state, "change status");

        if state.is_disconnecting() {
            warn!(account = %self.core.account(), "can't change status while disconnecting");
            return;
        }

        if state.is_disconnected() {
            if show.is_offline() {
                return;
            }
            self.set_status(show, message);
            self.connect(false);
            return;
        }

        if state.is_connecting() {
            if show.is_offline() {
                self.disconnect(false, false, true);
            } else {
                self.set_status(show, message);
            }
            return;
        }

        if state.is_reconnect_scheduled() {
            if show.is_offline() {
                self.destroy_client = true;
                self.abort_reconnect();
            } else {
                self.set_status(show, message);
                self.connect(false);
            }
            return;
        }

        if show.is_offline() {
            self.call_module::<Presence, _>(|presence, core| presence.send_unavailable(core, message));
            self.disconnect(true, false, true);
            return;
        }

        self.set_status(show, message);
        if state.is_available() {
            self.update_presence(true);
        }
    }

    fn set_status(&mut self, show: Show, message: &str) {
        self.status = show;
        self.status_message = message.to_string();
    }

    /// Show, status message and idle time to publish right now.
    pub fn get_presence_state(&self) -> (Show, String, Option<DateTime<Utc>>) {
        if self.idle_state.is_awake() || !matches!(self.status, Show::Online | Show::Chat) {
            return (self.status, self.status_message.clone(), None);
        }
        let key = self.idle_state.as_str();
        if !self.idle_config.enabled_for(key) {
            return (self.status, self.status_message.clone(), self.idle_since);
        }
        let show = match self.idle_state {
            IdleState::Xa => Show::Xa,
            _ => Show::Away,
        };
        let message = self
            .idle_config
            .idle_status_message(key, &self.status_message);
        (show, message, self.idle_since)
    }

    fn presence_content<'a>(&self, show: Show, message: &'a str, idle_since: Option<DateTime<Utc>>) -> PresenceContent<'a> {
        PresenceContent {
            to: None,
            show: show.presence_show(),
            status: Some(message),
            priority: self.core.config().get_priority(show),
            idle_since,
        }
    }

    /// Publish our presence, optionally to joined rooms too.
    pub fn update_presence(&mut self, include_muc: bool) {
        let (show, message, idle_since) = self.get_presence_state();
        self.call_module::<Presence, _>(|presence, core| {
            presence.send_presence(core, show, &message, idle_since);
        });
        if include_muc {
            let content = self.presence_content(show, &message, idle_since);
            self.call_module::<Muc, _>(|muc, core| muc.update_presence(core, &content));
        }
        self.set_our_show(show.as_str());
    }

    /// Idle monitor callback.
    pub fn set_idle_state(&mut self, state: IdleState, idle_since: Option<DateTime<Utc>>) {
        let (before_show, before_message, _) = self.get_presence_state();
        self.idle_state = state;
        self.idle_since = if state.is_awake() {
            None
        } else {
            idle_since
        };
        let (after_show, after_message, _) = self.get_presence_state();
        if before_show == after_show && before_message == after_message {
            return;
        }
        info!(account = %self.core.account(), idle = %state, show = %after_show, "idle state changed");
        if self.core.state().is_available() {
            self.update_presence(true);
        } else {
            self.status_sync_on_resume = true;
        }
    }

    /// Advance the sign-in sequence by one step.
    pub fn connect_machine(&mut self, restart: bool) {
        if restart {
            self.phase = ConnectPhase::Idle;
        }
        if self.phase == ConnectPhase::Finished {
            warn!(account = %self.core.account(), "sign-in already finished");
            return;
        }
        if !self.core.state().is_connected() {
            warn!(account = %self.core.account(), state = %self.core.state(), "sign-in step outside of a session");
            return;
        }
        self.phase = self.phase.next();
        info!(account = %self.core.account(), phase = ?self.phase, "connect machine");
        match self.phase {
            ConnectPhase::Idle => {},
            ConnectPhase::DiscoveringMetacontacts => {
                self.call_module::<MetaContacts, _>(|m, core| m.get_metacontacts(core));
            },
            ConnectPhase::RequestingDelimiter => {
                self.call_module::<Delimiter, _>(|m, core| m.get_roster_delimiter(core));
            },
            ConnectPhase::RequestingRoster => {
                self.call_module::<Roster, _>(|m, core| m.request_roster(core));
            },
            ConnectPhase::Finished => self.finish_connect(),
        }
    }

    fn finish_connect(&mut self) {
        self.status_sync_on_resume = false;
        self.set_client_available();
        // A fresh session is in no rooms yet.
        self.update_presence(false);

        self.call_module::<VCardTemp, _>(|m, core| m.request_vcard(core));
        self.call_module::<Bookmarks, _>(|m, core| m.request_bookmarks(core));
        self.call_module::<Blocking, _>(|m, core| m.get_blocking_list(core));

        self.core.raise(EventKind::SignedIn);

        self.call_module::<Mam, _>(|mam, core| {
            if mam.available() {
                mam.request_archive_on_signin(core);
            }
        });

        let autojoin: Vec<(String, Option<String>)> = self
            .core
            .config()
            .muc_rooms
            .iter()
            .filter(|(_, room)| room.autojoin)
            .map(|(jid, room)| (jid.clone(), room.nick.clone()))
            .collect();
        for (room, nick) in autojoin {
            match room.parse::<BareJid>() {
                Ok(room) => {
                    if let Err(e) = self.join_muc(&room, nick) {
                        warn!(account = %self.core.account(), %room, "autojoin failed: {e}");
                    }
                },
                Err(e) => warn!(account = %self.core.account(), room, "invalid room JID: {e}"),
            }
        }
    }

    pub fn join_muc(&mut self, room: &BareJid, nick: Option<String>) -> Result<(), ClientError> {
        self.ensure_available()?;
        let nick = nick.unwrap_or_else(|| self.core.config().muc_nick(&room.to_string()));
        let (show, message, idle_since) = self.get_presence_state();
        let content = self.presence_content(show, &message, idle_since);
        self.call_module::<Muc, _>(|muc, core| muc.join(core, room, &nick, &content));
        Ok(())
    }

    fn ensure_available(&self) -> Result<(), ClientError> {
        if self.core.state().is_available() {
            Ok(())
        } else {
            Err(ClientError::NotAvailable(
                self.core.account().to_string(),
                self.core.state(),
            ))
        }
    }

    /// Send a message. Returns its id.
    pub fn send_message(&mut self, message: OutgoingMessage) -> Result<String, ClientError> {
        self.ensure_available()?;
        let id = new_id();
        let mut stanza = build_message(&id, &message.to, message.message_type.as_str(), &message.body);
        if let Some(state) = message.chatstate {
            stanza.append_child(Element::builder(state.as_str(), ns::CHAT_STATES).build());
        }
        if let Some(url) = &message.oob_url {
            stanza.append_child(oob::build_oob(url, None));
        }
        if message.request_receipt && message.message_type != MessageType::Groupchat {
            stanza.append_child(Element::builder("request", ns::RECEIPTS).build());
        }
        self.core.send_stanza(stanza);

        self.core.raise(EventKind::MessageSent {
            jid: message.to.clone(),
            message: message.body.clone(),
            message_id: Some(id.clone()),
        });

        if message.message_type == MessageType::Chat {
            let entry = LogEntry {
                account: self.core.account().to_string(),
                jid: bare_str(&message.to).to_string(),
                timestamp: self.core.now_utc().timestamp(),
                kind: MessageKind::ChatMsgSent,
                message: message.body,
                contact_name: None,
                stanza_id: None,
                message_id: Some(id.clone()),
                archive: self.core.own_jid().to_string(),
                oob_url: message.oob_url,
            };
            if let Err(e) = self.core.archive().insert_into_logs(entry) {
                warn!(account = %self.core.account(), "failed to log sent message: {e:#}");
            }
        }
        Ok(id)
    }

    /// Route a received stanza to the pending IQ or the matching handlers.
    pub fn dispatch_stanza(&mut self, stanza: &Element) {
        self.core.raise(EventKind::StanzaReceived {
            stanza: stanza.clone(),
        });

        if is_iq_response(stanza)
            && let Some(id) = stanza.attr("id")
            && let Some((module, user_data)) = self.core.take_pending_iq(id)
        {
            let Self { core, modules, .. } = self;
            match modules.get_mut(module) {
                Some(handler) => {
                    if let Err(e) = handler.on_iq_response(core, stanza, user_data) {
                        warn!(account = %core.account(), module, "IQ response handler failed: {e:#}");
                    }
                },
                None => warn!(account = %core.account(), module, "response for an unregistered module"),
            }
            return;
        }

        let handlers = self
            .core
            .engine
            .as_ref()
            .map(|e| e.matching_handlers(stanza))
            .unwrap_or_default();
        for handler in &handlers {
            let Self { core, modules, .. } = self;
            let Some(module) = modules.get_mut(handler.module) else {
                continue;
            };
            match module.handle_stanza(core, handler.tag, stanza) {
                Ok(StanzaOutcome::Processed) => break,
                Ok(StanzaOutcome::Continue) => {},
                Err(e) => {
                    warn!(account = %core.account(), module = handler.module, tag = handler.tag, "stanza handler failed: {e:#}");
                },
            }
        }

        if handlers.is_empty()
            && stanza.name() == "iq"
            && matches!(stanza.attr("type"), Some("get" | "set"))
        {
            self.reply_service_unavailable(stanza);
        }
    }

    fn reply_service_unavailable(&mut self, request: &Element) {
        let error = Element::builder("error", ns::JABBER_CLIENT)
            .attr(ncname("type"), "cancel")
            .append(Element::builder("service-unavailable", ns::STANZAS).build())
            .build();
        let id = request.attr("id").unwrap_or_default();
        self.core
            .send_stanza(build_iq(id, "error", request.attr("from"), Some(error)));
    }

    fn run_deferred(&mut self) {
        while let Some(action) = self.core.pop_deferred() {
            match action {
                Deferred::ConnectMachine { restart } => self.connect_machine(restart),
                Deferred::PassDisco(info) => {
                    let Self { core, modules, .. } = self;
                    for module in modules.iter_mut() {
                        module.pass_disco(core, &info);
                    }
                },
                Deferred::RequestMucArchive(room) => {
                    self.call_module::<Mam, _>(|mam, core| {
                        mam.add_muc_archive(&room);
                        mam.request_archive_on_muc_join(core, &room);
                    });
                },
                Deferred::MucLeft(room) => {
                    self.call_module::<Mam, _>(|mam, _| mam.remove_muc_archive(&room));
                },
                Deferred::JoinMuc { room, nick } => {
                    if let Err(e) = self.join_muc(&room, nick) {
                        warn!(account = %self.core.account(), %room, "join failed: {e}");
                    }
                },
            }
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.core.timers.next_deadline()
    }

    /// Fire every timer that is due. Returns how many fired.
    pub fn fire_due_timers(&mut self) -> usize {
        let now = self.core.now();
        let due = self.core.timers.pop_due(now);
        let count = due.len();
        for (_, action) in due {
            self.on_timer(action);
        }
        count
    }

    fn on_timer(&mut self, action: TimerAction) {
        match action {
            TimerAction::Reconnect => {
                self.reconnect_timer = None;
                if self.reconnect {
                    self.connect(false);
                }
            },
            TimerAction::ChatstatePoll => {
                self.call_module::<Chatstate, _>(|c, core| c.check_last_interaction(core));
            },
            TimerAction::ChatstateDelayed { jid, state } => {
                self.call_module::<Chatstate, _>(|c, core| c.on_delay_elapsed(core, &jid, state));
            },
        }
        self.run_deferred();
    }

    fn on_password(&mut self, password: Secret<String>) {
        if self.core.config().savepass {
            self.core.config.password = password.clone();
        }
        self.password = Some(password.clone());
        if let Some(engine) = self.core.engine.as_mut() {
            engine.set_password(Some(password));
        }
        self.connect(false);
    }

    fn accept_tls_errors(&mut self, ignore_permanently: bool) {
        let errors = std::mem::take(&mut self.tls_errors);
        if ignore_permanently {
            let ignored = &mut self.core.config.ignored_tls_errors;
            for error in errors {
                if !ignored.contains(&error) {
                    ignored.push(error);
                }
            }
            self.recreate_engine();
        }
        self.connect(true);
    }

    pub fn handle_command(&mut self, command: ClientCommand) {
        debug!(account = %self.core.account(), ?command, "command");
        match command {
            ClientCommand::Connect => self.connect(false),
            ClientCommand::Disconnect {
                gracefully,
                reconnect,
                destroy_client,
            } => self.disconnect(gracefully, reconnect, destroy_client),
            ClientCommand::ChangeStatus { show, message } => self.change_status(show, &message),
            ClientCommand::PasswordProvided(password) => self.on_password(password),
            ClientCommand::ConfirmPlainConnection => self.confirm_plain_connection(),
            ClientCommand::AbortConnect => self.abort_reconnect(),
            ClientCommand::AcceptTlsErrors { ignore_permanently } => {
                self.accept_tls_errors(ignore_permanently);
            },
            ClientCommand::SendMessage(message) => {
                if let Err(e) = self.send_message(message) {
                    warn!(account = %self.core.account(), "message not sent: {e}");
                }
            },
            ClientCommand::JoinMuc { room, nick } => match room.parse::<BareJid>() {
                Ok(room) => {
                    if let Err(e) = self.join_muc(&room, nick) {
                        warn!(account = %self.core.account(), %room, "join failed: {e}");
                    }
                },
                Err(e) => warn!(account = %self.core.account(), room, "invalid room JID: {e}"),
            },
            ClientCommand::LeaveMuc { room } => {
                if let Ok(room) = room.parse::<BareJid>() {
                    self.call_module::<Muc, _>(|muc, core| muc.leave(core, &room));
                }
            },
            ClientCommand::RequestArchiveInterval { start, end } => {
                self.call_module::<Mam, _>(|mam, core| {
                    mam.request_archive_interval(core, start, end);
                });
            },
            ClientCommand::SetChatstate { contact, state } => {
                self.call_module::<Chatstate, _>(|c, core| c.set_chatstate(core, &contact, state));
            },
        }
        self.run_deferred();
    }

    /// Drop the engine, the modules and every timer.
    pub fn cleanup(&mut self) {
        info!(account = %self.core.account(), "cleanup");
        self.destroy_client = true;
        self.disable_reconnect_timer();
        self.destroy_engine();
        let Self { core, modules, .. } = self;
        modules.unregister(core);
        self.core.timers.clear();
        self.core.clear_pending_iqs();
    }

    /// Shut down for application exit.
    pub fn quit(&mut self, kill_core: bool) {
        if !kill_core {
            return;
        }
        let state = self.core.state();
        if state.is_reconnect_scheduled() {
            self.abort_reconnect();
        } else if state.is_connecting() || state.is_connected() || state.is_available() {
            self.disconnect(true, false, false);
        }
    }
}
