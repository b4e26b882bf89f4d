//! Mock engine and harness shared by the crate's tests.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use {
    chrono::{DateTime, TimeZone, Utc},
    gajim_common::ManualClock,
    gajim_config::{AccountConfig, IdleConfig},
    secrecy::Secret,
    tokio::sync::mpsc,
};

use crate::{
    client::Client,
    context::{AppCommand, Services},
    engine::{
        ConnectionError, ConnectionType, Engine, EngineFactory, EngineOptions, EngineSignal,
        HandlerTable, StanzaHandler,
    },
    error::ClientError,
    events::Event,
    ged::{Ged, HandlerResult, priority},
    minidom::Element,
    stanza::{ncname, ns},
    storage::MemoryArchiveStore,
    xep::disco::build_info_result,
};

pub(crate) const ACCOUNT: &str = "work";
pub(crate) const OWN_JID: &str = "juliet@capulet.lit";
pub(crate) const DOMAIN: &str = "capulet.lit";

/// Everything every engine built by [`MockFactory`] records.
#[derive(Default)]
pub(crate) struct MockState {
    pub connects: usize,
    /// `immediate` flag of every disconnect.
    pub disconnects: Vec<bool>,
    pub sent: Vec<Element>,
    pub error: Option<ConnectionError>,
    pub cert_errors: Vec<String>,
    pub password: Option<Secret<String>>,
    pub ignore_tls: bool,
    /// Make `send_stanza` fail.
    pub refuse_sends: bool,
    pub destroyed: usize,
    pub created: Vec<EngineOptions>,
}

pub(crate) type SharedMock = Arc<Mutex<MockState>>;

fn lock(state: &SharedMock) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct MockEngine {
    state: SharedMock,
    options: EngineOptions,
    handlers: HandlerTable,
}

impl Engine for MockEngine {
    fn connect(&mut self) {
        let mut state = lock(&self.state);
        state.connects += 1;
        state.error = None;
    }

    fn disconnect(&mut self, immediate: bool) {
        lock(&self.state).disconnects.push(immediate);
    }

    fn send_stanza(&mut self, stanza: Element) -> Option<String> {
        let id = stanza.attr("id").map(String::from);
        let mut state = lock(&self.state);
        if state.refuse_sends {
            return None;
        }
        state.sent.push(stanza);
        id.or_else(|| Some(String::new()))
    }

    fn register_handler(&mut self, handler: StanzaHandler) {
        self.handlers.register(handler);
    }

    fn unregister_handler(&mut self, handler: &StanzaHandler) {
        self.handlers.unregister(handler);
    }

    fn matching_handlers(&self, stanza: &Element) -> Vec<StanzaHandler> {
        self.handlers.matching(stanza)
    }

    fn error(&self) -> Option<ConnectionError> {
        lock(&self.state).error.clone()
    }

    fn peer_certificate_errors(&self) -> Vec<String> {
        lock(&self.state).cert_errors.clone()
    }

    fn set_password(&mut self, password: Option<Secret<String>>) {
        lock(&self.state).password = password;
    }

    fn set_ignore_tls_errors(&mut self, ignore: bool) {
        lock(&self.state).ignore_tls = ignore;
    }

    fn connection_types(&self) -> Vec<ConnectionType> {
        self.options.connection_types.clone()
    }

    fn bound_jid(&self) -> Option<String> {
        let resource = self.options.resource.as_deref().unwrap_or("mock");
        Some(format!("{}/{resource}", self.options.jid))
    }

    fn destroy(&mut self) {
        lock(&self.state).destroyed += 1;
    }
}

pub(crate) struct MockFactory {
    state: SharedMock,
}

impl EngineFactory for MockFactory {
    fn create(&self, options: EngineOptions) -> Box<dyn Engine> {
        {
            let mut state = lock(&self.state);
            state.password = options.password.clone();
            state.created.push(options.clone());
        }
        Box::new(MockEngine {
            state: Arc::clone(&self.state),
            options,
            handlers: HandlerTable::default(),
        })
    }
}

pub(crate) fn account_config() -> AccountConfig {
    AccountConfig {
        jid: OWN_JID.into(),
        password: Secret::new("pw".into()),
        resource: "balcony".into(),
        ..Default::default()
    }
}

pub(crate) fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0)
        .single()
        .unwrap_or_default()
}

/// Build a `result` IQ coming from `from`.
pub(crate) fn iq_result(id: &str, from: &str, payload: Option<Element>) -> Element {
    let mut builder = Element::builder("iq", ns::JABBER_CLIENT)
        .attr(ncname("type"), "result")
        .attr(ncname("id"), id)
        .attr(ncname("from"), from);
    if let Some(payload) = payload {
        builder = builder.append(payload);
    }
    builder.build()
}

pub(crate) fn iq_error(id: &str, from: &str, condition: &str) -> Element {
    let error = Element::builder("error", ns::JABBER_CLIENT)
        .attr(ncname("type"), "cancel")
        .append(Element::builder(condition, ns::STANZAS).build())
        .build();
    Element::builder("iq", ns::JABBER_CLIENT)
        .attr(ncname("type"), "error")
        .attr(ncname("id"), id)
        .attr(ncname("from"), from)
        .append(error)
        .build()
}

/// Services wired to a mock engine, a manual clock and a memory store.
pub(crate) struct TestServices {
    pub services: Services,
    pub mock: SharedMock,
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryArchiveStore>,
    pub ged: Arc<Ged>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<AppCommand>>>,
}

impl TestServices {
    pub fn new() -> Self {
        let mock = SharedMock::default();
        let clock = Arc::new(ManualClock::new(start_time()));
        let store = Arc::new(MemoryArchiveStore::new());
        let ged = Arc::new(Ged::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let services = Services {
            ged: Arc::clone(&ged),
            archive: store.clone(),
            clock: clock.clone(),
            factory: Arc::new(MockFactory {
                state: Arc::clone(&mock),
            }),
            commands: tx,
        };
        Self {
            services,
            mock,
            clock,
            store,
            ged,
            receiver: Mutex::new(Some(rx)),
        }
    }

    pub fn mock(&self) -> MutexGuard<'_, MockState> {
        lock(&self.mock)
    }

    pub fn take_receiver(&self) -> mpsc::UnboundedReceiver<AppCommand> {
        self.receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_else(|| panic!("receiver already taken"))
    }
}

/// One client on top of [`TestServices`] plus an event recorder.
pub(crate) struct Harness {
    pub client: Client,
    pub mock: SharedMock,
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryArchiveStore>,
    pub ged: Arc<Ged>,
    pub commands: mpsc::UnboundedReceiver<AppCommand>,
    events: Arc<Mutex<Vec<Event>>>,
}

const RECORDED: &[&str] = &[
    "plain-connection",
    "password-required",
    "ssl-error",
    "our-show",
    "account-connected",
    "account-disconnected",
    "signed-in",
    "simple-notification",
    "feature-discovered",
    "server-disco-received",
    "roster-received",
    "bookmarks-received",
    "muc-joined",
    "vcard-received",
    "blocking-list-received",
    "receipt-received",
    "message-sent",
    "chatstate-update",
    "mam-message-received",
    "mam-decrypted-message-received",
    "archiving-interval-finished",
];

impl Harness {
    pub fn new() -> Self {
        Self::with_config(account_config())
    }

    pub fn with_config(config: AccountConfig) -> Self {
        match Self::try_with_config(config) {
            Ok(harness) => harness,
            Err(e) => panic!("failed to build client: {e}"),
        }
    }

    pub fn try_with_config(config: AccountConfig) -> Result<Self, ClientError> {
        let t = TestServices::new();
        let client = Client::new(ACCOUNT, config, IdleConfig::default(), &t.services)?;
        let events = Arc::new(Mutex::new(Vec::new()));
        for name in RECORDED {
            let events = Arc::clone(&events);
            t.ged
                .register_event_handler(name, priority::POSTGUI, move |event| {
                    events
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(event.clone());
                    Ok(HandlerResult::Continue)
                });
        }
        let commands = t.take_receiver();
        Ok(Self {
            client,
            mock: t.mock,
            clock: t.clock,
            store: t.store,
            ged: t.ged,
            commands,
            events,
        })
    }

    pub fn mock(&self) -> MutexGuard<'_, MockState> {
        lock(&self.mock)
    }

    pub fn clock_utc(&self) -> DateTime<Utc> {
        use gajim_common::Clock;
        self.clock.now_utc()
    }

    pub fn signal(&mut self, signal: EngineSignal) {
        let generation = self.client.generation();
        self.client.process_signal(generation, signal);
    }

    /// Let the current engine fail with `error`.
    pub fn fail_with(&mut self, error: ConnectionError) {
        self.mock().error = Some(error);
        self.signal(EngineSignal::Disconnected);
    }

    pub fn sent(&self) -> Vec<Element> {
        self.mock().sent.clone()
    }

    pub fn take_sent(&self) -> Vec<Element> {
        std::mem::take(&mut self.mock().sent)
    }

    /// Most recent IQ carrying a payload in `ns`.
    pub fn find_iq(&self, ns: &str) -> Option<Element> {
        self.find_iq_to(ns, None)
    }

    pub fn find_iq_to(&self, ns: &str, to: Option<&str>) -> Option<Element> {
        self.mock()
            .sent
            .iter()
            .rev()
            .find(|s| {
                s.name() == "iq"
                    && s.children().any(|c| c.ns() == ns)
                    && (to.is_none() || s.attr("to") == to)
            })
            .cloned()
    }

    pub fn reply(&mut self, iq: &Element, payload: Option<Element>) {
        let id = iq.attr("id").unwrap_or_default();
        let from = iq.attr("to").unwrap_or(OWN_JID);
        self.signal(EngineSignal::StanzaReceived(iq_result(id, from, payload)));
    }

    pub fn reply_error(&mut self, iq: &Element, condition: &str) {
        let id = iq.attr("id").unwrap_or_default();
        let from = iq.attr("to").unwrap_or(OWN_JID);
        self.signal(EngineSignal::StanzaReceived(iq_error(id, from, condition)));
    }

    /// Answer every sign-in request once the engine reported `Connected`.
    pub fn sign_in(&mut self, features: &[&str]) {
        let server = self
            .find_iq_to(ns::DISCO_INFO, Some(DOMAIN))
            .unwrap_or_else(|| panic!("no server disco sent"));
        let account = self
            .find_iq_to(ns::DISCO_INFO, Some(OWN_JID))
            .unwrap_or_else(|| panic!("no account disco sent"));
        let items = self
            .find_iq(ns::DISCO_ITEMS)
            .unwrap_or_else(|| panic!("no items disco sent"));

        self.reply(&account, Some(build_info_result(&[("server", "im")], features)));
        self.reply(&items, Some(Element::builder("query", ns::DISCO_ITEMS).build()));
        self.reply(&server, Some(build_info_result(&[("server", "im")], features)));

        let metacontacts = self.find_iq(ns::PRIVATE).unwrap_or_else(|| panic!("no metacontacts request"));
        self.reply(&metacontacts, Some(Element::builder("query", ns::PRIVATE).build()));

        let delimiter = self.find_iq(ns::PRIVATE).unwrap_or_else(|| panic!("no delimiter request"));
        let payload = Element::builder("query", ns::PRIVATE)
            .append(
                Element::builder("roster", ns::ROSTER_DELIMITER)
                    .append("::")
                    .build(),
            )
            .build();
        self.reply(&delimiter, Some(payload));

        let roster = self.find_iq(ns::ROSTER).unwrap_or_else(|| panic!("no roster request"));
        self.reply(&roster, Some(Element::builder("query", ns::ROSTER).build()));
    }

    pub fn connect_and_sign_in(&mut self, features: &[&str]) {
        self.client.connect(false);
        self.signal(EngineSignal::Connected);
        self.sign_in(features);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn event_names(&self) -> Vec<&'static str> {
        self.events().iter().map(Event::name).collect()
    }

    /// Record which of a POSTCORE and a GUI1 listener saw `event`, in order.
    pub fn record_order(&self, event: &str) -> Arc<Mutex<Vec<&'static str>>> {
        let order = Arc::new(Mutex::new(Vec::new()));
        for (prio, label) in [(priority::GUI1, "gui1"), (priority::POSTCORE, "postcore")] {
            let order = Arc::clone(&order);
            self.ged.register_event_handler(event, prio, move |_| {
                order
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(label);
                Ok(HandlerResult::Continue)
            });
        }
        order
    }
}
