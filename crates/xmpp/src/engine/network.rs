//! [`Engine`] backed by `tokio_xmpp::Client`.
//!
//! Each connection attempt spawns a task that owns the client, reads events
//! from it, and accepts outbound stanzas via an `mpsc` channel. The task
//! ends with the stream: reconnecting is the state machine's decision, so
//! the client is never left to reconnect on its own.

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    anyhow::Result,
    futures::StreamExt,
    secrecy::{ExposeSecret, Secret},
    tokio::sync::mpsc,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use tokio_xmpp::{Client, Event, Stanza, parsers::jid::Jid};

use crate::{
    engine::{
        ConnectionError, ConnectionType, Engine, EngineEvent, EngineFactory, EngineOptions,
        EngineSignal, ErrorDomain, HandlerTable, StanzaHandler,
    },
    minidom::Element,
};

/// Size of the outbound stanza channel.
const STANZA_CHANNEL_SIZE: usize = 256;

/// How long a connection attempt may take to come online.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Builds [`TokioXmppEngine`]s that report to one signal channel.
pub struct TokioXmppFactory {
    signals: mpsc::UnboundedSender<EngineEvent>,
}

impl TokioXmppFactory {
    pub fn new(signals: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { signals }
    }
}

impl EngineFactory for TokioXmppFactory {
    fn create(&self, options: EngineOptions) -> Box<dyn Engine> {
        Box::new(TokioXmppEngine::new(options, self.signals.clone()))
    }
}

#[derive(Default)]
struct Shared {
    error: Option<ConnectionError>,
    bound_jid: Option<String>,
    certificate_errors: Vec<String>,
}

struct Connection {
    stanza_tx: mpsc::Sender<Element>,
    cancel: CancellationToken,
    immediate: Arc<AtomicBool>,
    /// Set by the connection task when it exits.
    finished: Arc<AtomicBool>,
}

impl Connection {
    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

/// Marks the connection finished however its task ends.
struct FinishGuard(Arc<AtomicBool>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

#[derive(Clone)]
struct SignalSink {
    account: String,
    generation: u64,
    signals: mpsc::UnboundedSender<EngineEvent>,
}

impl SignalSink {
    fn emit(&self, signal: EngineSignal) {
        let _ = self.signals.send(EngineEvent {
            account: self.account.clone(),
            generation: self.generation,
            signal,
        });
    }
}

pub struct TokioXmppEngine {
    options: EngineOptions,
    sink: SignalSink,
    handlers: HandlerTable,
    connection: Option<Connection>,
    shared: Arc<Mutex<Shared>>,
    ignore_tls_errors: bool,
}

impl TokioXmppEngine {
    pub fn new(options: EngineOptions, signals: mpsc::UnboundedSender<EngineEvent>) -> Self {
        let sink = SignalSink {
            account: options.account.clone(),
            generation: options.generation,
            signals,
        };
        Self {
            options,
            sink,
            handlers: HandlerTable::default(),
            connection: None,
            shared: Arc::new(Mutex::new(Shared::default())),
            ignore_tls_errors: false,
        }
    }

    fn shared(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The running connection, if its task has not ended yet.
    fn live_connection(&mut self) -> Option<&Connection> {
        if self.connection.as_ref().is_some_and(Connection::is_finished) {
            debug!(account = %self.options.account, "connection task has ended");
            self.connection = None;
        }
        self.connection.as_ref()
    }

    fn fail(&mut self, error: ConnectionError, signal: EngineSignal) {
        warn!(account = %self.options.account, %error, "cannot connect");
        self.shared().error = Some(error);
        self.sink.emit(signal);
    }
}

impl Engine for TokioXmppEngine {
    fn connect(&mut self) {
        if self.live_connection().is_some() {
            warn!(account = %self.options.account, "engine is already connecting");
            return;
        }
        {
            let mut shared = self.shared();
            shared.error = None;
            shared.bound_jid = None;
        }

        if self.options.anonymous {
            self.fail(
                ConnectionError::new(ErrorDomain::Sasl, "invalid-mechanism")
                    .with_text("anonymous authentication is not supported"),
                EngineSignal::ConnectionFailed,
            );
            return;
        }
        if self.options.connection_types.contains(&ConnectionType::Plain) {
            warn!(account = %self.options.account, "plain connections are not supported, using STARTTLS");
        }

        let jid_str = match &self.options.resource {
            Some(resource) => format!("{}/{resource}", self.options.jid),
            None => self.options.jid.clone(),
        };
        let jid: Jid = match jid_str.parse() {
            Ok(jid) => jid,
            Err(e) => {
                self.fail(
                    ConnectionError::new(ErrorDomain::Other, "invalid-jid").with_text(e.to_string()),
                    EngineSignal::ConnectionFailed,
                );
                return;
            },
        };
        let password = match &self.options.password {
            Some(password) if !password.expose_secret().is_empty() => {
                password.expose_secret().clone()
            },
            _ => {
                self.fail(
                    ConnectionError::new(ErrorDomain::Sasl, "no-password"),
                    EngineSignal::Disconnected,
                );
                return;
            },
        };
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                self.fail(
                    ConnectionError::new(ErrorDomain::Other, "no-runtime").with_text(e.to_string()),
                    EngineSignal::ConnectionFailed,
                );
                return;
            },
        };

        let (stanza_tx, stanza_rx) = mpsc::channel(STANZA_CHANNEL_SIZE);
        let cancel = CancellationToken::new();
        let immediate = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        self.connection = Some(Connection {
            stanza_tx,
            cancel: cancel.clone(),
            immediate: Arc::clone(&immediate),
            finished: Arc::clone(&finished),
        });

        info!(account = %self.options.account, jid = %jid, "connecting");
        handle.spawn(run_connection(
            Client::new(jid, password),
            stanza_rx,
            cancel,
            immediate,
            FinishGuard(finished),
            Arc::clone(&self.shared),
            self.sink.clone(),
        ));
    }

    fn disconnect(&mut self, immediate: bool) {
        self.live_connection();
        match self.connection.take() {
            Some(connection) => {
                connection.immediate.store(immediate, Ordering::Relaxed);
                connection.cancel.cancel();
            },
            None => {
                debug!(account = %self.options.account, "disconnect without connection");
                self.sink.emit(EngineSignal::Disconnected);
            },
        }
    }

    fn send_stanza(&mut self, stanza: Element) -> Option<String> {
        let id = stanza.attr("id").map(String::from);
        let account = self.options.account.clone();
        let Some(connection) = self.live_connection() else {
            warn!(account, "not connected, dropping stanza");
            return None;
        };
        if let Err(e) = connection.stanza_tx.try_send(stanza) {
            warn!(account, "failed to queue stanza: {e}");
            return None;
        }
        id
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
        self.shared().error.clone()
    }

    fn peer_certificate_errors(&self) -> Vec<String> {
        self.shared().certificate_errors.clone()
    }

    fn set_password(&mut self, password: Option<Secret<String>>) {
        self.options.password = password;
    }

    fn set_ignore_tls_errors(&mut self, ignore: bool) {
        if ignore {
            debug!(account = %self.options.account, "certificate errors are always fatal with this backend");
        }
        self.ignore_tls_errors = ignore;
    }

    fn connection_types(&self) -> Vec<ConnectionType> {
        self.options.connection_types.clone()
    }

    fn bound_jid(&self) -> Option<String> {
        self.shared().bound_jid.clone()
    }

    fn destroy(&mut self) {
        self.handlers = HandlerTable::default();
        if let Some(connection) = self.connection.take() {
            connection.immediate.store(true, Ordering::Relaxed);
            connection.cancel.cancel();
        }
    }
}

/// Owns the `tokio_xmpp::Client` for one connection attempt.
///
/// Ends on the first disconnect, signalling it exactly once.
async fn run_connection(
    mut client: Client,
    mut stanza_rx: mpsc::Receiver<Element>,
    cancel: CancellationToken,
    immediate: Arc<AtomicBool>,
    _finished: FinishGuard,
    shared: Arc<Mutex<Shared>>,
    sink: SignalSink,
) {
    let account = sink.account.clone();
    let mut online = false;
    let connect_timeout = tokio::time::sleep(CONNECT_TIMEOUT);
    tokio::pin!(connect_timeout);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                if online && !immediate.load(Ordering::Relaxed) {
                    // Drain what the state machine queued before closing.
                    while let Ok(element) = stanza_rx.try_recv() {
                        let _ = send_raw_stanza(&mut client, element).await;
                    }
                    let _ = client.send_end().await;
                }
                info!(account, "connection closed");
                sink.emit(EngineSignal::Disconnected);
                break;
            }

            _ = &mut connect_timeout, if !online => {
                warn!(account, "connection attempt timed out");
                shared.lock().unwrap_or_else(PoisonError::into_inner).error = Some(
                    ConnectionError::new(ErrorDomain::Connection, "connection-timeout")
                        .with_text(format!("not online after {}s", CONNECT_TIMEOUT.as_secs())),
                );
                sink.emit(EngineSignal::ConnectionFailed);
                break;
            }

            stanza = stanza_rx.recv() => {
                match stanza {
                    Some(element) => {
                        match send_raw_stanza(&mut client, element.clone()).await {
                            Ok(()) => sink.emit(EngineSignal::StanzaSent(element)),
                            Err(e) => warn!(account, "failed to send stanza: {e}"),
                        }
                    }
                    None => {
                        info!(account, "stanza channel closed, shutting down");
                        sink.emit(EngineSignal::Disconnected);
                        break;
                    }
                }
            }

            event = client.next() => {
                match event {
                    Some(Event::Online { bound_jid, resumed }) => {
                        info!(account, %bound_jid, resumed, "xmpp connected");
                        shared
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .bound_jid = Some(bound_jid.to_string());
                        online = true;
                        sink.emit(if resumed {
                            EngineSignal::ResumeSuccessful
                        } else {
                            EngineSignal::Connected
                        });
                    }

                    Some(Event::Disconnected(err)) => {
                        let error = classify_error(&err.to_string(), matches!(err, tokio_xmpp::Error::Auth(_)));
                        // Reconnecting is left to the state machine.
                        warn!(account, %err, "xmpp disconnected");
                        let signal = if online
                            || error.domain != ErrorDomain::Connection
                        {
                            EngineSignal::Disconnected
                        } else {
                            EngineSignal::ConnectionFailed
                        };
                        {
                            let mut shared = shared.lock().unwrap_or_else(PoisonError::into_inner);
                            if error.domain == ErrorDomain::BadCertificate {
                                shared.certificate_errors.push(err.to_string());
                            }
                            shared.error = Some(error);
                        }
                        sink.emit(signal);
                        break;
                    }

                    Some(Event::Stanza(stanza)) => {
                        sink.emit(EngineSignal::StanzaReceived(stanza_to_element(stanza)));
                    }

                    None => {
                        info!(account, "xmpp stream ended");
                        sink.emit(EngineSignal::Disconnected);
                        break;
                    }
                }
            }
        }
    }
}

/// Map a stream error onto the domains the state machine reacts to.
fn classify_error(text: &str, auth: bool) -> ConnectionError {
    if auth {
        return ConnectionError::new(ErrorDomain::Sasl, "not-authorized").with_text(text);
    }
    let lower = text.to_lowercase();
    if lower.contains("certificate") {
        ConnectionError::new(ErrorDomain::BadCertificate, "bad-certificate").with_text(text)
    } else if lower.contains("conflict") {
        let domain = if lower.contains("bind") {
            ErrorDomain::Bind
        } else {
            ErrorDomain::Stream
        };
        ConnectionError::new(domain, "conflict").with_text(text)
    } else {
        ConnectionError::new(ErrorDomain::Connection, "connection-failed").with_text(text)
    }
}

fn stanza_to_element(stanza: Stanza) -> Element {
    match stanza {
        Stanza::Iq(iq) => iq.into(),
        Stanza::Message(message) => message.into(),
        Stanza::Presence(presence) => presence.into(),
    }
}

/// Send a raw `crate::minidom::Element` as a stanza.
///
/// Converts the Element into the appropriate `xmpp_parsers` type before
/// sending via `client.send_stanza()`.
async fn send_raw_stanza(client: &mut Client, element: Element) -> Result<()> {
    let stanza: Stanza = match element.name() {
        "message" => {
            let msg = tokio_xmpp::parsers::message::Message::try_from(element)
                .map_err(|e| anyhow::anyhow!("invalid message stanza: {e}"))?;
            msg.into()
        },
        "presence" => {
            let pres = tokio_xmpp::parsers::presence::Presence::try_from(element)
                .map_err(|e| anyhow::anyhow!("invalid presence stanza: {e}"))?;
            pres.into()
        },
        "iq" => {
            let iq = tokio_xmpp::parsers::iq::Iq::try_from(element)
                .map_err(|e| anyhow::anyhow!("invalid iq stanza: {e}"))?;
            iq.into()
        },
        other => {
            return Err(anyhow::anyhow!("unsupported stanza type: {other}"));
        },
    };

    client
        .send_stanza(stanza)
        .await
        .map_err(|e| anyhow::anyhow!("failed to send stanza: {e}"))?;

    Ok(())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn options(password: Option<&str>) -> EngineOptions {
        EngineOptions {
            account: "acc".into(),
            generation: 3,
            jid: "juliet@capulet.lit".into(),
            resource: Some("balcony".into()),
            password: password.map(|p| Secret::new(p.to_string())),
            anonymous: false,
            connection_types: vec![ConnectionType::DirectTls, ConnectionType::StartTls],
            ignored_tls_errors: Vec::new(),
        }
    }

    #[test]
    fn classify_errors() {
        assert_eq!(classify_error("bad auth", true).domain, ErrorDomain::Sasl);
        assert_eq!(
            classify_error("invalid peer certificate: UnknownIssuer", false).domain,
            ErrorDomain::BadCertificate
        );
        let conflict = classify_error("stream error: conflict", false);
        assert!(conflict.is_resource_conflict());
        assert_eq!(
            classify_error("bind error: conflict", false).domain,
            ErrorDomain::Bind
        );
        assert_eq!(
            classify_error("connection refused", false).domain,
            ErrorDomain::Connection
        );
    }

    #[test]
    fn missing_password_reports_auth_failure() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut engine = TokioXmppEngine::new(options(None), tx);
        engine.connect();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.account, "acc");
        assert_eq!(event.generation, 3);
        assert!(matches!(event.signal, EngineSignal::Disconnected));
        assert!(engine.error().unwrap().is_auth_failure());
    }

    #[test]
    fn connect_outside_runtime_fails() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut engine = TokioXmppEngine::new(options(Some("pw")), tx);
        engine.connect();
        assert!(matches!(
            rx.try_recv().unwrap().signal,
            EngineSignal::ConnectionFailed
        ));
        assert_eq!(engine.error().unwrap().condition, "no-runtime");
    }

    fn ended_connection(engine: &mut TokioXmppEngine) -> Arc<AtomicBool> {
        let (stanza_tx, _stanza_rx) = mpsc::channel(1);
        let finished = Arc::new(AtomicBool::new(false));
        engine.connection = Some(Connection {
            stanza_tx,
            cancel: CancellationToken::new(),
            immediate: Arc::new(AtomicBool::new(false)),
            finished: Arc::clone(&finished),
        });
        drop(FinishGuard(Arc::clone(&finished)));
        finished
    }

    #[test]
    fn finish_guard_marks_connection_on_drop() {
        let finished = Arc::new(AtomicBool::new(false));
        let guard = FinishGuard(Arc::clone(&finished));
        assert!(!finished.load(Ordering::Acquire));
        drop(guard);
        assert!(finished.load(Ordering::Acquire));
    }

    #[test]
    fn connect_again_after_task_ended() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut engine = TokioXmppEngine::new(options(Some("pw")), tx);
        ended_connection(&mut engine);

        // Not refused as "already connecting": the attempt proceeds and
        // reaches the runtime check.
        engine.connect();
        assert!(matches!(
            rx.try_recv().unwrap().signal,
            EngineSignal::ConnectionFailed
        ));
        assert_eq!(engine.error().unwrap().condition, "no-runtime");
    }

    #[test]
    fn live_connection_blocks_a_second_connect() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut engine = TokioXmppEngine::new(options(Some("pw")), tx);
        let finished = ended_connection(&mut engine);
        finished.store(false, Ordering::Release);

        engine.connect();
        assert!(rx.try_recv().is_err());
        assert!(engine.connection.is_some());
    }

    #[test]
    fn disconnect_after_task_ended_still_signals() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut engine = TokioXmppEngine::new(options(Some("pw")), tx);
        ended_connection(&mut engine);

        engine.disconnect(false);
        assert!(matches!(
            rx.try_recv().unwrap().signal,
            EngineSignal::Disconnected
        ));
        assert!(engine.connection.is_none());
    }

    #[test]
    fn send_after_task_ended_is_dropped() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut engine = TokioXmppEngine::new(options(Some("pw")), tx);
        ended_connection(&mut engine);
        let msg = crate::stanza::build_message("m1", "romeo@montague.lit", "chat", "hi");
        assert_eq!(engine.send_stanza(msg), None);
    }

    #[test]
    fn send_without_connection_is_dropped() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut engine = TokioXmppEngine::new(options(Some("pw")), tx);
        let msg = crate::stanza::build_message("m1", "romeo@montague.lit", "chat", "hi");
        assert_eq!(engine.send_stanza(msg), None);
    }
}
