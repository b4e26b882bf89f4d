//! The task that owns every account of the process.
//!
//! All clients live in one [`AppContext`] driven by a single `select!` loop:
//! engine signals, application commands, timer deadlines and idle polling
//! are all handled on that task, so client state is never shared across
//! threads. The outside world talks to it through [`Runtime`].

use std::{collections::HashMap, sync::Arc, time::Duration};

use {
    chrono::Utc,
    gajim_common::{Clock, SystemClock},
    gajim_config::AppConfig,
    tokio::{sync::mpsc, task::JoinHandle, time::Instant},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    context::{AppCommand, AppContext, Services},
    engine::{EngineEvent, TokioXmppFactory},
    ged::Ged,
    idle::{self, IdleMonitor, IdleSource, IdleState},
    state::{AccountSnapshot, AccountStateMap},
    storage::ArchiveStore,
};

/// How long shutdown waits for accounts to sign off.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Handle to a running event loop.
pub struct Runtime {
    commands: mpsc::UnboundedSender<AppCommand>,
    accounts: AccountStateMap,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Runtime {
    pub fn commands(&self) -> mpsc::UnboundedSender<AppCommand> {
        self.commands.clone()
    }

    /// Account snapshots, refreshed after every loop step.
    pub fn accounts(&self) -> AccountStateMap {
        Arc::clone(&self.accounts)
    }

    pub fn send(&self, command: AppCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Sign every account off and wait for the loop to end.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("event loop task failed: {e}");
        }
    }
}

/// Start the event loop over real XMPP connections.
///
/// Every enabled account of `config` is registered but stays offline until
/// it is told to change its status.
pub fn start_event_loop(
    config: &AppConfig,
    ged: Arc<Ged>,
    archive: Arc<dyn ArchiveStore>,
    idle_source: Option<Box<dyn IdleSource>>,
) -> Runtime {
    let (engine_tx, engine_rx) = mpsc::unbounded_channel();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let services = Services {
        ged,
        archive,
        clock: Arc::new(SystemClock),
        factory: Arc::new(TokioXmppFactory::new(engine_tx)),
        commands: commands_tx,
    };
    spawn(services, config, engine_rx, commands_rx, idle_source)
}

pub(crate) fn spawn(
    services: Services,
    config: &AppConfig,
    engine_rx: mpsc::UnboundedReceiver<EngineEvent>,
    commands_rx: mpsc::UnboundedReceiver<AppCommand>,
    idle_source: Option<Box<dyn IdleSource>>,
) -> Runtime {
    let commands = services.commands.clone();
    let accounts: AccountStateMap = Arc::new(tokio::sync::RwLock::new(HashMap::new()));
    let cancel = CancellationToken::new();

    let mut ctx = AppContext::new(services, config.idle.clone());
    for (name, account) in config.enabled_accounts() {
        if let Err(e) = ctx.add_account(name, account.clone()) {
            warn!(account = name, "skipping account: {e}");
        }
    }
    let idle = idle_source.map(|source| (source, IdleMonitor::new(&config.idle)));

    let task = tokio::spawn(run_event_loop(
        ctx,
        engine_rx,
        commands_rx,
        Arc::clone(&accounts),
        cancel.clone(),
        idle,
    ));

    Runtime {
        commands,
        accounts,
        cancel,
        task,
    }
}

async fn run_event_loop(
    mut ctx: AppContext,
    mut engine_rx: mpsc::UnboundedReceiver<EngineEvent>,
    mut commands_rx: mpsc::UnboundedReceiver<AppCommand>,
    accounts: AccountStateMap,
    cancel: CancellationToken,
    mut idle: Option<(Box<dyn IdleSource>, IdleMonitor)>,
) {
    info!(accounts = ctx.accounts().count(), "event loop started");
    publish(ctx.snapshots(), &accounts).await;
    let mut idle_tick = tokio::time::interval(idle::POLL_INTERVAL);

    loop {
        let deadline = ctx.next_deadline();
        let timers = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(Instant::from_std(at)).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,

            event = engine_rx.recv() => match event {
                Some(event) => ctx.handle_engine_event(event),
                None => {
                    info!("engine channel closed, shutting down");
                    break;
                },
            },

            command = commands_rx.recv() => match command {
                Some(command) => {
                    debug!(?command, "app command");
                    ctx.handle_command(command);
                },
                None => {
                    info!("command channel closed, shutting down");
                    break;
                },
            },

            _ = timers => {
                ctx.fire_due_timers();
            },

            _ = idle_tick.tick(), if idle.is_some() => {
                if let Some((source, monitor)) = idle.as_mut()
                    && let Some(state) = monitor.poll(source.as_ref())
                {
                    let since = idle_since(state, monitor.idle_time(), &*ctx.services().clock);
                    ctx.set_idle_state(state, since);
                }
            },
        }

        publish(ctx.snapshots(), &accounts).await;
    }

    shutdown(&mut ctx, &mut engine_rx).await;
    publish(ctx.snapshots(), &accounts).await;
    info!("event loop stopped");
}

async fn shutdown(ctx: &mut AppContext, engine_rx: &mut mpsc::UnboundedReceiver<EngineEvent>) {
    info!("signing off all accounts");
    ctx.quit_all();
    let grace = tokio::time::sleep(SHUTDOWN_GRACE);
    tokio::pin!(grace);
    while !ctx.all_disconnected() {
        tokio::select! {
            _ = &mut grace => {
                warn!("accounts did not sign off in time");
                break;
            },
            event = engine_rx.recv() => match event {
                Some(event) => ctx.handle_engine_event(event),
                None => break,
            },
        }
    }
    ctx.cleanup();
}

fn idle_since(
    state: IdleState,
    idle_time: Duration,
    clock: &dyn Clock,
) -> Option<chrono::DateTime<Utc>> {
    if state.is_awake() {
        return None;
    }
    let idle = chrono::Duration::from_std(idle_time).ok()?;
    Some(clock.now_utc() - idle)
}

async fn publish(snapshots: HashMap<String, AccountSnapshot>, accounts: &AccountStateMap) {
    let mut map = accounts.write().await;
    if *map != snapshots {
        *map = snapshots;
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use gajim_config::Show;

    use super::*;
    use crate::{
        client::ClientCommand,
        engine::EngineSignal,
        state::ClientState,
        test_support::{ACCOUNT, OWN_JID, TestServices, account_config},
    };

    fn app_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.accounts.insert(ACCOUNT.into(), account_config());
        config
    }

    async fn wait_for_state(runtime: &Runtime, state: ClientState) {
        for _ in 0..200 {
            let accounts = runtime.accounts();
            if accounts.read().await.get(ACCOUNT).map(|s| s.state) == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("account never reached {state}");
    }

    #[tokio::test]
    async fn accounts_from_config_are_published() {
        let t = TestServices::new();
        let commands_rx = t.take_receiver();
        let (_engine_tx, engine_rx) = mpsc::unbounded_channel();
        let runtime = spawn(t.services.clone(), &app_config(), engine_rx, commands_rx, None);

        wait_for_state(&runtime, ClientState::Disconnected).await;
        assert_eq!(t.mock().connects, 0);

        runtime.shutdown().await;
        assert_eq!(t.mock().destroyed, 1);
    }

    #[tokio::test]
    async fn commands_and_signals_drive_the_client() {
        let t = TestServices::new();
        let commands_rx = t.take_receiver();
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let runtime = spawn(t.services.clone(), &app_config(), engine_rx, commands_rx, None);

        assert!(runtime.send(AppCommand::Client {
            account: ACCOUNT.into(),
            command: ClientCommand::ChangeStatus {
                show: Show::Online,
                message: String::new(),
            },
        }));
        wait_for_state(&runtime, ClientState::Connecting).await;
        assert_eq!(t.mock().connects, 1);

        engine_tx
            .send(EngineEvent {
                account: ACCOUNT.into(),
                generation: 1,
                signal: EngineSignal::Connected,
            })
            .unwrap();
        wait_for_state(&runtime, ClientState::Connected).await;
        let bound = runtime.accounts().read().await[ACCOUNT].bound_jid.clone();
        assert_eq!(bound.as_deref(), Some(&*format!("{OWN_JID}/balcony")));

        // The graceful sign-off completes once the stream reports it closed.
        let signals = engine_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = signals.send(EngineEvent {
                account: ACCOUNT.into(),
                generation: 1,
                signal: EngineSignal::Disconnected,
            });
        });
        let started = std::time::Instant::now();
        runtime.shutdown().await;
        assert!(started.elapsed() < SHUTDOWN_GRACE);
        assert_eq!(t.mock().disconnects, vec![false]);
    }

    #[tokio::test]
    async fn added_accounts_can_be_removed() {
        let t = TestServices::new();
        let commands_rx = t.take_receiver();
        let (_engine_tx, engine_rx) = mpsc::unbounded_channel();
        let runtime = spawn(t.services.clone(), &AppConfig::default(), engine_rx, commands_rx, None);

        runtime.send(AppCommand::AddAccount {
            name: ACCOUNT.into(),
            config: Box::new(account_config()),
        });
        wait_for_state(&runtime, ClientState::Disconnected).await;

        runtime.send(AppCommand::RemoveAccount {
            name: ACCOUNT.into(),
        });
        for _ in 0..200 {
            if runtime.accounts().read().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(runtime.accounts().read().await.is_empty());
        runtime.shutdown().await;
    }

    struct FixedIdle(Duration);

    impl IdleSource for FixedIdle {
        fn idle_time(&self) -> Option<Duration> {
            Some(self.0)
        }
    }

    #[test]
    fn idle_since_is_only_set_while_idle() {
        let t = TestServices::new();
        let clock = &*t.services.clock;
        assert!(idle_since(IdleState::Awake, Duration::from_secs(600), clock).is_none());
        let since = idle_since(IdleState::Away, Duration::from_secs(600), clock).unwrap();
        assert_eq!(clock.now_utc() - since, chrono::Duration::minutes(10));

        let mut monitor = IdleMonitor::new(&gajim_config::IdleConfig::default());
        assert_eq!(
            monitor.poll(&FixedIdle(Duration::from_secs(6 * 60))),
            Some(IdleState::Away)
        );
    }
}
