//! Runs the configured accounts without a user interface.

use std::{path::PathBuf, sync::Arc};

use {
    anyhow::{Context, Result},
    clap::Parser,
    gajim_config::{AppConfig, Show},
    gajim_xmpp::{
        AppCommand, ClientCommand, Event, EventKind, Ged, HandlerResult,
        ged::priority,
        start_event_loop,
        storage::{ArchiveStore, FileArchiveStore, MemoryArchiveStore},
    },
    tracing::{error, info, warn},
    tracing_subscriber::{EnvFilter, fmt, prelude::*},
};

#[derive(Debug, Parser)]
#[command(name = "gajim", about = "Headless gajim session runner")]
struct Cli {
    /// Settings file.
    #[arg(long, short, env = "GAJIM_CONFIG", default_value = "gajim.toml")]
    config: PathBuf,

    /// Where archive cursors and the message log are kept. In memory if unset.
    #[arg(long, env = "GAJIM_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Only bring these accounts online.
    #[arg(long = "account")]
    accounts: Vec<String>,

    /// Proceed over unencrypted connections without asking.
    #[arg(long)]
    allow_plain: bool,

    #[arg(long, env = "GAJIM_LOG", default_value = "info")]
    log_level: String,

    #[arg(long)]
    json_logs: bool,
}

fn init_logging(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let registry = tracing_subscriber::registry().with(filter);
    if cli.json_logs {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().with_target(false)).init();
    }
}

/// Answer the questions the core asks and log everything else.
fn register_listeners(ged: &Ged, allow_plain: bool) {
    const EVENTS: &[&str] = &[
        "plain-connection",
        "password-required",
        "ssl-error",
        "our-show",
        "signed-in",
        "simple-notification",
        "muc-joined",
        "receipt-received",
        "message-sent",
        "archiving-interval-finished",
    ];
    for name in EVENTS {
        ged.register_event_handler(name, priority::POSTGUI, move |event: &Event| {
            let account = &event.account;
            match &event.kind {
                EventKind::PlainConnection { responder } => {
                    if allow_plain {
                        responder.proceed();
                    } else {
                        warn!(account, "refusing unencrypted connection, pass --allow-plain");
                        responder.abort();
                    }
                },
                EventKind::PasswordRequired { .. } => {
                    error!(account, "password required, set it in the config file");
                },
                EventKind::SslError { errors, responder } => {
                    error!(account, ?errors, "certificate rejected");
                    responder.reject();
                },
                EventKind::OurShow { show } => info!(account, show, "status"),
                EventKind::SimpleNotification { title, text, .. } => {
                    info!(account, title, text, "notification");
                },
                other => info!(account, event = other.name(), "event"),
            }
            Ok(HandlerResult::Continue)
        });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let config = AppConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let archive: Arc<dyn ArchiveStore> = match &cli.data_dir {
        Some(dir) => Arc::new(FileArchiveStore::open(dir)?),
        None => Arc::new(MemoryArchiveStore::new()),
    };

    let ged = Arc::new(Ged::new());
    register_listeners(&ged, cli.allow_plain);

    let runtime = start_event_loop(&config, Arc::clone(&ged), archive, None);
    for (name, _) in config.enabled_accounts() {
        if !cli.accounts.is_empty() && !cli.accounts.contains(name) {
            continue;
        }
        info!(account = %name, "going online");
        runtime.send(AppCommand::Client {
            account: name.clone(),
            command: ClientCommand::ChangeStatus {
                show: Show::Online,
                message: String::new(),
            },
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    runtime.shutdown().await;
    Ok(())
}
