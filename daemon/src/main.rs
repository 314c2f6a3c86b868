use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::{error, info, warn};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Notify;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ussdq::config::LogFormat;
use ussdq::{
    is_native_device, render_table, resolve_config, select_backend, Config, Executor,
    NewOperation, NotificationKind, Notifier, OperationStore, QueueObserver, QueuePoller,
    SqliteStore, UssdqError,
};

#[derive(Parser)]
#[command(name = "ussdq-daemon", version, about = "Single-flight USSD operation queue")]
struct Cli {
    /// Defaults to `run`
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the poller and the live queue view until Ctrl-C
    Run {
        /// Config file; defaults to $USSDQ_CONFIG, then built-in defaults
        config: Option<PathBuf>,
    },
    /// Queue a USSD code for execution
    Enqueue {
        /// Code to dial, e.g. *123#
        code: String,
        /// SIM slot to dial from
        sim_slot: u32,
        config: Option<PathBuf>,
    },
    /// Print the queue once
    List { config: Option<PathBuf> },
}

impl Command {
    fn config_path(&self) -> Option<&Path> {
        match self {
            Command::Run { config } | Command::Enqueue { config, .. } | Command::List { config } => {
                config.as_deref()
            }
        }
    }
}

fn init_logging(format: LogFormat) {
    // Route `log` records from the library into tracing.
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("Failed to bridge log records: {}", e);
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Text => tracing::subscriber::set_global_default(registry.with(fmt::layer())),
        LogFormat::Json => {
            tracing::subscriber::set_global_default(registry.with(fmt::layer().json()))
        }
    };
    if let Err(e) = result {
        eprintln!("Failed to install tracing subscriber: {}", e);
    }
}

#[tokio::main]
async fn main() {
    let command = Cli::parse()
        .command
        .unwrap_or(Command::Run { config: None });

    let config = match resolve_config(command.config_path()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    init_logging(config.logging.format);

    let result = match command {
        Command::Run { .. } => run(config).await,
        Command::Enqueue { code, sim_slot, .. } => enqueue(&config, &code, sim_slot).await,
        Command::List { .. } => list(&config).await,
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn enqueue(config: &Config, code: &str, sim_slot: u32) -> Result<(), UssdqError> {
    let new = NewOperation::new(code, sim_slot)?;
    let store = SqliteStore::open(&config.database_path()?)?;
    let op = store.insert(new).await?;
    println!("{}", op.id);
    Ok(())
}

async fn list(config: &Config) -> Result<(), UssdqError> {
    let store = SqliteStore::open(&config.database_path()?)?;
    print!("{}", render_table(&store.list_all().await?));
    Ok(())
}

async fn run(config: Config) -> Result<(), UssdqError> {
    info!("Starting ussdq daemon v{}", env!("CARGO_PKG_VERSION"));

    let db_path = config.database_path()?;
    let store = Arc::new(SqliteStore::open(&db_path)?);
    info!("Using database {:?}", db_path);

    // Picks up operations enqueued by other processes.
    let _watcher = store.spawn_change_watcher(config.change_watch_interval());

    if !is_native_device(&config) {
        info!("No modem port available, executing operations in simulation");
    }
    let notifier = Notifier::default();
    let executor = Executor::new(
        store.clone(),
        select_backend(&config),
        notifier.clone(),
        config.execution_timeout(),
    );
    let poller = QueuePoller::new(store.clone(), executor, config.poll_interval())
        .with_dispatch_on_change(config.dispatch_on_change);

    let observer = QueueObserver::with_config(store.clone(), &config.observer)
        .start()
        .await;
    let poller_handle = poller.start();

    let shutdown = Arc::new(Notify::new());
    let signal = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || signal.notify_one()) {
        warn!("Failed to install Ctrl-C handler: {}", e);
    }

    let mut view = observer.view();
    let mut notes = notifier.subscribe();
    let table = render_table(&view.borrow_and_update());
    print!("{}", table);

    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                let table = render_table(&view.borrow_and_update());
                print!("{}", table);
            }
            note = notes.recv() => match note {
                Ok(note) => match note.kind {
                    NotificationKind::Failure => warn!("{}", note.text),
                    NotificationKind::Started | NotificationKind::Success => info!("{}", note.text),
                },
                Err(RecvError::Lagged(n)) => warn!("Dropped {} notifications", n),
                Err(RecvError::Closed) => {}
            }
        }
    }

    info!("Shutting down");
    poller_handle.stop().await;
    observer.stop().await;
    info!("ussdq daemon stopped");
    Ok(())
}
