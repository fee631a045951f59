use std::sync::Arc;

use clap::Parser;
use fleet_control::{
    alerts::AlertEvaluator,
    commands::{spawn_failure_listener, CommandClient, CorrelationEngine},
    config::{read_config_file, StorageConfig},
    crypto::CredentialCipher,
    gateway::{spawn_gateway, ConnectionRegistry, GatewayState},
    hub::UiHub,
    notify::{Notifier, NullNotifier, WebhookNotifier},
    router::MessageRouter,
    scheduler::BackupScheduler,
    store::{memory::MemoryStore, sqlite::SqliteStore, Store},
    util,
    watchdog::WatchlistSupervisor,
};
use tracing::{debug, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short, default_value_t = util::get_config_path())]
    file: String,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("fleet_control", LevelFilter::TRACE),
        ("hub", LevelFilter::TRACE),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.file)?;

    let store: Arc<dyn Store> = match &config.storage {
        StorageConfig::Memory => {
            debug!("using in-memory store");
            Arc::new(MemoryStore::new())
        }
        StorageConfig::Sqlite { path } => Arc::new(SqliteStore::open(path).await?),
    };

    let key = config
        .credential_key
        .clone()
        .or_else(util::get_credential_key)
        .ok_or_else(|| {
            anyhow::anyhow!("no credential key configured (credential_key or FLEET_CREDENTIAL_KEY)")
        })?;
    let cipher = CredentialCipher::from_base64(&key)?;

    let notifier: Arc<dyn Notifier> = match &config.alert_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
        None => Arc::new(NullNotifier),
    };

    let hub = UiHub::default();
    let registry = Arc::new(ConnectionRegistry::new());

    let (engine, retry_rx, failed_rx) = CorrelationEngine::new(config.command_max_retries);
    let commands = CommandClient::new(Arc::clone(&registry), Arc::clone(&engine));
    commands.spawn_retry_worker(retry_rx);
    spawn_failure_listener(hub.clone(), failed_rx);

    let alerts = Arc::new(AlertEvaluator::new(
        Arc::clone(&store),
        hub.clone(),
        Arc::clone(&notifier),
    ));
    let watchdog = Arc::new(WatchlistSupervisor::new(
        commands.clone(),
        Arc::clone(&store),
        hub.clone(),
        Arc::clone(&notifier),
    ));
    let router = Arc::new(MessageRouter::new(
        Arc::clone(&store),
        hub.clone(),
        Arc::clone(&engine),
        alerts,
        watchdog,
    ));

    Arc::new(BackupScheduler::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        commands,
        cipher,
    ))
    .spawn();

    spawn_gateway(
        config.bind_addr,
        GatewayState {
            store,
            registry,
            router,
            hub,
        },
    )
    .await?;

    tokio::signal::ctrl_c().await?;
    debug!("shutting down");

    Ok(())
}
