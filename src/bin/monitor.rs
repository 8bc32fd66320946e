use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use device_monitor::{
    alerts::AlertManager,
    analysis::AnalysisEngine,
    broker::mqtt::MqttBroker,
    config::{StorageConfig, read_config_file},
    dispatcher::MessageDispatcher,
    notifications::Notifier,
    pipeline::IngestionPipeline,
    storage::{TimeSeriesStore, memory::MemoryStore},
    supervisor::ConnectionSupervisor,
    util,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,

    /// Log at trace level
    #[arg(long)]
    verbose: bool,
}

fn init(verbose: bool) {
    let level = if verbose { LevelFilter::TRACE } else { LevelFilter::INFO };
    let filter = filter::Targets::new().with_targets(vec![("device_monitor", level)]);
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

    let args = Args::parse();
    init(args.verbose);
    trace!("started with args: {args:?}");

    let mut config = read_config_file(&args.file).context("failed to load configuration")?;
    util::apply_env_credentials(&mut config.broker);

    let shutdown = CancellationToken::new();

    let store = open_store(&config.storage, &shutdown).await?;
    let notifier = Arc::new(Notifier::from_config(&config.notifications));
    info!("notification channels: {:?}", notifier.channel_names());

    let pipeline = Arc::new(IngestionPipeline::new(
        store.clone(),
        AnalysisEngine::new(config.analysis.clone()),
        AlertManager::new(store.clone(), notifier),
    ));
    let dispatcher = Arc::new(MessageDispatcher::new().with_device_data_handler(pipeline));

    let supervisor = ConnectionSupervisor::new(Arc::new(MqttBroker::new()), config.broker.clone(), dispatcher);

    let started = supervisor.start(&shutdown).await;
    if !started.is_success() {
        error!("failed to start broker supervisor: {started}");
        supervisor.shutdown().await;
        anyhow::bail!("failed to start broker supervisor: {}", started.message);
    }
    info!("device monitor running, subscribed to {:?}", config.broker.subscribe_topics);

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    shutdown.cancel();
    supervisor.shutdown().await;

    if let Err(e) = store.close().await {
        error!("error closing store: {e}");
    }

    info!("device monitor stopped");
    Ok(())
}

async fn open_store(config: &StorageConfig, shutdown: &CancellationToken) -> anyhow::Result<Arc<dyn TimeSeriesStore>> {
    match config {
        StorageConfig::Memory => {
            info!("using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
        #[cfg(feature = "storage-sqlite")]
        StorageConfig::Sqlite { path, retention_days } => {
            use device_monitor::storage::sqlite::SqliteStore;

            let store = Arc::new(
                SqliteStore::new(path)
                    .await
                    .with_context(|| format!("failed to open SQLite store at {}", path.display()))?,
            );
            tokio::spawn(retention_cleanup(store.clone(), *retention_days, shutdown.clone()));
            Ok(store)
        }
        #[cfg(not(feature = "storage-sqlite"))]
        StorageConfig::Sqlite { .. } => {
            let _ = shutdown;
            anyhow::bail!("SQLite storage requested but the storage-sqlite feature is disabled")
        }
    }
}

#[cfg(feature = "storage-sqlite")]
async fn retention_cleanup(
    store: Arc<device_monitor::storage::sqlite::SqliteStore>,
    retention_days: u32,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(24 * 60 * 60));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(retention_days));
        if let Err(e) = store.cleanup_before(cutoff).await {
            error!("retention cleanup failed: {e}");
        }
    }
}
