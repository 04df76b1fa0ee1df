use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;
use wabridge_core::bus::EventBus;
use wabridge_core::config::AppConfig;
use wabridge_core::store::SessionStore;
use wabridge_outbound::{OutboundQueue, QueueConfig};
use wabridge_persistence::SqliteStore;
use wabridge_server::{AppContext, Gateway};
use wabridge_session::{ReconnectConfig, Supervisor};
use wabridge_wa::stub::StubConnector;
use wabridge_webhook::{SyncJob, WebhookConfig, WebhookDispatcher};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "wabridge")]
#[command(version = VERSION)]
#[command(about = "Multi-tenant WhatsApp-Web to CRM gateway")]
struct Args {
    /// Override the configured HTTP port
    #[arg(long)]
    port: Option<u16>,

    /// Webhook backfill interval in seconds
    #[arg(long, default_value_t = 300)]
    sync_interval_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = AppConfig::load().context("failed to load configuration")?;

    // Log to a daily-rolling file AND stdout
    let file_appender = tracing_appender::rolling::daily("logs", "wabridge.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let filter =
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking.and(std::io::stdout))
        .init();

    info!(version = VERSION, port = config.port, "wabridge starting");
    if let Some(frontend_url) = &config.frontend_url {
        info!(frontend_url, "dashboard origin configured");
    }

    tokio::fs::create_dir_all(&config.session_storage_path)
        .await
        .with_context(|| {
            format!(
                "failed to create session storage at {}",
                config.session_storage_path.display()
            )
        })?;

    let store: Arc<dyn SessionStore> = Arc::new(SqliteStore::new(&config.database_url).await?);
    let bus = Arc::new(EventBus::new(256));

    let dispatcher = WebhookDispatcher::new(
        store.clone(),
        WebhookConfig {
            secret: config.webhook_secret.clone(),
            ..Default::default()
        },
    );

    // The real WhatsApp transport plugs in behind WaConnector; the bundled
    // stub keeps the gateway runnable without one.
    let connector = Arc::new(StubConnector::new());
    warn!("no WhatsApp transport configured, using the development stub");

    let supervisor = Supervisor::new(
        store.clone(),
        connector,
        bus.clone(),
        Arc::new(dispatcher.clone()),
        ReconnectConfig::default(),
        config.session_storage_path.clone(),
    );
    let queue = OutboundQueue::new(supervisor.clone(), QueueConfig::default());

    // Bring persisted sessions back up before accepting traffic
    supervisor.restore_all().await;

    let sync = SyncJob::new(
        store.clone(),
        dispatcher,
        Duration::from_secs(args.sync_interval_secs),
    );
    let sync_handle = sync.start();

    let ctx = AppContext::new(store, supervisor, queue, bus);
    let port = args.port.unwrap_or(config.port);
    let gateway = Gateway::new(ctx, port);
    gateway.start(shutdown_signal()).await?;

    // Timers die with the runtime; give in-flight deliveries a short grace
    sync_handle.abort();
    tokio::time::sleep(Duration::from_secs(2)).await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to install ctrl-c handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
