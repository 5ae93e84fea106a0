// tunnel agent
// Entry point for the binary

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use tunnel_agent::app_service::AppService;
use tunnel_agent::config::FileManager;
use tunnel_agent::constants::{APP_NAME, READY_PATH, SERVICE_DRAIN_TIMEOUT};
use tunnel_agent::errors;
use tunnel_agent::overwatch::AppManager;
use tunnel_agent::readiness::ReadyServer;
use tunnel_agent::services::ListenerFactory;
use tunnel_agent::settings::{AgentSettings, Overrides};
use tunnel_agent::signal::{self, Lifecycle};
use tunnel_agent::tunnelstate::ConnTracker;

#[derive(Parser, Debug)]
#[command(name = "tunnel_agent")]
#[command(about = "Keeps edge connections and local services running from a config file")]
struct Args {
    #[arg(long, help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, help = "Listen address of the readiness endpoint")]
    metrics: Option<String>,

    #[arg(long, help = "Time services get to finish after a shutdown signal, e.g. 30s")]
    grace_period: Option<String>,

    #[arg(long, help = "Log level filter, overridden by RUST_LOG")]
    log_level: Option<String>,

    #[arg(long, help = "Directory for rolling log files")]
    log_directory: Option<PathBuf>,

    #[arg(long, help = "Write JSON logs to stdout")]
    json_logs: bool,

    #[arg(long, help = "Connector ID reported by the readiness endpoint")]
    connector_id: Option<Uuid>,
}

impl Args {
    fn into_overrides(self) -> Overrides {
        Overrides {
            config_path: self.config,
            metrics_address: self.metrics,
            grace_period: self.grace_period,
            log_level: self.log_level,
            log_directory: self.log_directory,
            json_logs: self.json_logs,
            connector_id: self.connector_id,
        }
    }
}

fn setup_tracing(settings: &AgentSettings) -> Result<WorkerGuard> {
    std::fs::create_dir_all(&settings.log_directory)
        .context(errors::startup::FAILED_TO_CREATE_LOG_DIR)?;

    let file_appender =
        tracing_appender::rolling::daily(&settings.log_directory, format!("{}.log", APP_NAME));
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_level));

    if settings.json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(non_blocking).json())
            .with(fmt::layer().json().with_writer(std::io::stdout))
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(non_blocking).json())
            .with(fmt::layer().pretty().with_writer(std::io::stdout))
            .try_init()?;
    }

    Ok(guard)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let settings = AgentSettings::load(args.into_overrides())?;

    let _guard = setup_tracing(&settings).context(errors::startup::FAILED_TO_INIT_TRACING)?;

    std::panic::set_hook(Box::new(|panic_info| {
        tracing::error!("Application panic: {:?}", panic_info);
    }));

    tracing::info!(
        connector_id = %settings.connector_id,
        config = %settings.config_path.display(),
        grace_period = %humantime::format_duration(settings.grace_period),
        "Tunnel agent starting"
    );

    let runtime =
        tokio::runtime::Runtime::new().context(errors::startup::FAILED_TO_CREATE_RUNTIME)?;
    let result = runtime.block_on(run(settings));

    match &result {
        Ok(()) => tracing::info!("Tunnel agent stopped"),
        Err(e) => tracing::error!("Tunnel agent stopped with error: {:#}", e),
    }
    result
}

async fn run(settings: AgentSettings) -> Result<()> {
    let lifecycle = Lifecycle::new();
    let (error_tx, mut error_rx) = mpsc::channel::<anyhow::Error>(4);

    let tracker = Arc::new(ConnTracker::new());
    let ready = Arc::new(ReadyServer::new(tracker, settings.connector_id));

    let metrics = tokio::spawn(serve_metrics(
        settings.metrics_address.clone(),
        ready.clone(),
        lifecycle.shutdown().clone(),
        error_tx.clone(),
    ));

    let app_manager = Arc::new(AppManager::new(Arc::new(log_service_exit)));
    let app = Arc::new(AppService::new(
        Arc::new(FileManager::new(settings.config_path.clone())),
        app_manager.clone(),
        Arc::new(ListenerFactory::new(ready.clone())),
        lifecycle.shutdown().child_token(),
    ));

    let app_task = {
        let app = app.clone();
        let error_tx = error_tx.clone();
        let lifecycle = lifecycle.clone();
        tokio::spawn(async move {
            match app.run().await {
                // Services are down, no need to sit out the rest of the grace period.
                Ok(()) => lifecycle.shutdown().cancel(),
                Err(e) => {
                    let _ = error_tx.send(e).await;
                }
            }
        })
    };

    let grace_watch = {
        let app = app.clone();
        let lifecycle = lifecycle.clone();
        tokio::spawn(async move {
            lifecycle.grace_shutdown().cancelled().await;
            app.shutdown();
        })
    };
    drop(error_tx);

    let result = signal::wait_for_signal_with_grace_shutdown(
        &mut error_rx,
        &lifecycle,
        settings.grace_period,
    )
    .await;

    app.shutdown();
    if tokio::time::timeout(SERVICE_DRAIN_TIMEOUT, app_manager.wait_stopped())
        .await
        .is_err()
    {
        tracing::warn!(
            remaining = app_manager.services().len(),
            "Services did not stop within {}",
            humantime::format_duration(SERVICE_DRAIN_TIMEOUT)
        );
    }
    if tokio::time::timeout(SERVICE_DRAIN_TIMEOUT, app_task).await.is_err() {
        tracing::warn!("App service did not stop in time");
    }
    grace_watch.abort();
    let _ = metrics.await;

    result
}

async fn serve_metrics(
    address: String,
    ready: Arc<ReadyServer>,
    shutdown: CancellationToken,
    error_tx: mpsc::Sender<anyhow::Error>,
) {
    let served = async move {
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| errors::startup::metrics_bind_failed(&address))?;
        tracing::info!("Serving readiness on http://{}{}", address, READY_PATH);
        axum::serve(listener, ready.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .context(errors::startup::METRICS_SERVER_FAILED)
    };

    if let Err(e) = served.await {
        let _ = error_tx.send(e).await;
    }
}

fn log_service_exit(service_type: &str, name: &str, error: Option<&anyhow::Error>) {
    match error {
        Some(e) => tracing::error!(service = name, service_type, "Service stopped: {:#}", e),
        None => tracing::info!(service = name, service_type, "Service stopped"),
    }
}
