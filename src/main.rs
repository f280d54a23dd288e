//! jobfleet - main entry point.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use jobfleet::{
    config::Config,
    dispatch::JobDispatcher,
    monitor::{JobMonitor, spawn_monitor},
    orchestrator::{DockerOrchestrator, InMemoryOrchestrator, Orchestrator},
    session::{SessionRequest, SessionStore},
    webhook::{Outbox, WebhookNotifier},
    SessionManager,
};

#[derive(Parser, Debug)]
#[command(name = "jobfleet")]
#[command(about = "Dispatch and track containerized agent sessions")]
#[command(version)]
struct Args {
    /// Use an in-memory job runtime instead of Docker (nothing is executed)
    #[arg(long)]
    dry_run: bool,

    /// Session state file (overrides JOBFLEET_STATE_FILE)
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Create a session from a JSON request file before monitoring
    #[arg(long, value_name = "REQUEST_JSON")]
    submit: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, env = "JOBFLEET_LOG_JSON")]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("jobfleet=info"));
    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let log_json = args.log_json
        || std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    init_tracing(log_json);

    let mut config = Config::from_env()?;
    if let Some(path) = args.state_file {
        config.store.state_file = path;
    }

    let store = Arc::new(SessionStore::open(&config.store.state_file)?);
    tracing::info!(
        path = %config.store.state_file.display(),
        sessions = store.len().await,
        "Session store ready"
    );

    let orchestrator: Arc<dyn Orchestrator> = if args.dry_run {
        tracing::warn!("Dry run: jobs are recorded in memory and never executed");
        Arc::new(InMemoryOrchestrator::new())
    } else {
        Arc::new(
            DockerOrchestrator::connect()
                .await
                .context("connecting to the Docker daemon (use --dry-run to skip)")?,
        )
    };

    let outbox = Arc::new(Outbox::open(&config.store.outbox_file)?);
    let (notifier, delivery_task) =
        WebhookNotifier::spawn(&config.webhook, outbox, store.clone()).await?;
    let notifier = Arc::new(notifier);

    let manager = SessionManager::new(
        store.clone(),
        orchestrator.clone(),
        JobDispatcher::new(orchestrator.clone(), config.dispatch.clone()),
        config.monitor.max_log_bytes,
    );

    if let Some(path) = args.submit {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let request: SessionRequest = serde_json::from_str(&raw)
            .with_context(|| format!("parsing session request {}", path.display()))?;
        let session = manager.create(request).await?;
        println!("{}", serde_json::to_string_pretty(&session)?);
    }

    let monitor = spawn_monitor(JobMonitor::new(
        store.clone(),
        orchestrator,
        notifier.clone(),
        config.monitor.clone(),
        config.webhook.pod_log_bytes,
    ));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    monitor.shutdown().await;
    drop(manager);
    drop(notifier);

    if let Some(task) = delivery_task {
        // Let in-flight deliveries finish their current attempt.
        let grace = config.webhook.timeout + Duration::from_secs(5);
        if tokio::time::timeout(grace, task).await.is_err() {
            tracing::warn!("Webhook deliveries still pending at exit; they stay in the outbox");
        }
    }

    store.save().await?;
    Ok(())
}
