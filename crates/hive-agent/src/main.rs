use std::sync::Arc;

use anyhow::Context;
use hive_agent::api::{self, ApiState};
use hive_agent::config::AgentConfig;
use hive_agent::installer::{BootstrapSource, Installer, PocketMineDefaults};
use hive_agent::process_handle::ProcessHost;
use hive_agent::query::RakNetProber;
use hive_agent::reconcile::Reconciler;
use hive_agent::records::{FileRecordStore, RecordStore};
use hive_agent::scheduler::Scheduler;
use hive_agent::supervisor::Supervisor;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AgentConfig::load()?;

    let logs_dir = config.logs_dir();
    std::fs::create_dir_all(&logs_dir)
        .with_context(|| format!("create logs dir {}", logs_dir.display()))?;
    let (file_writer, _log_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&logs_dir, "hive-agent.log"));
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hive_agent=info,warn"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();

    let instances_dir = config.instances_dir();
    std::fs::create_dir_all(&instances_dir)
        .with_context(|| format!("create instances dir {}", instances_dir.display()))?;
    tracing::info!(
        data_root = %config.data_root().display(),
        port_ranges = ?config.port_ranges,
        host_kind = ?config.host_kind,
        "hive-agent starting"
    );

    let store: Arc<dyn RecordStore> = Arc::new(FileRecordStore::open(config.records_dir())?);
    let installer = Installer::new(
        BootstrapSource::parse(&config.installer_url),
        Arc::new(PocketMineDefaults),
    )?;
    let supervisor = Arc::new(Supervisor::new(
        config.clone(),
        store,
        installer,
        ProcessHost::new(config.host_kind),
        RakNetProber::new(config.probe_timeout()),
    ));

    let scheduler = Arc::new(Scheduler::new());
    let reconciler = Reconciler::new(supervisor.clone());
    scheduler.schedule_recurring(config.reconcile_interval(), "reconcile", move || {
        let reconciler = reconciler.clone();
        async move {
            reconciler.tick().await;
        }
    });

    let app = api::router(ApiState::new(supervisor, scheduler.clone()));
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("bind {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "hive-agent listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.shutdown().await;
    tracing::info!("hive-agent stopped");
    Ok(())
}
