use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use nodelease_orchestrator::api::{self, AppState};
use nodelease_orchestrator::config::{self, OrchestratorConfig};
use nodelease_orchestrator::launcher::{LauncherRegistry, SshLauncher, WinRmLauncher};
use nodelease_orchestrator::logger::ActionLogger;
use nodelease_orchestrator::provider_manager::ProviderManager;
use nodelease_orchestrator::retention::{IdleTimeout, RetentionMonitor, RetentionPolicy};
use nodelease_orchestrator::store::NodeStore;
use nodelease_orchestrator::{
    CloudAccount, CloudRegistry, ConnectivityEstablisher, LifecycleTiming, NodeLifecycleManager,
    NodeTable, ProvisioningScheduler,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = OrchestratorConfig::from_env().context("reading NODELEASE_* settings")?;
    info!(clouds_file = %cfg.clouds_file.display(), "Starting Nodelease Orchestrator");

    // 1. Cloud accounts
    let mut clouds = CloudRegistry::default();
    for account in config::load_clouds(&cfg.clouds_file)? {
        let provider = match ProviderManager::get_provider(&account) {
            Ok(p) => p,
            Err(e) => {
                error!(cloud = %account.id, error = %e, "cloud skipped: provider unavailable");
                continue;
            }
        };
        let cloud = CloudAccount::from_config(&account, provider)
            .with_context(|| format!("cloud {}", account.id))?;
        info!(
            cloud = %cloud.id,
            region = %cloud.region,
            templates = cloud.templates.len(),
            "cloud registered"
        );
        clouds.register(cloud)?;
    }
    if clouds.list().is_empty() {
        warn!("no cloud account configured, provisioning requests will be empty");
    }
    let clouds = Arc::new(clouds);

    // 2. Engine
    let logger = Arc::new(ActionLogger::default());
    let launchers = LauncherRegistry::new(
        Arc::new(SshLauncher {
            port: cfg.ssh_port,
            connect_timeout: Duration::from_secs(3),
            launch_timeout: cfg.launch_timeout,
        }),
        Arc::new(WinRmLauncher::new(cfg.winrm_port, cfg.launch_timeout)?),
    );
    let retention: Arc<dyn RetentionPolicy> = Arc::new(IdleTimeout::minutes(cfg.idle_threshold_minutes));
    let store = NodeStore::new(&cfg.state_file);
    let nodes = Arc::new(NodeTable::with_store(store.clone()));
    let lifecycle = Arc::new(NodeLifecycleManager::new(
        launchers.clone(),
        ConnectivityEstablisher::new(cfg.connect_attempts, cfg.connect_backoff),
        retention.clone(),
        LifecycleTiming {
            poll_interval: cfg.poll_interval,
            active_timeout: cfg.active_timeout,
        },
        logger.clone(),
        nodes.clone(),
    ));
    let cancel = CancellationToken::new();
    let scheduler = Arc::new(ProvisioningScheduler::new(
        clouds.clone(),
        lifecycle.clone(),
        cfg.worker_pool_size,
        cancel.clone(),
    ));

    // 3. Nodes from a previous run reconnect in the background
    let restored = store
        .restore(&clouds, &launchers, retention.clone(), logger.clone())
        .await
        .unwrap_or_else(|e| {
            error!(error = ?e, "node store unreadable, starting empty");
            Vec::new()
        });
    nodes.restore(restored.clone()).await;
    for node in restored {
        let lifecycle = lifecycle.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = lifecycle.activate(&node, &cancel).await {
                warn!(node = %node.id, error = %e, "restored node failed to reconnect");
            }
        });
    }

    // job-retention (idle eviction)
    let monitor = RetentionMonitor::new(lifecycle.clone(), cfg.retention_interval);
    let cancel_retention = cancel.clone();
    tokio::spawn(async move {
        monitor.run(cancel_retention).await;
    });

    // 4. Admin API
    let state = Arc::new(AppState {
        clouds,
        scheduler,
        lifecycle,
        logger,
        cancel: cancel.clone(),
    });
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(cfg.listen_addr)
        .await
        .with_context(|| format!("binding {}", cfg.listen_addr))?;
    info!(addr = %cfg.listen_addr, "Orchestrator listening");

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
            shutdown.cancel();
        })
        .await
        .context("http server")?;
    Ok(())
}
