//! Silo mode: wire storage, membership and the API together.
//!
//! Start-up order:
//! 1. Open the backend and both namespaces (membership, grains)
//! 2. Join the cluster; a rejected join aborts before anything is served
//! 3. Spawn the heartbeat/detection loop
//! 4. Bind the API
//! 5. On Ctrl-C (or fatal membership loss), stop serving and leave

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{Notify, watch};
use tracing::{debug, error, info, warn};

use granary_api::{ApiState, build_router};
use granary_cluster::{
    AgentConfig, DirectoryConfig, MembershipDirectory, SiloAgent, SiloLifecycle, run_lifecycle,
};
use granary_core::config::{BackendConfig, BackendLocation, machine_name};
use granary_core::{Clock, GranaryConfig, SystemClock};
use granary_grains::GrainStateStore;
use granary_state::{BackendClient, RedbBackend, RetryPolicy};

/// The assembled, not yet started, silo.
pub struct Silo {
    pub agent: Arc<SiloAgent>,
    pub grains: GrainStateStore,
}

pub async fn run_silo(config: GranaryConfig) -> anyhow::Result<()> {
    info!(identity = %config.identity(), "Granary silo starting");

    let backend = open_backend(&config.backend)?;
    let silo = assemble(&config, backend, Arc::new(SystemClock)).await?;

    // ── Join before serving ────────────────────────────────────

    silo.agent
        .on_start()
        .await
        .context("joining the cluster")?;

    // ── Membership loop ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let membership_lost = Arc::new(Notify::new());
    let membership_handle = tokio::spawn({
        let agent = Arc::clone(&silo.agent);
        let lost = Arc::clone(&membership_lost);
        let heartbeat = config.membership.heartbeat_interval.get();
        let detection = config.membership.detection_interval.get();
        async move {
            let result = run_lifecycle(agent.as_ref(), heartbeat, detection, shutdown_rx).await;
            if result.is_err() {
                lost.notify_one();
            }
            result
        }
    });

    // ── API server ─────────────────────────────────────────────

    let router = build_router(ApiState {
        agent: Arc::clone(&silo.agent),
        grains: silo.grains.clone(),
    });
    let listener = tokio::net::TcpListener::bind(config.api.listen)
        .await
        .with_context(|| format!("binding API on {}", config.api.listen))?;
    info!(addr = %config.api.listen, "API server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        warn!(error = %e, "failed to listen for Ctrl-C");
                    }
                    info!("shutdown signal received");
                }
                _ = membership_lost.notified() => {
                    error!("membership cannot be recovered, shutting down");
                }
            }
            let _ = shutdown_tx.send(true);
        })
        .await?;

    membership_handle
        .await
        .context("membership task panicked")?
        .context("membership loop failed")?;

    info!("Granary silo stopped");
    Ok(())
}

/// Open the database named by `backend.endpoint`, bound to the
/// membership namespace.
pub fn open_backend(config: &BackendConfig) -> anyhow::Result<RedbBackend> {
    let namespace = config.namespace("membership");
    if config.credential.is_some() {
        debug!("backend credential configured; the redb backend does not use it");
    }
    let backend = match config.location()? {
        BackendLocation::Memory => {
            warn!("in-memory backend: membership and grain state are lost on exit");
            RedbBackend::open_in_memory(&namespace)?
        }
        BackendLocation::File(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            RedbBackend::open(&path, &namespace)
                .with_context(|| format!("opening {}", path.display()))?
        }
    };
    Ok(backend)
}

/// Build the directory, grain store and agent over `backend`.
pub async fn assemble(
    config: &GranaryConfig,
    backend: RedbBackend,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<Silo> {
    let retry = RetryPolicy::from_config(&config.retry);
    let timeout = config.retry.operation_timeout.get();
    let client = |backend: RedbBackend| {
        BackendClient::new(Arc::new(backend))
            .with_retry(retry)
            .with_operation_timeout(timeout)
    };

    let grains_backend = backend.with_namespace(&config.backend.namespace("grains"))?;
    let directory = MembershipDirectory::open(
        client(backend),
        DirectoryConfig {
            identity: config.identity(),
            membership: config.membership.clone(),
            create_resources: config.backend.create_resources,
        },
        Arc::clone(&clock),
    )
    .await
    .context("opening membership directory")?;

    let grains = GrainStateStore::open(client(grains_backend), config.backend.create_resources)
        .await
        .context("opening grain state store")?;

    let name = config.silo_name(&machine_name());
    let agent = SiloAgent::new(
        Arc::new(directory),
        AgentConfig::from_config(config, name),
        clock,
    );

    Ok(Silo {
        agent: Arc::new(agent),
        grains,
    })
}
