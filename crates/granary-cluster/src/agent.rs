//! Silo agent — one silo's participation in the membership directory.
//!
//! The host process calls [`SiloLifecycle::on_start`] before it serves
//! anything, then hands the agent to [`run_lifecycle`], which drives the
//! heartbeat and failure-detection timers until shutdown and finally
//! leaves the cluster.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{RwLock, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use granary_core::{Clock, ClusterIdentity, GranaryConfig, SiloEndpoint, SiloId};

use crate::directory::{HeartbeatOutcome, JoinOutcome, MembershipDirectory};
use crate::error::{MembershipError, MembershipResult};

/// Configuration for the silo agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Silo name; the generation is chosen at start.
    pub name: String,
    pub identity: ClusterIdentity,
    pub endpoint: SiloEndpoint,
    pub heartbeat_interval: Duration,
    pub detection_interval: Duration,
}

impl AgentConfig {
    pub fn from_config(config: &GranaryConfig, name: String) -> Self {
        Self {
            name,
            identity: config.identity(),
            endpoint: config.endpoint(),
            heartbeat_interval: config.membership.heartbeat_interval.get(),
            detection_interval: config.membership.detection_interval.get(),
        }
    }
}

/// Hooks a host process drives over a silo's lifetime.
pub trait SiloLifecycle: Send + Sync {
    /// Join the cluster. An error here must abort start-up.
    fn on_start(&self) -> impl Future<Output = MembershipResult<()>> + Send;

    fn on_heartbeat_tick(&self) -> impl Future<Output = MembershipResult<()>> + Send;

    fn on_detection_tick(&self) -> impl Future<Output = MembershipResult<()>> + Send;

    /// Leave the cluster. Best effort; never fails.
    fn on_stop(&self) -> impl Future<Output = ()> + Send;
}

/// Keeps one silo registered in the directory.
pub struct SiloAgent {
    directory: Arc<MembershipDirectory>,
    config: AgentConfig,
    clock: Arc<dyn Clock>,
    silo_id: RwLock<Option<SiloId>>,
    active: AtomicBool,
    /// Lease expiry as last confirmed by the directory.
    lease_expires_at: AtomicU64,
}

impl SiloAgent {
    pub fn new(directory: Arc<MembershipDirectory>, config: AgentConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            directory,
            config,
            clock,
            silo_id: RwLock::new(None),
            active: AtomicBool::new(false),
            lease_expires_at: AtomicU64::new(0),
        }
    }

    /// Joined, and the last confirmed lease has not run out locally.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
            && self.clock.now_millis() < self.lease_expires_at.load(Ordering::SeqCst)
    }

    /// The incarnation currently registered, if any.
    pub async fn silo_id(&self) -> Option<SiloId> {
        self.silo_id.read().await.clone()
    }

    pub fn directory(&self) -> &Arc<MembershipDirectory> {
        &self.directory
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    async fn join_as(&self, silo_id: SiloId) -> MembershipResult<()> {
        let outcome = self
            .directory
            .join(&silo_id, &self.config.identity, self.config.endpoint)
            .await?;
        let record = match outcome {
            JoinOutcome::Accepted(record) => record,
            JoinOutcome::Rejected(reason) => {
                error!(%silo_id, %reason, "silo refused by membership directory");
                return Err(MembershipError::IdentityConflict(reason));
            }
        };
        self.lease_expires_at
            .store(record.lease_expires_at, Ordering::SeqCst);
        self.active.store(true, Ordering::SeqCst);
        *self.silo_id.write().await = Some(record.silo_id);
        Ok(())
    }
}

impl SiloLifecycle for SiloAgent {
    async fn on_start(&self) -> MembershipResult<()> {
        let silo_id = SiloId::new(&self.config.name, self.clock.now_millis());
        info!(%silo_id, endpoint = %self.config.endpoint, "joining cluster");
        self.join_as(silo_id).await
    }

    async fn on_heartbeat_tick(&self) -> MembershipResult<()> {
        let Some(silo_id) = self.silo_id().await else {
            return Ok(());
        };

        match self.directory.heartbeat(&silo_id).await {
            Ok(HeartbeatOutcome::Renewed { lease_expires_at }) => {
                self.lease_expires_at
                    .store(lease_expires_at, Ordering::SeqCst);
                debug!(%silo_id, lease_expires_at, "lease renewed");
                Ok(())
            }
            Ok(lost @ (HeartbeatOutcome::Unknown | HeartbeatOutcome::Expired)) => {
                self.active.store(false, Ordering::SeqCst);
                let next = silo_id.next_generation(self.clock.now_millis());
                warn!(%silo_id, ?lost, %next, "membership lost, rejoining as new generation");
                self.join_as(next).await
            }
            Err(e) => {
                warn!(%silo_id, error = %e, "heartbeat failed");
                Err(e)
            }
        }
    }

    async fn on_detection_tick(&self) -> MembershipResult<()> {
        self.directory
            .failure_detection_pass(self.clock.now_millis())
            .await
            .map(|_| ())
    }

    async fn on_stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        let Some(silo_id) = self.silo_id.write().await.take() else {
            return;
        };
        match self.directory.leave(&silo_id).await {
            Ok(true) => info!(%silo_id, "left cluster"),
            Ok(false) => debug!(%silo_id, "no live record to retire"),
            Err(e) => warn!(%silo_id, error = %e, "leave failed, lease will lapse"),
        }
    }
}

/// Drive heartbeat and detection timers until `shutdown` flips, then
/// call [`SiloLifecycle::on_stop`].
///
/// Transient errors are logged and the loop carries on. A fatal error
/// (configuration, or a rejected rejoin) stops the loop and is returned.
pub async fn run_lifecycle<L: SiloLifecycle>(
    lifecycle: &L,
    heartbeat_interval: Duration,
    detection_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> MembershipResult<()> {
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut detection = tokio::time::interval(detection_interval);
    detection.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Both intervals fire immediately; start has just joined.
    heartbeat.tick().await;
    detection.tick().await;

    info!(?heartbeat_interval, ?detection_interval, "membership loop started");

    let outcome = loop {
        if *shutdown.borrow() {
            break Ok(());
        }
        tokio::select! {
            _ = heartbeat.tick() => {
                if let Err(e) = lifecycle.on_heartbeat_tick().await {
                    if e.is_fatal() {
                        break Err(e);
                    }
                }
            }
            _ = detection.tick() => {
                if let Err(e) = lifecycle.on_detection_tick().await {
                    if e.is_fatal() {
                        break Err(e);
                    }
                    warn!(error = %e, "failure detection pass failed");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
            }
        }
    };

    info!("membership loop shutting down");
    lifecycle.on_stop().await;
    outcome
}
