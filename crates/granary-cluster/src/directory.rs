//! Membership directory — lease-based cluster membership.
//!
//! Tracks which silos are alive. Silos join, renew a lease by heartbeat,
//! and leave. Any member may run a failure-detection pass that moves
//! silos whose lease lapsed to Suspect, then Dead, then removes them.
//!
//! There is no directory-wide lock. Every mutation reads a record with
//! its version and writes it back conditionally, so concurrent passes
//! from several silos never lose an update: the loser of a race sees a
//! conflict and re-reads.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use granary_core::config::{GenerationPolicy, MembershipConfig};
use granary_core::{Clock, ClusterIdentity, SiloEndpoint, SiloId};
use granary_state::{BackendClient, Entry, StateError, Version};

use crate::error::{MembershipError, MembershipResult};
use crate::record::{CLUSTER_KEY, ClusterRecord, SILO_PREFIX, SiloRecord, SiloStatus, silo_key};

/// Times a join or heartbeat re-reads after losing a race before
/// reporting [`MembershipError::Conflict`].
const CAS_ATTEMPTS: usize = 3;

/// Everything the directory needs at construction.
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    pub identity: ClusterIdentity,
    pub membership: MembershipConfig,
    /// Create the namespace when it does not exist.
    pub create_resources: bool,
}

/// Why a join was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinRejection {
    /// The silo is configured for a different cluster or service.
    IdentityMismatch {
        expected: ClusterIdentity,
        actual: ClusterIdentity,
    },
    /// A live record of the same or a newer generation holds this name at
    /// a different endpoint.
    IdentityCollision {
        holder: SiloId,
        endpoint: SiloEndpoint,
    },
    /// A newer (or equal, already retired) generation is on record.
    StaleGeneration { stored: u64, requested: u64 },
}

impl fmt::Display for JoinRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinRejection::IdentityMismatch { expected, actual } => {
                write!(f, "silo belongs to {actual}, directory serves {expected}")
            }
            JoinRejection::IdentityCollision { holder, endpoint } => {
                write!(f, "name held by live silo {holder} at {endpoint}")
            }
            JoinRejection::StaleGeneration { stored, requested } => {
                write!(f, "generation {requested} is not newer than stored generation {stored}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The silo is Active. The record carries the silo id to heartbeat with.
    Accepted(SiloRecord),
    Rejected(JoinRejection),
}

impl JoinOutcome {
    pub fn into_result(self) -> MembershipResult<SiloRecord> {
        match self {
            JoinOutcome::Accepted(record) => Ok(record),
            JoinOutcome::Rejected(reason) => Err(MembershipError::IdentityConflict(reason)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Renewed { lease_expires_at: u64 },
    /// No record for this incarnation; rejoin.
    Unknown,
    /// Lease lapsed or the silo was suspected; rejoin.
    Expired,
}

impl HeartbeatOutcome {
    pub fn into_result(self, silo: &SiloId) -> MembershipResult<u64> {
        match self {
            HeartbeatOutcome::Renewed { lease_expires_at } => Ok(lease_expires_at),
            HeartbeatOutcome::Unknown => Err(MembershipError::UnknownSilo(silo.clone())),
            HeartbeatOutcome::Expired => Err(MembershipError::LeaseExpired(silo.clone())),
        }
    }
}

/// What one failure-detection pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectionReport {
    pub suspected: Vec<SiloId>,
    pub declared_dead: Vec<SiloId>,
    pub removed: Vec<SiloId>,
    /// Records skipped because another writer changed them mid-pass.
    pub contended: usize,
    /// Records skipped because they could not be decoded.
    pub undecodable: usize,
}

impl DetectionReport {
    pub fn is_empty(&self) -> bool {
        self.suspected.is_empty() && self.declared_dead.is_empty() && self.removed.is_empty()
    }
}

/// A silo record together with the version it was read at.
struct Versioned {
    record: SiloRecord,
    version: Version,
}

/// Lease-based membership over a versioned backend.
pub struct MembershipDirectory {
    client: BackendClient,
    identity: ClusterIdentity,
    membership: MembershipConfig,
    clock: Arc<dyn Clock>,
}

impl MembershipDirectory {
    /// Validate configuration, provision the namespace and claim (or
    /// verify) its cluster identity.
    pub async fn open(
        client: BackendClient,
        config: DirectoryConfig,
        clock: Arc<dyn Clock>,
    ) -> MembershipResult<Self> {
        if config.identity.cluster_id.trim().is_empty() || config.identity.service_id.trim().is_empty() {
            return Err(MembershipError::Configuration(
                "cluster_id and service_id are required".to_string(),
            ));
        }
        config.membership.validate()?;
        client.ensure_namespace_exists(config.create_resources).await?;

        let directory = Self {
            client,
            identity: config.identity,
            membership: config.membership,
            clock,
        };
        directory.claim_namespace().await?;
        info!(
            namespace = %directory.client.namespace(),
            identity = %directory.identity,
            lease = %directory.membership.lease_duration,
            "membership directory opened"
        );
        Ok(directory)
    }

    pub fn identity(&self) -> &ClusterIdentity {
        &self.identity
    }

    pub fn config(&self) -> &MembershipConfig {
        &self.membership
    }

    fn lease(&self) -> u64 {
        self.membership.lease_duration.get().as_millis() as u64
    }

    async fn claim_namespace(&self) -> MembershipResult<()> {
        let claim = ClusterRecord {
            identity: self.identity.clone(),
            created_at: self.clock.now_millis(),
        };
        let payload = encode(CLUSTER_KEY, &claim)?;
        let recorded = match self.client.put(CLUSTER_KEY, payload, None).await {
            Ok(_) => {
                info!(identity = %self.identity, "cluster identity recorded");
                return Ok(());
            }
            Err(StateError::Conflict { .. }) => {
                let entry = self.client.get(CLUSTER_KEY).await?.ok_or_else(|| {
                    MembershipError::Conflict(CLUSTER_KEY.to_string())
                })?;
                decode::<ClusterRecord>(&entry)?
            }
            Err(e) => return Err(e.into()),
        };
        if recorded.identity != self.identity {
            return Err(MembershipError::Configuration(format!(
                "namespace {} belongs to {}, not {}",
                self.client.namespace(),
                recorded.identity,
                self.identity
            )));
        }
        Ok(())
    }

    // ── Join ───────────────────────────────────────────────────────

    /// Register a silo and make it Active.
    ///
    /// Joining again with the same id and endpoint while Active is a
    /// no-op that only extends the lease.
    pub async fn join(
        &self,
        silo_id: &SiloId,
        identity: &ClusterIdentity,
        endpoint: SiloEndpoint,
    ) -> MembershipResult<JoinOutcome> {
        if identity != &self.identity {
            warn!(%silo_id, %identity, expected = %self.identity, "join rejected: identity mismatch");
            return Ok(JoinOutcome::Rejected(JoinRejection::IdentityMismatch {
                expected: self.identity.clone(),
                actual: identity.clone(),
            }));
        }

        let key = silo_key(&silo_id.name);
        for _ in 0..CAS_ATTEMPTS {
            let now = self.clock.now_millis();
            let existing = self.read(&key).await?;

            let plan = match &existing {
                None => JoinPlan::Create(silo_id.clone()),
                Some(current) => match self.plan_join(&current.record, silo_id, endpoint, now) {
                    Ok(plan) => plan,
                    Err(rejection) => {
                        warn!(%silo_id, %rejection, "join rejected");
                        return Ok(JoinOutcome::Rejected(rejection));
                    }
                },
            };
            let expected = existing.as_ref().map(|v| v.version);

            let result = match plan {
                JoinPlan::Renew => {
                    // Present by construction of plan_join.
                    let Some(current) = existing else { continue };
                    self.renew(current, now).await
                }
                JoinPlan::Activate => {
                    let Some(current) = existing else { continue };
                    self.activate(current.record, current.version, now).await
                }
                JoinPlan::Create(id) => {
                    let record = SiloRecord::joining(
                        id,
                        &self.identity,
                        endpoint,
                        now,
                        now + self.lease(),
                    );
                    match self.write(&key, &record, expected).await {
                        Ok(version) => {
                            debug!(silo_id = %record.silo_id, "silo record created as joining");
                            self.activate(record, version, now).await
                        }
                        Err(e) => Err(e),
                    }
                }
            };

            match result {
                Ok(record) => {
                    info!(
                        silo_id = %record.silo_id,
                        endpoint = %record.endpoint,
                        lease_expires_at = record.lease_expires_at,
                        "silo joined cluster"
                    );
                    return Ok(JoinOutcome::Accepted(record));
                }
                Err(StateError::Conflict { .. }) => {
                    debug!(%silo_id, "join raced with another writer, re-reading");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(MembershipError::Conflict(key))
    }

    fn plan_join(
        &self,
        current: &SiloRecord,
        requested: &SiloId,
        endpoint: SiloEndpoint,
        now: u64,
    ) -> Result<JoinPlan, JoinRejection> {
        let stored = current.silo_id.generation;
        if requested.generation > stored {
            // A newer incarnation supersedes whatever is on record,
            // wherever the old one was reachable.
            return Ok(JoinPlan::Create(requested.clone()));
        }

        let live = current.holds_lease_at(now);
        if live && current.endpoint != endpoint {
            return Err(JoinRejection::IdentityCollision {
                holder: current.silo_id.clone(),
                endpoint: current.endpoint,
            });
        }

        let resumable = match current.status {
            SiloStatus::Active if live => Some(JoinPlan::Renew),
            SiloStatus::Joining if live => Some(JoinPlan::Activate),
            _ => None,
        };
        match self.membership.generation_policy {
            GenerationPolicy::Monotonic if requested.generation < stored => {
                Err(JoinRejection::StaleGeneration {
                    stored,
                    requested: requested.generation,
                })
            }
            // This incarnation was retired; only a newer one may return.
            GenerationPolicy::Monotonic => resumable.ok_or(JoinRejection::StaleGeneration {
                stored,
                requested: requested.generation,
            }),
            // Resurrect as a fresh incarnation so the retired record's
            // status is never walked backwards.
            GenerationPolicy::Ignore => Ok(resumable.unwrap_or_else(|| {
                JoinPlan::Create(SiloId::new(&requested.name, stored + 1))
            })),
        }
    }

    async fn activate(
        &self,
        mut record: SiloRecord,
        version: Version,
        now: u64,
    ) -> Result<SiloRecord, StateError> {
        if !record.transition(SiloStatus::Active, now) {
            return Err(StateError::Conflict {
                key: silo_key(&record.silo_id.name),
                expected: Some(version),
                actual: Some(version),
            });
        }
        record.lease_expires_at = record.lease_expires_at.max(now + self.lease());
        self.write(&silo_key(&record.silo_id.name), &record, Some(version))
            .await?;
        Ok(record)
    }

    async fn renew(&self, current: Versioned, now: u64) -> Result<SiloRecord, StateError> {
        let mut record = current.record;
        record.lease_expires_at = record.lease_expires_at.max(now + self.lease());
        self.write(&silo_key(&record.silo_id.name), &record, Some(current.version))
            .await?;
        Ok(record)
    }

    // ── Heartbeat ──────────────────────────────────────────────────

    /// Extend the silo's lease. Never shortens it.
    pub async fn heartbeat(&self, silo_id: &SiloId) -> MembershipResult<HeartbeatOutcome> {
        let key = silo_key(&silo_id.name);
        for _ in 0..CAS_ATTEMPTS {
            let now = self.clock.now_millis();
            let Some(current) = self.read(&key).await? else {
                warn!(%silo_id, "heartbeat from unknown silo");
                return Ok(HeartbeatOutcome::Unknown);
            };
            if &current.record.silo_id != silo_id {
                warn!(%silo_id, recorded = %current.record.silo_id, "heartbeat from superseded incarnation");
                return Ok(HeartbeatOutcome::Unknown);
            }
            if !current.record.is_active_at(now) {
                warn!(%silo_id, status = ?current.record.status, "heartbeat after lease lapsed");
                return Ok(HeartbeatOutcome::Expired);
            }

            match self.renew(current, now).await {
                Ok(record) => {
                    debug!(%silo_id, lease_expires_at = record.lease_expires_at, "heartbeat received");
                    return Ok(HeartbeatOutcome::Renewed {
                        lease_expires_at: record.lease_expires_at,
                    });
                }
                Err(StateError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(MembershipError::Conflict(key))
    }

    // ── Leave ──────────────────────────────────────────────────────

    /// Mark a silo Dead on graceful shutdown. Returns false when there
    /// was nothing to retire.
    pub async fn leave(&self, silo_id: &SiloId) -> MembershipResult<bool> {
        let key = silo_key(&silo_id.name);
        for _ in 0..CAS_ATTEMPTS {
            let now = self.clock.now_millis();
            let Some(current) = self.read(&key).await? else {
                return Ok(false);
            };
            let mut record = current.record;
            if &record.silo_id != silo_id || !record.transition(SiloStatus::Dead, now) {
                return Ok(false);
            }
            match self.write(&key, &record, Some(current.version)).await {
                Ok(_) => {
                    info!(%silo_id, "silo left cluster");
                    return Ok(true);
                }
                Err(StateError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(MembershipError::Conflict(key))
    }

    // ── Queries ────────────────────────────────────────────────────

    /// Active silos whose lease has not expired at read time.
    pub async fn list_active(&self) -> MembershipResult<Vec<SiloRecord>> {
        let now = self.clock.now_millis();
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|r| r.is_active_at(now))
            .collect())
    }

    /// Every record, whatever its status.
    ///
    /// Records that cannot be decoded are logged and left out.
    pub async fn list_all(&self) -> MembershipResult<Vec<SiloRecord>> {
        let (records, _) = self.read_all().await?;
        Ok(records.into_iter().map(|v| v.record).collect())
    }

    pub async fn get(&self, name: &str) -> MembershipResult<Option<SiloRecord>> {
        Ok(self.read(&silo_key(name)).await?.map(|v| v.record))
    }

    // ── Failure detection ──────────────────────────────────────────

    /// Age out silos that stopped renewing their lease.
    ///
    /// Active with a lapsed lease becomes Suspect; Suspect past the grace
    /// period becomes Dead; Dead past the retention window is removed. A
    /// record changed by someone else mid-pass is left for the next pass.
    pub async fn failure_detection_pass(&self, now: u64) -> MembershipResult<DetectionReport> {
        let grace = millis(self.membership.suspect_grace.get());
        let retention = millis(self.membership.dead_retention.get());
        let (records, undecodable) = self.read_all().await?;
        let mut report = DetectionReport {
            undecodable,
            ..Default::default()
        };

        for Versioned { mut record, version } in records {
            let key = silo_key(&record.silo_id.name);
            let silo_id = record.silo_id.clone();

            let result = match record.status {
                SiloStatus::Active | SiloStatus::Joining if record.lease_expires_at < now => {
                    let next = if record.status == SiloStatus::Active {
                        SiloStatus::Suspect
                    } else {
                        SiloStatus::Dead
                    };
                    record.transition(next, now);
                    self.write(&key, &record, Some(version)).await.map(|_| {
                        if next == SiloStatus::Suspect {
                            warn!(%silo_id, lease_expires_at = record.lease_expires_at, "silo suspected");
                            report.suspected.push(silo_id.clone());
                        } else {
                            warn!(%silo_id, "abandoned join declared dead");
                            report.declared_dead.push(silo_id.clone());
                        }
                    })
                }
                SiloStatus::Suspect
                    if now.saturating_sub(record.suspect_since.unwrap_or(now)) >= grace =>
                {
                    record.transition(SiloStatus::Dead, now);
                    self.write(&key, &record, Some(version)).await.map(|_| {
                        warn!(%silo_id, "silo declared dead");
                        report.declared_dead.push(silo_id.clone());
                    })
                }
                SiloStatus::Dead
                    if now.saturating_sub(record.dead_since.unwrap_or(now)) >= retention =>
                {
                    self.client.delete(&key, version).await.map(|_| {
                        info!(%silo_id, "dead silo record removed");
                        report.removed.push(silo_id.clone());
                    })
                }
                _ => Ok(()),
            };

            match result {
                Ok(()) => {}
                Err(StateError::Conflict { .. }) => {
                    debug!(%silo_id, "record changed during detection pass, skipping");
                    report.contended += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        if !report.is_empty() {
            info!(
                suspected = report.suspected.len(),
                dead = report.declared_dead.len(),
                removed = report.removed.len(),
                "failure detection pass applied changes"
            );
        }
        Ok(report)
    }

    // ── Storage helpers ────────────────────────────────────────────

    async fn read(&self, key: &str) -> MembershipResult<Option<Versioned>> {
        match self.client.get(key).await? {
            Some(entry) => Ok(Some(Versioned {
                record: decode(&entry)?,
                version: entry.version,
            })),
            None => Ok(None),
        }
    }

    /// Every decodable silo record, plus the number that were not.
    /// One corrupt record must not blind the rest of the cluster.
    async fn read_all(&self) -> MembershipResult<(Vec<Versioned>, usize)> {
        let entries = self.client.list(SILO_PREFIX).await?;
        let mut records = Vec::with_capacity(entries.len());
        let mut undecodable = 0;
        for entry in &entries {
            match decode(entry) {
                Ok(record) => records.push(Versioned {
                    record,
                    version: entry.version,
                }),
                Err(e) => {
                    warn!(key = %entry.key, error = %e, "skipping undecodable silo record");
                    undecodable += 1;
                }
            }
        }
        Ok((records, undecodable))
    }

    async fn write(
        &self,
        key: &str,
        record: &SiloRecord,
        expected: Option<Version>,
    ) -> Result<Version, StateError> {
        let payload =
            serde_json::to_vec(record).map_err(|e| StateError::Serialize(e.to_string()))?;
        self.client.put(key, payload, expected).await
    }
}

enum JoinPlan {
    /// Same incarnation, already Active: extend the lease.
    Renew,
    /// Same incarnation stuck in Joining: finish the join.
    Activate,
    /// Write a fresh Joining record for this id, then activate.
    Create(SiloId),
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

fn encode<T: serde::Serialize>(key: &str, value: &T) -> MembershipResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| MembershipError::Serialization {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn decode<T: serde::de::DeserializeOwned>(entry: &Entry) -> MembershipResult<T> {
    serde_json::from_slice(&entry.value).map_err(|e| MembershipError::Serialization {
        key: entry.key.clone(),
        reason: e.to_string(),
    })
}
