//! Persisted membership records.

use serde::{Deserialize, Serialize};

use granary_core::{ClusterIdentity, SiloEndpoint, SiloId};

/// Key prefix for silo records.
pub(crate) const SILO_PREFIX: &str = "silo/";

/// Key of the record naming the cluster a namespace belongs to.
pub(crate) const CLUSTER_KEY: &str = "cluster";

pub(crate) fn silo_key(name: &str) -> String {
    format!("{SILO_PREFIX}{name}")
}

/// Status of a silo in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiloStatus {
    Joining,
    Active,
    Suspect,
    Dead,
}

impl SiloStatus {
    /// Whether a record may move from `self` to `next`.
    ///
    /// Status only moves forward. A join that never completed goes
    /// straight from Joining to Dead.
    pub fn can_transition_to(self, next: SiloStatus) -> bool {
        use SiloStatus::*;
        matches!(
            (self, next),
            (Joining, Active) | (Joining, Dead) | (Active, Suspect) | (Active, Dead) | (Suspect, Dead)
        )
    }
}

/// One cluster member as stored in the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiloRecord {
    pub silo_id: SiloId,
    pub cluster_id: String,
    pub service_id: String,
    pub status: SiloStatus,
    pub endpoint: SiloEndpoint,
    /// Epoch milliseconds.
    pub lease_expires_at: u64,
    pub joined_at: u64,
    pub suspect_since: Option<u64>,
    pub dead_since: Option<u64>,
}

impl SiloRecord {
    pub(crate) fn joining(
        silo_id: SiloId,
        identity: &ClusterIdentity,
        endpoint: SiloEndpoint,
        now: u64,
        lease_expires_at: u64,
    ) -> Self {
        Self {
            silo_id,
            cluster_id: identity.cluster_id.clone(),
            service_id: identity.service_id.clone(),
            status: SiloStatus::Joining,
            endpoint,
            lease_expires_at,
            joined_at: now,
            suspect_since: None,
            dead_since: None,
        }
    }

    /// Active with an unexpired lease.
    pub fn is_active_at(&self, now: u64) -> bool {
        self.status == SiloStatus::Active && self.lease_expires_at > now
    }

    /// Holds a claim on its name: Active or mid-join, lease unexpired.
    pub fn holds_lease_at(&self, now: u64) -> bool {
        matches!(self.status, SiloStatus::Joining | SiloStatus::Active)
            && self.lease_expires_at > now
    }

    /// Move to `next`, stamping the transition time. Returns false and
    /// leaves the record untouched when the move is not allowed.
    pub(crate) fn transition(&mut self, next: SiloStatus, now: u64) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        match next {
            SiloStatus::Suspect => self.suspect_since = Some(now),
            SiloStatus::Dead => self.dead_since = Some(now),
            SiloStatus::Joining | SiloStatus::Active => {}
        }
        self.status = next;
        true
    }
}

/// The cluster a directory namespace was created for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ClusterRecord {
    pub identity: ClusterIdentity,
    pub created_at: u64,
}
