//! Identity types shared across Granary crates.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Identity of one silo incarnation.
///
/// `name` is stable across restarts of the same host; `generation`
/// increases with every restart and fences out older incarnations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SiloId {
    pub name: String,
    pub generation: u64,
}

impl SiloId {
    pub fn new(name: impl Into<String>, generation: u64) -> Self {
        Self {
            name: name.into(),
            generation,
        }
    }

    /// Same silo name, next generation.
    pub fn next_generation(&self, at_least: u64) -> Self {
        Self {
            name: self.name.clone(),
            generation: at_least.max(self.generation + 1),
        }
    }
}

impl fmt::Display for SiloId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.generation)
    }
}

/// Network endpoint a silo advertises to the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SiloEndpoint {
    pub address: IpAddr,
    pub silo_port: u16,
    pub gateway_port: u16,
}

impl fmt::Display for SiloEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            IpAddr::V4(ip) => write!(f, "{ip}:{}", self.silo_port)?,
            IpAddr::V6(ip) => write!(f, "[{ip}]:{}", self.silo_port)?,
        }
        write!(f, " (gateway {})", self.gateway_port)
    }
}

/// The logical cluster a silo belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterIdentity {
    pub cluster_id: String,
    pub service_id: String,
}

impl ClusterIdentity {
    pub fn new(cluster_id: impl Into<String>, service_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            service_id: service_id.into(),
        }
    }
}

impl fmt::Display for ClusterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cluster_id, self.service_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_generation_is_strictly_greater() {
        let id = SiloId::new("silo-a", 100);
        assert_eq!(id.next_generation(0).generation, 101);
        assert_eq!(id.next_generation(500).generation, 500);
    }

    #[test]
    fn endpoint_display() {
        let ep = SiloEndpoint {
            address: "10.0.0.1".parse().unwrap(),
            silo_port: 11111,
            gateway_port: 30000,
        };
        assert_eq!(ep.to_string(), "10.0.0.1:11111 (gateway 30000)");
    }
}
