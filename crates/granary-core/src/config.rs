//! granary.toml configuration parser.
//!
//! A silo is configured once, from a TOML file optionally overridden by
//! `GRANARY_*` environment variables. Every component receives the typed
//! sections it needs; nothing is looked up by string key after start-up.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::duration::HumanDuration;
use crate::error::ConfigError;
use crate::types::{ClusterIdentity, SiloEndpoint};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GranaryConfig {
    #[serde(default)]
    pub silo: SiloConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub membership: MembershipConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SiloConfig {
    /// Silo name; `{machine}` expands to the host name.
    pub name_template: String,
    pub advertised_address: IpAddr,
    pub silo_port: u16,
    pub gateway_port: u16,
}

impl Default for SiloConfig {
    fn default() -> Self {
        Self {
            name_template: "silo-{machine}".to_string(),
            advertised_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            silo_port: 11111,
            gateway_port: 30000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub cluster_id: String,
    pub service_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// `redb:///path/to/file.redb` or `memory://`.
    pub endpoint: String,
    pub credential: Option<Secret>,
    /// Database name; component namespaces are derived from it.
    pub database: String,
    /// Create missing namespaces instead of failing start-up.
    pub create_resources: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            credential: None,
            database: "granary".to_string(),
            create_resources: false,
        }
    }
}

/// Where the backend lives, parsed from `backend.endpoint`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendLocation {
    Memory,
    File(std::path::PathBuf),
}

impl BackendConfig {
    pub fn location(&self) -> Result<BackendLocation, ConfigError> {
        let endpoint = self.endpoint.trim();
        if endpoint.is_empty() {
            return Err(ConfigError::Missing("backend.endpoint"));
        }
        if endpoint == "memory://" || endpoint == "memory:" {
            return Ok(BackendLocation::Memory);
        }
        match endpoint.strip_prefix("redb://") {
            Some(path) if !path.is_empty() => Ok(BackendLocation::File(path.into())),
            Some(_) => Err(ConfigError::invalid("backend.endpoint", "redb:// needs a file path")),
            None => Err(ConfigError::invalid(
                "backend.endpoint",
                format!("unsupported scheme in {endpoint:?}"),
            )),
        }
    }

    pub fn namespace(&self, component: &str) -> String {
        format!("{}.{component}", self.database)
    }
}

/// A credential that never shows up in logs.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationPolicy {
    /// Reject joins whose generation is older than the stored one.
    #[default]
    Monotonic,
    /// Do not compare generations.
    Ignore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    pub heartbeat_interval: HumanDuration,
    pub lease_duration: HumanDuration,
    pub detection_interval: HumanDuration,
    /// How long a silo stays Suspect before it is declared Dead.
    pub suspect_grace: HumanDuration,
    /// How long a Dead record is kept before removal.
    pub dead_retention: HumanDuration,
    pub generation_policy: GenerationPolicy,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: HumanDuration::from_secs(10),
            lease_duration: HumanDuration::from_secs(30),
            detection_interval: HumanDuration::from_secs(10),
            suspect_grace: HumanDuration::from_secs(60),
            dead_retention: HumanDuration::from_secs(3600),
            generation_policy: GenerationPolicy::Monotonic,
        }
    }
}

/// Upper bound for every membership timing. Lease arithmetic is done in
/// epoch milliseconds and must not overflow.
pub const MAX_MEMBERSHIP_DURATION: Duration = Duration::from_secs(365 * 24 * 3600);

impl MembershipConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let timings = [
            ("membership.heartbeat_interval", self.heartbeat_interval),
            ("membership.lease_duration", self.lease_duration),
            ("membership.detection_interval", self.detection_interval),
            ("membership.suspect_grace", self.suspect_grace),
            ("membership.dead_retention", self.dead_retention),
        ];
        for (field, value) in timings {
            if value.get() > MAX_MEMBERSHIP_DURATION {
                return Err(ConfigError::invalid(
                    field,
                    format!("{value} exceeds the maximum of {}", HumanDuration(MAX_MEMBERSHIP_DURATION)),
                ));
            }
        }

        let lease = self.lease_duration.get();
        if lease.is_zero() {
            return Err(ConfigError::invalid("membership.lease_duration", "must be non-zero"));
        }
        if self.heartbeat_interval.get().is_zero() || self.detection_interval.get().is_zero() {
            return Err(ConfigError::invalid(
                "membership",
                "heartbeat_interval and detection_interval must be non-zero",
            ));
        }
        if lease <= self.heartbeat_interval.get() {
            return Err(ConfigError::invalid(
                "membership.lease_duration",
                format!(
                    "{} must exceed heartbeat_interval {}",
                    self.lease_duration, self.heartbeat_interval
                ),
            ));
        }
        if lease <= self.detection_interval.get() {
            return Err(ConfigError::invalid(
                "membership.lease_duration",
                format!(
                    "{} must exceed detection_interval {}",
                    self.lease_duration, self.detection_interval
                ),
            ));
        }
        if lease < self.detection_interval.get().saturating_mul(3) {
            warn!(
                lease = %self.lease_duration,
                detection_interval = %self.detection_interval,
                "lease is shorter than 3x the detection interval; expect false suspicions"
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff: HumanDuration,
    pub max_backoff: HumanDuration,
    /// Upper bound for one storage operation, retries included.
    pub operation_timeout: HumanDuration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: HumanDuration::from_millis(100),
            max_backoff: HumanDuration::from_secs(5),
            operation_timeout: HumanDuration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
        }
    }
}

/// Environment variables that override file settings.
pub mod env {
    pub const SILO_NAME_TEMPLATE: &str = "GRANARY_SILO_NAME_TEMPLATE";
    pub const ADVERTISED_ADDRESS: &str = "GRANARY_ADVERTISED_ADDRESS";
    pub const SILO_PORT: &str = "GRANARY_SILO_PORT";
    pub const GATEWAY_PORT: &str = "GRANARY_GATEWAY_PORT";
    pub const CLUSTER_ID: &str = "GRANARY_CLUSTER_ID";
    pub const SERVICE_ID: &str = "GRANARY_SERVICE_ID";
    pub const BACKEND_ENDPOINT: &str = "GRANARY_BACKEND_ENDPOINT";
    pub const BACKEND_CREDENTIAL: &str = "GRANARY_BACKEND_CREDENTIAL";
    pub const BACKEND_DATABASE: &str = "GRANARY_BACKEND_DATABASE";
}

impl GranaryConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `GRANARY_*` overrides using `lookup` (normally `std::env::var`).
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(env::SILO_NAME_TEMPLATE) {
            self.silo.name_template = v;
        }
        if let Some(v) = lookup(env::ADVERTISED_ADDRESS) {
            self.silo.advertised_address = v
                .parse()
                .map_err(|e| ConfigError::invalid("silo.advertised_address", format!("{v:?}: {e}")))?;
        }
        if let Some(v) = lookup(env::SILO_PORT) {
            self.silo.silo_port = parse_port("silo.silo_port", &v)?;
        }
        if let Some(v) = lookup(env::GATEWAY_PORT) {
            self.silo.gateway_port = parse_port("silo.gateway_port", &v)?;
        }
        if let Some(v) = lookup(env::CLUSTER_ID) {
            self.cluster.cluster_id = v;
        }
        if let Some(v) = lookup(env::SERVICE_ID) {
            self.cluster.service_id = v;
        }
        if let Some(v) = lookup(env::BACKEND_ENDPOINT) {
            self.backend.endpoint = v;
        }
        if let Some(v) = lookup(env::BACKEND_CREDENTIAL) {
            self.backend.credential = Some(Secret::new(v));
        }
        if let Some(v) = lookup(env::BACKEND_DATABASE) {
            self.backend.database = v;
        }
        Ok(())
    }

    /// Check every required field. Called before anything starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.cluster_id.trim().is_empty() {
            return Err(ConfigError::Missing("cluster.cluster_id"));
        }
        if self.cluster.service_id.trim().is_empty() {
            return Err(ConfigError::Missing("cluster.service_id"));
        }
        if self.silo.name_template.trim().is_empty() {
            return Err(ConfigError::Missing("silo.name_template"));
        }
        if self.silo.silo_port == 0 {
            return Err(ConfigError::invalid("silo.silo_port", "must be non-zero"));
        }
        if self.silo.gateway_port == self.silo.silo_port {
            return Err(ConfigError::invalid(
                "silo.gateway_port",
                "must differ from silo_port",
            ));
        }
        if self.backend.database.trim().is_empty() {
            return Err(ConfigError::Missing("backend.database"));
        }
        self.backend.location()?;
        self.membership.validate()?;
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
        }
        Ok(())
    }

    pub fn identity(&self) -> ClusterIdentity {
        ClusterIdentity::new(&self.cluster.cluster_id, &self.cluster.service_id)
    }

    pub fn endpoint(&self) -> SiloEndpoint {
        SiloEndpoint {
            address: self.silo.advertised_address,
            silo_port: self.silo.silo_port,
            gateway_port: self.silo.gateway_port,
        }
    }

    /// Expand the silo name template for `machine`.
    pub fn silo_name(&self, machine: &str) -> String {
        self.silo.name_template.replace("{machine}", machine)
    }
}

fn parse_port(field: &'static str, raw: &str) -> Result<u16, ConfigError> {
    raw.trim()
        .parse::<u16>()
        .map_err(|e| ConfigError::invalid(field, format!("{raw:?}: {e}")))
}

/// Best-effort host name for `{machine}` expansion.
pub fn machine_name() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
