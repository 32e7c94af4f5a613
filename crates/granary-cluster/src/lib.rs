//! granary-cluster — cluster membership for Granary silos.
//!
//! Provides the lease-based membership directory, the failure-detection
//! pass that ages unresponsive silos out of the cluster, and the silo
//! agent that drives join, heartbeat and leave from a host process.
//!
//! # Architecture
//!
//! ```text
//! Host process (granaryd)
//!   └── SiloAgent (SiloLifecycle)
//!       ├── on_start() → join, fails start-up when rejected
//!       ├── heartbeat tick → renew lease, rejoin as new generation if lost
//!       ├── detection tick → failure_detection_pass(now)
//!       └── on_stop() → leave (best effort)
//!
//! MembershipDirectory
//!   ├── one SiloRecord per silo name, JSON in a versioned backend
//!   ├── every mutation is a compare-and-swap on the record version
//!   └── cluster identity record guards the namespace
//! ```

pub mod agent;
pub mod directory;
pub mod error;
pub mod record;

pub use agent::{AgentConfig, SiloAgent, SiloLifecycle, run_lifecycle};
pub use directory::{
    DetectionReport, DirectoryConfig, HeartbeatOutcome, JoinOutcome, JoinRejection,
    MembershipDirectory,
};
pub use error::{MembershipError, MembershipResult};
pub use record::{SiloRecord, SiloStatus};
