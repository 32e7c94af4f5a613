//! granary-state — versioned key-value storage for Granary.
//!
//! Both the membership directory and the grain state store sit on the
//! narrow [`StorageBackend`] interface: conditional put/delete against a
//! per-key [`Version`], point reads, and prefix listing inside one
//! namespace.
//!
//! # Architecture
//!
//! ```text
//! MembershipDirectory / GrainStateStore
//!   └── BackendClient (async: spawn_blocking + deadline + retry)
//!         └── Arc<dyn StorageBackend>
//!               └── RedbBackend (one redb table per namespace)
//! ```
//!
//! Versions are drawn from a database-wide commit sequence, so a key that
//! is deleted and re-created never reuses a version a stale caller may
//! still hold.

pub mod backend;
pub mod client;
pub mod error;
pub mod redb_backend;
pub mod retry;
mod tables;

pub use backend::{Entry, ParseVersionError, StorageBackend, Version};
pub use client::BackendClient;
pub use error::{StateError, StateResult};
pub use redb_backend::RedbBackend;
pub use retry::RetryPolicy;
