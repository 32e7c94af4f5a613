//! The storage collaborator interface.

use std::fmt;

use thiserror::Error;

use crate::error::StateResult;

/// Opaque, per-key monotonic version token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(u64);

impl Version {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A token that is not exactly the form [`Version`]'s `Display` produces.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("not a version token: {0:?}")]
pub struct ParseVersionError(String);

impl std::str::FromStr for Version {
    type Err = ParseVersionError;

    /// Accepts only 16 lowercase hex digits, so distinct strings never
    /// name the same version.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let canonical = s.len() == 16 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if !canonical {
            return Err(ParseVersionError(s.to_string()));
        }
        u64::from_str_radix(s, 16)
            .map(Version)
            .map_err(|_| ParseVersionError(s.to_string()))
    }
}

/// A stored value with the version it was written at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub value: Vec<u8>,
    pub version: Version,
}

/// A versioned key-value namespace.
///
/// Every mutation is conditional. `expected = None` means "the key must not
/// exist"; `Some(v)` means "the key must currently be at version `v`". A
/// mismatch yields [`StateError::Conflict`](crate::StateError::Conflict) and
/// leaves the store untouched.
///
/// Implementations are synchronous; [`BackendClient`](crate::BackendClient)
/// moves calls onto the blocking pool.
pub trait StorageBackend: Send + Sync + 'static {
    /// Name of the namespace this backend reads and writes.
    fn namespace(&self) -> &str;

    /// Make sure the namespace exists, creating it if `allow_create`.
    fn ensure_namespace_exists(&self, allow_create: bool) -> StateResult<()>;

    fn get(&self, key: &str) -> StateResult<Option<Entry>>;

    /// Write `value` if the current version matches `expected`.
    fn put(&self, key: &str, value: &[u8], expected: Option<Version>) -> StateResult<Version>;

    /// Remove `key` if its current version is `expected`.
    fn delete(&self, key: &str, expected: Version) -> StateResult<()>;

    /// All entries whose key starts with `prefix`, in key order.
    fn list(&self, prefix: &str) -> StateResult<Vec<Entry>>;
}
