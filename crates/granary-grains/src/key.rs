//! Grain addressing and eTags.

use std::fmt;

use serde::{Deserialize, Serialize};

use granary_state::Version;

use crate::error::{GrainResult, GrainStorageError};

/// Stable identity of a grain: its type plus a primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GrainKey {
    pub grain_type: String,
    pub primary_key: String,
}

impl GrainKey {
    /// Build a key, rejecting forms that cannot be stored unambiguously.
    pub fn new(grain_type: impl Into<String>, primary_key: impl Into<String>) -> GrainResult<Self> {
        let key = Self {
            grain_type: grain_type.into(),
            primary_key: primary_key.into(),
        };
        key.validate()?;
        Ok(key)
    }

    fn validate(&self) -> GrainResult<()> {
        let reason = if self.grain_type.is_empty() {
            "grain type is empty"
        } else if self.grain_type.contains('/') {
            "grain type contains '/'"
        } else if self.primary_key.is_empty() {
            "primary key is empty"
        } else {
            return Ok(());
        };
        Err(GrainStorageError::InvalidKey {
            key: self.to_string(),
            reason,
        })
    }

    /// Backend key: `{type}/{key}`. The type never contains `/`, so the
    /// first slash always splits the two parts.
    pub fn storage_key(&self) -> String {
        format!("{}/{}", self.grain_type, self.primary_key)
    }
}

impl fmt::Display for GrainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.grain_type, self.primary_key)
    }
}

/// Opaque version token handed to callers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ETag(String);

impl ETag {
    /// Wrap a token received from outside, e.g. an `If-Match` header.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The backend version this tag names, or `None` if the tag was never
    /// issued by this store.
    pub(crate) fn version(&self) -> Option<Version> {
        self.0.parse().ok()
    }
}

impl From<Version> for ETag {
    fn from(v: Version) -> Self {
        Self(v.to_string())
    }
}

impl fmt::Display for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
