//! GrainStateStore — optimistic-concurrency state persistence for grains.
//!
//! Payloads are opaque bytes; `read_json`/`write_json` wrap serde types.
//! Nothing is cached between calls: every read goes to the backend and
//! every write is checked against the eTag stored at that instant.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use granary_state::{BackendClient, Version};

use crate::error::{GrainResult, GrainStorageError};
use crate::key::{ETag, GrainKey};

/// A grain's stored payload and the eTag it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrainState {
    pub payload: Vec<u8>,
    pub etag: ETag,
}

/// Grain state over a versioned backend namespace.
#[derive(Clone)]
pub struct GrainStateStore {
    client: BackendClient,
}

impl GrainStateStore {
    /// Check the namespace exists, creating it when `create_resources`.
    pub async fn open(client: BackendClient, create_resources: bool) -> GrainResult<Self> {
        client.ensure_namespace_exists(create_resources).await?;
        info!(namespace = %client.namespace(), "grain state store opened");
        Ok(Self { client })
    }

    /// Current state, or `None` if the grain has never written (or was cleared).
    pub async fn read(&self, key: &GrainKey) -> GrainResult<Option<GrainState>> {
        let state = self
            .client
            .get(&key.storage_key())
            .await?
            .map(|entry| GrainState {
                payload: entry.value,
                etag: ETag::from(entry.version),
            });
        debug!(%key, found = state.is_some(), "grain state read");
        Ok(state)
    }

    /// Store `payload` if the stored eTag is still `expected`.
    ///
    /// `expected = None` is the "no entry" sentinel: the write only succeeds
    /// if the grain has no stored state.
    pub async fn write(
        &self,
        key: &GrainKey,
        payload: Vec<u8>,
        expected: Option<&ETag>,
    ) -> GrainResult<ETag> {
        let expected_version = self.expected_version(key, expected).await?;
        let result = self
            .client
            .put(&key.storage_key(), payload, expected_version)
            .await
            .map_err(GrainStorageError::from);

        match result {
            Ok(version) => {
                let etag = ETag::from(version);
                debug!(%key, %etag, "grain state written");
                Ok(etag)
            }
            Err(e) => Err(self.report(key, e)),
        }
    }

    /// Remove the grain's state if the stored eTag is still `expected`.
    pub async fn clear(&self, key: &GrainKey, expected: &ETag) -> GrainResult<()> {
        let Some(version) = self.expected_version(key, Some(expected)).await? else {
            return Err(self.report(key, self.conflict(key, Some(expected), None)));
        };
        match self.client.delete(&key.storage_key(), version).await {
            Ok(()) => {
                debug!(%key, etag = %expected, "grain state cleared");
                Ok(())
            }
            Err(e) => Err(self.report(key, e.into())),
        }
    }

    pub async fn read_json<T: DeserializeOwned>(
        &self,
        key: &GrainKey,
    ) -> GrainResult<Option<(T, ETag)>> {
        let Some(state) = self.read(key).await? else {
            return Ok(None);
        };
        let value = serde_json::from_slice(&state.payload).map_err(|e| {
            GrainStorageError::Serialization {
                key: key.to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok(Some((value, state.etag)))
    }

    pub async fn write_json<T: Serialize>(
        &self,
        key: &GrainKey,
        value: &T,
        expected: Option<&ETag>,
    ) -> GrainResult<ETag> {
        let payload = serde_json::to_vec(value).map_err(|e| GrainStorageError::Serialization {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        self.write(key, payload, expected).await
    }

    /// Translate a caller's eTag into a backend version. A tag this store
    /// never issued cannot match anything stored, so it is a conflict.
    async fn expected_version(
        &self,
        key: &GrainKey,
        expected: Option<&ETag>,
    ) -> GrainResult<Option<Version>> {
        let Some(tag) = expected else {
            return Ok(None);
        };
        match tag.version() {
            Some(version) => Ok(Some(version)),
            None => {
                let actual = self
                    .client
                    .get(&key.storage_key())
                    .await?
                    .map(|entry| ETag::from(entry.version));
                Err(self.report(key, self.conflict(key, Some(tag), actual)))
            }
        }
    }

    fn conflict(&self, key: &GrainKey, expected: Option<&ETag>, actual: Option<ETag>) -> GrainStorageError {
        GrainStorageError::Conflict {
            key: key.storage_key(),
            expected: expected.cloned(),
            actual,
        }
    }

    /// Conflicts mean a duplicate activation or a raced retry; both are
    /// worth a warning.
    fn report(&self, key: &GrainKey, err: GrainStorageError) -> GrainStorageError {
        if let GrainStorageError::Conflict {
            expected, actual, ..
        } = &err
        {
            warn!(%key, ?expected, ?actual, "grain state write rejected: etag conflict");
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use granary_state::RedbBackend;
    use serde::Deserialize;
    use std::sync::Arc;

    async fn store() -> GrainStateStore {
        let backend = RedbBackend::open_in_memory("test.grains").unwrap();
        GrainStateStore::open(BackendClient::new(Arc::new(backend)), true)
            .await
            .unwrap()
    }

    fn key(k: &str) -> GrainKey {
        GrainKey::new("counter", k).unwrap()
    }

    #[tokio::test]
    async fn write_then_read_round_trip() {
        let store = store().await;
        let k = key("g1");
        assert!(store.read(&k).await.unwrap().is_none());

        let e1 = store.write(&k, b"v1".to_vec(), None).await.unwrap();
        let state = store.read(&k).await.unwrap().unwrap();
        assert_eq!(state, GrainState { payload: b"v1".to_vec(), etag: e1.clone() });

        let e2 = store.write(&k, b"v2".to_vec(), Some(&e1)).await.unwrap();
        assert_ne!(e1, e2);
        assert_eq!(store.read(&k).await.unwrap().unwrap().payload, b"v2");
    }

    #[tokio::test]
    async fn sentinel_write_conflicts_when_entry_exists() {
        let store = store().await;
        let k = key("g1");
        let e1 = store.write(&k, b"v1".to_vec(), None).await.unwrap();

        let err = store.write(&k, b"v2".to_vec(), None).await.unwrap_err();
        match err {
            GrainStorageError::Conflict { expected, actual, .. } => {
                assert_eq!(expected, None);
                assert_eq!(actual, Some(e1));
            }
            other => panic!("expected conflict, got {other}"),
        }
    }

    #[tokio::test]
    async fn etag_write_conflicts_when_entry_missing() {
        let store = store().await;
        let k = key("g1");
        let e1 = store.write(&k, b"v1".to_vec(), None).await.unwrap();
        store.clear(&k, &e1).await.unwrap();

        assert!(store.write(&k, b"v2".to_vec(), Some(&e1)).await.unwrap_err().is_conflict());
        assert!(store.clear(&k, &e1).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn foreign_etag_is_a_conflict() {
        let store = store().await;
        let k = key("g1");
        let e1 = store.write(&k, b"v1".to_vec(), None).await.unwrap();

        let bogus = ETag::new("W/\"abc\"");
        let err = store.write(&k, b"v2".to_vec(), Some(&bogus)).await.unwrap_err();
        match err {
            GrainStorageError::Conflict { actual, .. } => assert_eq!(actual, Some(e1)),
            other => panic!("expected conflict, got {other}"),
        }
        assert!(store.clear(&k, &bogus).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn only_the_issued_etag_spelling_matches() {
        let store = store().await;
        let k = key("g1");
        let e1 = store.write(&k, b"v1".to_vec(), None).await.unwrap();

        let trimmed = e1.as_str().trim_start_matches('0');
        for alias in [format!("+{trimmed}"), trimmed.to_string(), e1.as_str().to_uppercase()] {
            if alias == e1.as_str() {
                continue;
            }
            let err = store
                .write(&k, b"v2".to_vec(), Some(&ETag::new(alias.clone())))
                .await
                .unwrap_err();
            assert!(err.is_conflict(), "{alias} should not match {e1}");
        }
        store.write(&k, b"v2".to_vec(), Some(&e1)).await.unwrap();
    }

    #[tokio::test]
    async fn etags_never_repeat_across_clear_and_recreate() {
        let store = store().await;
        let k = key("g1");
        let e1 = store.write(&k, b"v1".to_vec(), None).await.unwrap();
        store.clear(&k, &e1).await.unwrap();
        let e2 = store.write(&k, b"v1".to_vec(), None).await.unwrap();

        assert_ne!(e1, e2);
        assert!(store.write(&k, b"stale".to_vec(), Some(&e1)).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let store = store().await;
        let a = store.write(&key("a"), b"a".to_vec(), None).await.unwrap();
        store.write(&key("b"), b"b".to_vec(), None).await.unwrap();

        store.write(&key("a"), b"a2".to_vec(), Some(&a)).await.unwrap();
        assert_eq!(store.read(&key("b")).await.unwrap().unwrap().payload, b"b");
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Counter {
        value: u64,
    }

    #[tokio::test]
    async fn json_helpers() {
        let store = store().await;
        let k = key("json");
        let etag = store.write_json(&k, &Counter { value: 1 }, None).await.unwrap();

        let (counter, read_tag): (Counter, _) = store.read_json(&k).await.unwrap().unwrap();
        assert_eq!(counter, Counter { value: 1 });
        assert_eq!(read_tag, etag);

        store.write(&k, b"not json".to_vec(), Some(&etag)).await.unwrap();
        let err = store.read_json::<Counter>(&k).await.unwrap_err();
        assert!(matches!(err, GrainStorageError::Serialization { .. }));
    }

    #[tokio::test]
    async fn missing_namespace_without_creation() {
        let backend = RedbBackend::open_in_memory("absent.grains").unwrap();
        let err = GrainStateStore::open(BackendClient::new(Arc::new(backend)), false)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, GrainStorageError::Configuration(_)));
    }
}
