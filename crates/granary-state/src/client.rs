//! BackendClient — async access to a [`StorageBackend`].
//!
//! Backend calls are blocking, so each attempt runs on tokio's blocking
//! pool. Transient failures are retried with bounded backoff; conflicts
//! and every other error are returned on the first occurrence. The whole
//! operation, retries included, is bounded by `operation_timeout`.
//!
//! Only conditional writes exist, so a retried write re-validates the
//! version: if an earlier attempt did land, the retry reports a conflict
//! instead of applying the write twice.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::backend::{Entry, StorageBackend, Version};
use crate::error::{StateError, StateResult};
use crate::retry::RetryPolicy;

#[derive(Clone)]
pub struct BackendClient {
    backend: Arc<dyn StorageBackend>,
    retry: RetryPolicy,
    operation_timeout: Duration,
}

impl BackendClient {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            retry: RetryPolicy::default(),
            operation_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn namespace(&self) -> &str {
        self.backend.namespace()
    }

    pub async fn ensure_namespace_exists(&self, allow_create: bool) -> StateResult<()> {
        self.call("ensure_namespace", move |b| b.ensure_namespace_exists(allow_create))
            .await
    }

    pub async fn get(&self, key: &str) -> StateResult<Option<Entry>> {
        let key = key.to_string();
        self.call("get", move |b| b.get(&key)).await
    }

    pub async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        expected: Option<Version>,
    ) -> StateResult<Version> {
        let key = key.to_string();
        let value = Arc::new(value);
        self.call("put", move |b| b.put(&key, &value, expected)).await
    }

    pub async fn delete(&self, key: &str, expected: Version) -> StateResult<()> {
        let key = key.to_string();
        self.call("delete", move |b| b.delete(&key, expected)).await
    }

    pub async fn list(&self, prefix: &str) -> StateResult<Vec<Entry>> {
        let prefix = prefix.to_string();
        self.call("list", move |b| b.list(&prefix)).await
    }

    async fn call<T, F>(&self, operation: &'static str, f: F) -> StateResult<T>
    where
        T: Send + 'static,
        F: Fn(&dyn StorageBackend) -> StateResult<T> + Clone + Send + Sync + 'static,
    {
        let attempts = async {
            let mut attempt = 1;
            loop {
                let backend = Arc::clone(&self.backend);
                let f = f.clone();
                let result = tokio::task::spawn_blocking(move || f(backend.as_ref()))
                    .await
                    .unwrap_or_else(|e| {
                        Err(StateError::Unavailable(format!("backend task failed: {e}")))
                    });

                match result {
                    Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                        let delay = self.retry.backoff(attempt);
                        warn!(
                            namespace = %self.backend.namespace(),
                            operation,
                            attempt,
                            ?delay,
                            error = %e,
                            "transient backend error, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    other => return other,
                }
            }
        };

        match tokio::time::timeout(self.operation_timeout, attempts).await {
            Ok(result) => result,
            Err(_) => Err(StateError::DeadlineExceeded {
                operation,
                timeout_ms: self.operation_timeout.as_millis() as u64,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RedbBackend;

    fn client() -> BackendClient {
        let backend = RedbBackend::open_in_memory("client.test").unwrap();
        BackendClient::new(Arc::new(backend))
    }

    #[tokio::test]
    async fn round_trip_through_blocking_pool() {
        let client = client();
        client.ensure_namespace_exists(true).await.unwrap();

        let v1 = client.put("a", b"one".to_vec(), None).await.unwrap();
        let entry = client.get("a").await.unwrap().unwrap();
        assert_eq!(entry.value, b"one");
        assert_eq!(entry.version, v1);

        client.delete("a", v1).await.unwrap();
        assert!(client.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn conflicts_are_not_retried() {
        let client = client();
        client.ensure_namespace_exists(true).await.unwrap();
        client.put("a", b"one".to_vec(), None).await.unwrap();

        let err = client.put("a", b"two".to_vec(), None).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn namespace_missing_is_not_transient() {
        let client = client();
        let err = client.ensure_namespace_exists(false).await.unwrap_err();
        assert!(matches!(err, StateError::NamespaceMissing(_)));
        assert_eq!(client.namespace(), "client.test");
    }
}
