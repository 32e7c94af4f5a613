//! BackendClient retry and deadline behaviour against misbehaving backends.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use granary_state::*;

/// Fails the first `failures` calls with a transient error, then
/// delegates to an in-memory redb backend.
struct FlakyBackend {
    inner: RedbBackend,
    failures: AtomicU32,
    calls: AtomicU32,
}

impl FlakyBackend {
    fn new(failures: u32) -> Self {
        let inner = RedbBackend::open_in_memory("flaky").unwrap();
        inner.ensure_namespace_exists(true).unwrap();
        Self {
            inner,
            failures: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        }
    }

    fn trip(&self) -> StateResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StateError::Unavailable("connection reset".to_string()));
        }
        Ok(())
    }
}

impl StorageBackend for FlakyBackend {
    fn namespace(&self) -> &str {
        self.inner.namespace()
    }

    fn ensure_namespace_exists(&self, allow_create: bool) -> StateResult<()> {
        self.trip()?;
        self.inner.ensure_namespace_exists(allow_create)
    }

    fn get(&self, key: &str) -> StateResult<Option<Entry>> {
        self.trip()?;
        self.inner.get(key)
    }

    fn put(&self, key: &str, value: &[u8], expected: Option<Version>) -> StateResult<Version> {
        self.trip()?;
        self.inner.put(key, value, expected)
    }

    fn delete(&self, key: &str, expected: Version) -> StateResult<()> {
        self.trip()?;
        self.inner.delete(key, expected)
    }

    fn list(&self, prefix: &str) -> StateResult<Vec<Entry>> {
        self.trip()?;
        self.inner.list(prefix)
    }
}

/// Sleeps on every call.
struct SlowBackend {
    inner: RedbBackend,
    delay: Duration,
}

impl StorageBackend for SlowBackend {
    fn namespace(&self) -> &str {
        self.inner.namespace()
    }

    fn ensure_namespace_exists(&self, allow_create: bool) -> StateResult<()> {
        self.inner.ensure_namespace_exists(allow_create)
    }

    fn get(&self, key: &str) -> StateResult<Option<Entry>> {
        std::thread::sleep(self.delay);
        self.inner.get(key)
    }

    fn put(&self, key: &str, value: &[u8], expected: Option<Version>) -> StateResult<Version> {
        std::thread::sleep(self.delay);
        self.inner.put(key, value, expected)
    }

    fn delete(&self, key: &str, expected: Version) -> StateResult<()> {
        std::thread::sleep(self.delay);
        self.inner.delete(key, expected)
    }

    fn list(&self, prefix: &str) -> StateResult<Vec<Entry>> {
        std::thread::sleep(self.delay);
        self.inner.list(prefix)
    }
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
    }
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let backend = Arc::new(FlakyBackend::new(2));
    let client = BackendClient::new(backend.clone()).with_retry(fast_retry(5));

    let version = client.put("k", b"v".to_vec(), None).await.unwrap();

    assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    let entry = client.get("k").await.unwrap().unwrap();
    assert_eq!(entry.version, version);
}

#[tokio::test]
async fn retries_are_bounded_by_attempt_limit() {
    let backend = Arc::new(FlakyBackend::new(10));
    let client = BackendClient::new(backend.clone()).with_retry(fast_retry(3));

    let err = client.get("k").await.unwrap_err();

    assert!(err.is_transient());
    assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn no_retry_policy_surfaces_first_failure() {
    let backend = Arc::new(FlakyBackend::new(1));
    let client = BackendClient::new(backend.clone()).with_retry(RetryPolicy::no_retry());

    assert!(client.list("").await.unwrap_err().is_transient());
    assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    assert!(client.list("").await.unwrap().is_empty());
}

#[tokio::test]
async fn slow_backend_hits_deadline() {
    let inner = RedbBackend::open_in_memory("slow").unwrap();
    inner.ensure_namespace_exists(true).unwrap();
    let backend = Arc::new(SlowBackend {
        inner,
        delay: Duration::from_millis(300),
    });
    let client = BackendClient::new(backend).with_operation_timeout(Duration::from_millis(50));

    let err = client.get("k").await.unwrap_err();
    assert!(matches!(
        err,
        StateError::DeadlineExceeded { operation: "get", timeout_ms: 50 }
    ));
}

#[tokio::test]
async fn timed_out_write_is_all_or_nothing() {
    let inner = RedbBackend::open_in_memory("slow").unwrap();
    inner.ensure_namespace_exists(true).unwrap();
    let backend = Arc::new(SlowBackend {
        inner: inner.clone(),
        delay: Duration::from_millis(200),
    });
    let client = BackendClient::new(backend).with_operation_timeout(Duration::from_millis(20));

    let err = client.put("k", b"v".to_vec(), None).await.unwrap_err();
    assert!(matches!(err, StateError::DeadlineExceeded { .. }));

    // The abandoned attempt either committed whole or not at all.
    tokio::time::sleep(Duration::from_millis(400)).await;
    if let Some(entry) = inner.get("k").unwrap() {
        assert_eq!(entry.value, b"v");
    }
}

#[tokio::test]
async fn concurrent_writers_with_same_expectation_exactly_one_wins() {
    let backend = RedbBackend::open_in_memory("race").unwrap();
    backend.ensure_namespace_exists(true).unwrap();
    let client = BackendClient::new(Arc::new(backend));
    let v0 = client.put("k", b"0".to_vec(), None).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..8u8 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            client.put("k", vec![i], Some(v0)).await
        }));
    }

    let mut wins = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => wins += 1,
            Err(e) if e.is_conflict() => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(conflicts, 7);
}
