//! Optimistic-concurrency behaviour of the grain state store.

use std::sync::Arc;

use granary_grains::*;
use granary_state::{BackendClient, RedbBackend};

async fn in_memory() -> GrainStateStore {
    let backend = RedbBackend::open_in_memory("svc1.grains").unwrap();
    GrainStateStore::open(BackendClient::new(Arc::new(backend)), true)
        .await
        .unwrap()
}

#[tokio::test]
async fn stale_writer_is_rejected_then_retries_with_fresh_etag() {
    let store = in_memory().await;
    let g42 = GrainKey::new("account", "g42").unwrap();

    let e1 = store.write(&g42, b"P1".to_vec(), None).await.unwrap();

    // A second activation still holding the pre-write view.
    let e0 = ETag::new("0000000000000000");
    let err = store.write(&g42, b"P2".to_vec(), Some(&e0)).await.unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(store.read(&g42).await.unwrap().unwrap().payload, b"P1");

    let e2 = store.write(&g42, b"P2".to_vec(), Some(&e1)).await.unwrap();
    assert_ne!(e2, e1);
    let state = store.read(&g42).await.unwrap().unwrap();
    assert_eq!(state.payload, b"P2");
    assert_eq!(state.etag, e2);
}

#[tokio::test]
async fn concurrent_writers_on_same_etag_exactly_one_wins() {
    let store = in_memory().await;
    let key = GrainKey::new("account", "contended").unwrap();
    let e1 = store.write(&key, b"base".to_vec(), None).await.unwrap();

    let mut writers = Vec::new();
    for i in 0..8u8 {
        let store = store.clone();
        let key = key.clone();
        let e1 = e1.clone();
        writers.push(tokio::spawn(async move {
            store.write(&key, vec![i], Some(&e1)).await
        }));
    }

    let mut winners = Vec::new();
    for (i, w) in writers.into_iter().enumerate() {
        match w.await.unwrap() {
            Ok(etag) => winners.push((i as u8, etag)),
            Err(e) => assert!(e.is_conflict(), "unexpected error: {e}"),
        }
    }
    assert_eq!(winners.len(), 1);
    let (value, etag) = &winners[0];
    let state = store.read(&key).await.unwrap().unwrap();
    assert_eq!(state.payload, vec![*value]);
    assert_eq!(&state.etag, etag);
}

#[tokio::test]
async fn concurrent_first_writes_exactly_one_wins() {
    let store = in_memory().await;
    let key = GrainKey::new("account", "fresh").unwrap();

    let handles: Vec<_> = (0..4u8)
        .map(|i| {
            let store = store.clone();
            let key = key.clone();
            tokio::spawn(async move { store.write(&key, vec![i], None).await })
        })
        .collect();

    let mut ok = 0;
    for h in handles {
        if h.await.unwrap().is_ok() {
            ok += 1;
        }
    }
    assert_eq!(ok, 1);
}

#[tokio::test]
async fn state_survives_reopen_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grains.redb");
    let key = GrainKey::new("account", "durable").unwrap();

    let etag = {
        let backend = RedbBackend::open(&path, "svc1.grains").unwrap();
        let store = GrainStateStore::open(BackendClient::new(Arc::new(backend)), true)
            .await
            .unwrap();
        store.write(&key, b"kept".to_vec(), None).await.unwrap()
    };

    let backend = RedbBackend::open(&path, "svc1.grains").unwrap();
    let store = GrainStateStore::open(BackendClient::new(Arc::new(backend)), false)
        .await
        .unwrap();
    let state = store.read(&key).await.unwrap().unwrap();
    assert_eq!(state.payload, b"kept");
    assert_eq!(state.etag, etag);
}
