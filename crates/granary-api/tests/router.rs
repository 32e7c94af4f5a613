//! Router-level tests: routes, headers and status codes over HTTP requests.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use tower::ServiceExt;

use granary_api::{ApiState, build_router};
use granary_cluster::{AgentConfig, DirectoryConfig, MembershipDirectory, SiloAgent, SiloLifecycle};
use granary_core::config::MembershipConfig;
use granary_core::{ClusterIdentity, ManualClock, SiloEndpoint};
use granary_grains::GrainStateStore;
use granary_state::{BackendClient, RedbBackend};

async fn router() -> (Router, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let backend = RedbBackend::open_in_memory("granary.membership").unwrap();
    let identity = ClusterIdentity::new("c1", "svc1");
    let directory = MembershipDirectory::open(
        BackendClient::new(Arc::new(backend.clone())),
        DirectoryConfig {
            identity: identity.clone(),
            membership: MembershipConfig::default(),
            create_resources: true,
        },
        clock.clone(),
    )
    .await
    .unwrap();
    let grains = GrainStateStore::open(
        BackendClient::new(Arc::new(backend.with_namespace("granary.grains").unwrap())),
        true,
    )
    .await
    .unwrap();
    let agent = SiloAgent::new(
        Arc::new(directory),
        AgentConfig {
            name: "silo-test".to_string(),
            identity,
            endpoint: SiloEndpoint {
                address: "127.0.0.1".parse().unwrap(),
                silo_port: 11111,
                gateway_port: 30000,
            },
            heartbeat_interval: Duration::from_secs(10),
            detection_interval: Duration::from_secs(10),
        },
        clock.clone(),
    );
    agent.on_start().await.unwrap();

    let state = ApiState {
        agent: Arc::new(agent),
        grains,
    };
    (build_router(state), clock)
}

async fn json_body(resp: axum::response::Response) -> serde_json::Value {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn healthz_reports_silo_id() {
    let (app, _) = router().await;
    let resp = app
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["active"], true);
    assert_eq!(body["silo"], "silo-test@1700000000000");
}

#[tokio::test]
async fn active_silos_listed_as_json() {
    let (app, _) = router().await;
    let resp = app
        .oneshot(Request::get("/api/v1/silos").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["success"], true);
    let silos = body["data"].as_array().unwrap();
    assert_eq!(silos.len(), 1);
    assert_eq!(silos[0]["status"], "active");
    assert_eq!(silos[0]["silo_id"]["name"], "silo-test");
}

#[tokio::test]
async fn conditional_grain_writes_over_http() {
    let (app, _) = router().await;

    let resp = app
        .clone()
        .oneshot(
            Request::put("/api/v1/grains/account/g42")
                .header(header::IF_NONE_MATCH, "*")
                .body(Body::from("P1"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let e1 = resp.headers()[header::ETAG].to_str().unwrap().to_string();

    let resp = app
        .clone()
        .oneshot(
            Request::put("/api/v1/grains/account/g42")
                .header(header::IF_MATCH, "\"0000000000000000\"")
                .body(Body::from("P2"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PRECONDITION_FAILED);

    let resp = app
        .clone()
        .oneshot(
            Request::put("/api/v1/grains/account/g42")
                .header(header::IF_MATCH, e1.as_str())
                .body(Body::from("P2"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let e2 = resp.headers()[header::ETAG].to_str().unwrap().to_string();
    assert_ne!(e1, e2);

    let resp = app
        .oneshot(
            Request::get("/api/v1/grains/account/g42")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[header::ETAG].to_str().unwrap(), e2);
    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"P2");
}

#[tokio::test]
async fn lapsed_membership_stops_grain_traffic() {
    let (app, clock) = router().await;
    clock.advance(Duration::from_secs(31));

    let resp = app
        .clone()
        .oneshot(
            Request::get("/api/v1/grains/account/g42")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    let resp = app
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn delete_without_if_match_is_rejected() {
    let (app, _) = router().await;
    let resp = app
        .oneshot(
            Request::delete("/api/v1/grains/account/g42")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PRECONDITION_REQUIRED);
}

#[tokio::test]
async fn wildcard_if_match_is_a_bad_request() {
    let (app, _) = router().await;
    let resp = app
        .clone()
        .oneshot(
            Request::put("/api/v1/grains/account/g7")
                .header(header::IF_NONE_MATCH, "*")
                .body(Body::from("P1"))
                .unwrap(),
        )
        .await
        .unwrap();
    let e1 = resp.headers()[header::ETAG].to_str().unwrap().to_string();

    for method in ["PUT", "DELETE"] {
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri("/api/v1/grains/account/g7")
                    .header(header::IF_MATCH, "*")
                    .body(Body::from("P2"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{method}");
    }

    let resp = app
        .oneshot(
            Request::get("/api/v1/grains/account/g7")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.headers()[header::ETAG].to_str().unwrap(), e1);
}
