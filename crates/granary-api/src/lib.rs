//! granary-api — REST API for a Granary silo.
//!
//! The router is only built once the silo has joined the cluster; while
//! the silo's membership is lapsed, grain routes answer `503`.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/healthz` | Silo liveness and membership state |
//! | GET | `/api/v1/silos` | Active silos |
//! | GET | `/api/v1/silos/all` | Every membership record |
//! | GET | `/api/v1/grains/{grain_type}/{key}` | Read grain state (`ETag` header) |
//! | PUT | `/api/v1/grains/{grain_type}/{key}` | Write with `If-Match` or `If-None-Match: *` |
//! | DELETE | `/api/v1/grains/{grain_type}/{key}` | Clear with `If-Match` |
//!
//! A stale `If-Match` yields `412 Precondition Failed`; a write or clear
//! without a precondition yields `428 Precondition Required`.

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;

use granary_cluster::SiloAgent;
use granary_grains::GrainStateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub agent: Arc<SiloAgent>,
    pub grains: GrainStateStore,
}

pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/silos", get(handlers::list_active_silos))
        .route("/silos/all", get(handlers::list_all_silos))
        .route(
            "/grains/{grain_type}/{key}",
            get(handlers::read_grain)
                .put(handlers::write_grain)
                .delete(handlers::clear_grain),
        )
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz).with_state(state))
}
