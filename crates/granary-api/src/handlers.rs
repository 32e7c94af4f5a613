//! REST API handlers.
//!
//! Membership handlers return JSON. Grain handlers move the raw payload
//! bytes and carry the eTag in the `ETag` header.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::warn;

use granary_cluster::{MembershipError, SiloRecord};
use granary_grains::{ETag, GrainKey, GrainStorageError};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn membership_error(e: MembershipError) -> Response {
    let status = match e {
        MembershipError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status)
}

fn grain_error(e: GrainStorageError) -> Response {
    let status = match &e {
        GrainStorageError::Conflict { .. } => StatusCode::PRECONDITION_FAILED,
        GrainStorageError::InvalidKey { .. } => StatusCode::BAD_REQUEST,
        GrainStorageError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        GrainStorageError::Configuration(_)
        | GrainStorageError::Serialization { .. }
        | GrainStorageError::Storage(_) => {
            warn!(error = %e, "grain storage failure");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(&e.to_string(), status)
}

/// A silo whose membership lapsed must not serve grain traffic.
fn ensure_serving(state: &ApiState) -> Result<(), Response> {
    if state.agent.is_active() {
        Ok(())
    } else {
        Err(error_response(
            "silo is not an active cluster member",
            StatusCode::SERVICE_UNAVAILABLE,
        ))
    }
}

fn etag_header(etag: &ETag) -> String {
    format!("\"{etag}\"")
}

fn parse_etag(value: &HeaderValue) -> Option<ETag> {
    let raw = value.to_str().ok()?.trim();
    let raw = raw.strip_prefix("W/").unwrap_or(raw);
    Some(ETag::new(raw.trim_matches('"')))
}

/// What the caller expects to find stored before a write.
enum Precondition {
    /// `If-None-Match: *`: no entry.
    Absent,
    /// `If-Match: "<etag>"`.
    Matches(ETag),
}

fn precondition(headers: &HeaderMap) -> Result<Precondition, Response> {
    if let Some(value) = headers.get(header::IF_MATCH) {
        if value.as_bytes().trim_ascii() == b"*" {
            return Err(error_response(
                "If-Match: * is not supported; send the eTag from a read",
                StatusCode::BAD_REQUEST,
            ));
        }
        return parse_etag(value).map(Precondition::Matches).ok_or_else(|| {
            error_response("malformed If-Match header", StatusCode::BAD_REQUEST)
        });
    }
    match headers.get(header::IF_NONE_MATCH) {
        Some(value) if value.as_bytes() == b"*" => Ok(Precondition::Absent),
        Some(_) => Err(error_response(
            "only If-None-Match: * is supported",
            StatusCode::BAD_REQUEST,
        )),
        None => Err(error_response(
            "If-Match or If-None-Match: * is required",
            StatusCode::PRECONDITION_REQUIRED,
        )),
    }
}

#[derive(serde::Serialize)]
struct Health {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    silo: Option<String>,
    active: bool,
}

/// GET /healthz
pub async fn healthz(State(state): State<ApiState>) -> impl IntoResponse {
    let active = state.agent.is_active();
    let silo = state.agent.silo_id().await.map(|id| id.to_string());
    let (status, label) = if active {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not_member")
    };
    (
        status,
        Json(Health {
            status: label,
            silo,
            active,
        }),
    )
}

// ── Membership ─────────────────────────────────────────────────

/// GET /api/v1/silos
pub async fn list_active_silos(State(state): State<ApiState>) -> Response {
    match state.agent.directory().list_active().await {
        Ok(silos) => ApiResponse::<Vec<SiloRecord>>::ok(silos).into_response(),
        Err(e) => membership_error(e),
    }
}

/// GET /api/v1/silos/all
pub async fn list_all_silos(State(state): State<ApiState>) -> Response {
    match state.agent.directory().list_all().await {
        Ok(silos) => ApiResponse::<Vec<SiloRecord>>::ok(silos).into_response(),
        Err(e) => membership_error(e),
    }
}

// ── Grain state ────────────────────────────────────────────────

/// GET /api/v1/grains/{grain_type}/{key}
pub async fn read_grain(
    State(state): State<ApiState>,
    Path((grain_type, key)): Path<(String, String)>,
) -> Response {
    if let Err(resp) = ensure_serving(&state) {
        return resp;
    }
    let key = match GrainKey::new(grain_type, key) {
        Ok(key) => key,
        Err(e) => return grain_error(e),
    };
    match state.grains.read(&key).await {
        Ok(Some(grain)) => (
            StatusCode::OK,
            [
                (header::ETAG, etag_header(&grain.etag)),
                (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            ],
            grain.payload,
        )
            .into_response(),
        Ok(None) => error_response("grain state not found", StatusCode::NOT_FOUND),
        Err(e) => grain_error(e),
    }
}

/// PUT /api/v1/grains/{grain_type}/{key}
pub async fn write_grain(
    State(state): State<ApiState>,
    Path((grain_type, key)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(resp) = ensure_serving(&state) {
        return resp;
    }
    let key = match GrainKey::new(grain_type, key) {
        Ok(key) => key,
        Err(e) => return grain_error(e),
    };
    let expected = match precondition(&headers) {
        Ok(Precondition::Absent) => None,
        Ok(Precondition::Matches(etag)) => Some(etag),
        Err(resp) => return resp,
    };

    match state.grains.write(&key, body.to_vec(), expected.as_ref()).await {
        Ok(etag) => {
            let status = if expected.is_none() {
                StatusCode::CREATED
            } else {
                StatusCode::OK
            };
            (
                status,
                [(header::ETAG, etag_header(&etag))],
                ApiResponse::ok(etag.to_string()),
            )
                .into_response()
        }
        Err(e) => grain_error(e),
    }
}

/// DELETE /api/v1/grains/{grain_type}/{key}
pub async fn clear_grain(
    State(state): State<ApiState>,
    Path((grain_type, key)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = ensure_serving(&state) {
        return resp;
    }
    let key = match GrainKey::new(grain_type, key) {
        Ok(key) => key,
        Err(e) => return grain_error(e),
    };
    let expected = match precondition(&headers) {
        Ok(Precondition::Matches(etag)) => etag,
        Ok(Precondition::Absent) => {
            return error_response(
                "clearing requires If-Match",
                StatusCode::PRECONDITION_REQUIRED,
            );
        }
        Err(resp) => return resp,
    };

    match state.grains.clear(&key, &expected).await {
        Ok(()) => ApiResponse::ok("cleared").into_response(),
        Err(e) => grain_error(e),
    }
}
