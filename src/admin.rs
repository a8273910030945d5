//! Admin API: health snapshots, backend registration, catalog refresh, and
//! call statistics. Mutating endpoints are authenticated with a bearer
//! token that is independent from tool-traffic identity.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::registry::{BackendDescriptor, RegistryError, TransportKind};
use crate::router::Gateway;

pub fn routes() -> Router<Arc<Gateway>> {
    Router::new()
        .route("/health/servers", get(health_servers))
        .route("/admin/backends", post(register_backend))
        .route("/admin/backends/{id}", delete(deregister_backend))
        .route("/admin/catalog/refresh", post(refresh_catalog))
        .route("/admin/stats", get(stats))
}

/// Bearer check against ADMIN_TOKEN. With no token configured the mutating
/// endpoints stay disabled.
fn require_admin(gateway: &Gateway, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = gateway.config.admin_token.as_deref() else {
        return Err((
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({"error": "admin API disabled: no admin token configured"})),
        )
            .into_response());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v).trim());
    if presented == Some(expected) {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "missing or invalid admin token"})),
        )
            .into_response())
    }
}

#[derive(Serialize)]
struct ServerHealthView {
    is_healthy: bool,
    consecutive_failures: u32,
    last_error: Option<String>,
    last_success: Option<DateTime<Utc>>,
    last_probe: Option<DateTime<Utc>>,
}

/// Open (unauthenticated) health snapshot, keyed by backend URL.
async fn health_servers(
    State(gateway): State<Arc<Gateway>>,
) -> Json<HashMap<String, ServerHealthView>> {
    let mut view = HashMap::new();
    for snapshot in gateway.registry.snapshot() {
        view.insert(
            snapshot.descriptor.url.clone(),
            ServerHealthView {
                is_healthy: snapshot.health.is_healthy,
                consecutive_failures: snapshot.health.consecutive_failures,
                last_error: snapshot.health.last_error,
                last_success: snapshot.health.last_success_at,
                last_probe: snapshot.health.last_probe_at,
            },
        );
    }
    Json(view)
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    id: String,
    url: String,
    #[serde(default)]
    transport: TransportKind,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

async fn register_backend(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Json(request): Json<RegisterRequest>,
) -> Response {
    if let Err(denied) = require_admin(&gateway, &headers) {
        return denied;
    }
    if request.id.is_empty() || url::Url::parse(&request.url).is_err() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "id and a valid url are required"})),
        )
            .into_response();
    }

    let descriptor = BackendDescriptor {
        id: request.id.clone(),
        url: request.url,
        transport: request.transport,
        display_name: request.display_name,
        tags: request.tags,
        registered_at: Utc::now(),
    };

    match gateway.registry.register(descriptor).await {
        Ok(()) => {
            gateway.registry.mark_dynamic(&request.id).await;
            info!(backend = %request.id, "backend registered via admin API");
            (
                StatusCode::CREATED,
                Json(serde_json::json!({"id": request.id})),
            )
                .into_response()
        }
        Err(RegistryError::Conflict(id)) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({"error": format!("backend '{id}' already registered")})),
        )
            .into_response(),
        Err(RegistryError::NotFound(_)) => {
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn deregister_backend(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(denied) = require_admin(&gateway, &headers) {
        return denied;
    }
    match gateway.registry.deregister(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(RegistryError::NotFound(_)) => StatusCode::NOT_FOUND.into_response(),
        Err(RegistryError::Conflict(_)) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn refresh_catalog(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = require_admin(&gateway, &headers) {
        return denied;
    }
    gateway.catalog.invalidate();
    info!("catalog refresh forced via admin API");
    Json(serde_json::json!({"status": "invalidated"})).into_response()
}

#[derive(Serialize)]
struct StatsResponse {
    total_backends: usize,
    catalog_built_at: Option<DateTime<Utc>>,
    usage_counts: HashMap<String, u64>,
    latency_by_backend: HashMap<String, crate::tracker::LatencyStats>,
    recent_calls: Vec<crate::tracker::CallEventSummary>,
}

async fn stats(State(gateway): State<Arc<Gateway>>, headers: HeaderMap) -> Response {
    if let Err(denied) = require_admin(&gateway, &headers) {
        return denied;
    }
    let latency_by_backend = gateway
        .tracker
        .backends_with_latency()
        .into_iter()
        .filter_map(|b| gateway.tracker.latency_stats(&b).map(|s| (b, s)))
        .collect();
    Json(StatsResponse {
        total_backends: gateway.registry.len(),
        catalog_built_at: gateway.catalog.built_at(),
        usage_counts: gateway.tracker.usage_snapshot(),
        latency_by_backend,
        recent_calls: gateway.tracker.recent_calls(50),
    })
    .into_response()
}
