//! Status and instance listing handlers.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::response;
use crate::server::AppState;
use crate::session::SessionStatus;

// ============================================================================
// Response Types
// ============================================================================

#[derive(Serialize)]
pub struct StatusResponse {
    success: bool,
    active_sessions: usize,
    status: &'static str,
    /// Seconds since startup.
    uptime: f64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSummary {
    instance_id: String,
    status: SessionStatus,
    active: bool,
}

#[derive(Serialize)]
pub struct ListInstancesResponse {
    success: bool,
    instances: Vec<InstanceSummary>,
    total: usize,
}

#[derive(Serialize)]
pub struct GetInstanceResponse {
    success: bool,
    instance_id: String,
    status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    phone: Option<String>,
    last_seen_at: String,
    active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    connected_at: Option<String>,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /status
pub async fn status(State(state): State<AppState>) -> Response {
    let body = StatusResponse {
        success: true,
        active_sessions: state.manager.registry().len(),
        status: "running",
        uptime: state.started_at.elapsed().as_secs_f64(),
    };
    (StatusCode::OK, Json(body)).into_response()
}

/// GET /instances
pub async fn list_instances(State(state): State<AppState>) -> Response {
    let instances: Vec<InstanceSummary> = state
        .manager
        .registry()
        .instance_ids()
        .into_iter()
        .map(|instance_id| InstanceSummary {
            instance_id,
            status: SessionStatus::Connected,
            active: true,
        })
        .collect();

    let body = ListInstancesResponse {
        success: true,
        total: instances.len(),
        instances,
    };
    (StatusCode::OK, Json(body)).into_response()
}

/// GET /instances/{instance_id}
pub async fn get_instance(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> Response {
    let Some(session) = state.manager.session(&instance_id) else {
        return response::not_found(format!("Instance '{}' not found", instance_id));
    };
    let active = state.manager.registry().get(&instance_id);

    let body = GetInstanceResponse {
        success: true,
        instance_id: session.instance_id,
        status: session.status,
        phone: session.phone_number,
        last_seen_at: session.last_seen_at.to_rfc3339(),
        active: active.is_some(),
        connected_at: active.map(|a| a.connected_at.to_rfc3339()),
    };
    (StatusCode::OK, Json(body)).into_response()
}
