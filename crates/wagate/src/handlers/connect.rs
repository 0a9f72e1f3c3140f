//! Connect handler.

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::server::AppState;
use crate::session::{ConnectOutcome, SessionError};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    instance_id: String,
    #[serde(default)]
    phone_number: Option<String>,
}

#[derive(Serialize)]
pub struct ConnectResponse {
    success: bool,
    status: &'static str,
    instance_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    qr_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    qr_raw: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fallback: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    /// Close status code, or `"unknown"` when the close carried none.
    #[serde(skip_serializing_if = "Option::is_none")]
    disconnect_code: Option<Value>,
}

impl ConnectResponse {
    fn new(status: &'static str, instance_id: String, phone: Option<String>) -> Self {
        Self {
            success: false,
            status,
            instance_id,
            phone,
            message: None,
            qr_code: None,
            qr_raw: None,
            fallback: None,
            reason: None,
            disconnect_code: None,
        }
    }

    fn rejected(instance_id: String, reason: String) -> Response {
        let mut body = Self::new("error", instance_id, None);
        body.reason = Some(reason);
        (StatusCode::BAD_REQUEST, Json(body)).into_response()
    }

    fn from_outcome(instance_id: String, phone: Option<String>, outcome: ConnectOutcome) -> Response {
        let mut body = Self::new(outcome.status(), instance_id, None);
        let mut code = StatusCode::OK;

        match outcome {
            ConnectOutcome::QrCode { qr_code, qr_raw } => {
                body.success = true;
                body.phone = phone;
                body.message = Some("Scan this QR with WhatsApp");
                body.qr_code = Some(qr_code);
                body.qr_raw = Some(qr_raw);
            }
            ConnectOutcome::Connected => {
                body.success = true;
                body.phone = phone;
                body.message = Some("WhatsApp connected successfully");
            }
            ConnectOutcome::Fallback { qr_code } => {
                body.success = true;
                body.phone = phone;
                body.message = Some("Fallback QR - Scan with WhatsApp");
                body.qr_code = Some(qr_code);
                body.fallback = Some(true);
            }
            ConnectOutcome::Disconnected { reason, code: status } => {
                body.reason = Some(reason);
                body.disconnect_code = Some(match status {
                    Some(status) => Value::from(status),
                    None => Value::from("unknown"),
                });
            }
            ConnectOutcome::Timeout => {
                body.message = Some("Connection timeout. Please try again.");
            }
            ConnectOutcome::Error { reason } => {
                body.reason = Some(reason);
                code = StatusCode::INTERNAL_SERVER_ERROR;
            }
        }

        (code, Json(body)).into_response()
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /connect
pub async fn connect(
    State(state): State<AppState>,
    payload: Result<Json<ConnectRequest>, JsonRejection>,
) -> Response {
    let req = match payload {
        Ok(Json(req)) => req,
        Err(rejection) => {
            return ConnectResponse::rejected(String::new(), rejection.body_text());
        }
    };

    info!(instance_id = %req.instance_id, "Connect requested");

    match state
        .manager
        .connect(&req.instance_id, req.phone_number.clone())
        .await
    {
        Ok(outcome) => ConnectResponse::from_outcome(req.instance_id, req.phone_number, outcome),
        Err(e @ SessionError::InvalidInstanceId(_)) => {
            ConnectResponse::rejected(req.instance_id, e.to_string())
        }
    }
}
