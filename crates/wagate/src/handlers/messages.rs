//! Outbound message handler.

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::protocol::OutboundContent;
use crate::response;
use crate::server::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    instance_id: String,
    to: String,
    message: String,
    #[serde(default = "default_message_type")]
    message_type: String,
}

fn default_message_type() -> String {
    "text".to_string()
}

#[derive(Serialize)]
pub struct SendMessageResponse {
    success: bool,
    message_id: String,
    status: &'static str,
    instance_id: String,
}

/// POST /send-message
pub async fn send_message(
    State(state): State<AppState>,
    payload: Result<Json<SendMessageRequest>, JsonRejection>,
) -> Response {
    let req = match payload {
        Ok(Json(req)) => req,
        Err(rejection) => return response::bad_request(rejection.body_text()),
    };

    let Some(client) = state.manager.registry().client(&req.instance_id) else {
        return response::bad_request("Instance not connected");
    };

    info!(instance_id = %req.instance_id, to = %req.to, message_type = %req.message_type, "Sending message");

    let content = OutboundContent::from_type(&req.message_type, req.message);
    match client.send(&req.to, content).await {
        Ok(message_id) => {
            let body = SendMessageResponse {
                success: true,
                message_id,
                status: "sent",
                instance_id: req.instance_id,
            };
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => {
            warn!(instance_id = %req.instance_id, error = %e, "Send failed");
            response::internal_error(e.to_string())
        }
    }
}
