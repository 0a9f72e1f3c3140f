use std::any::Any;
use std::time::{Duration, Instant};

use axum::Router;
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{get, post};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::handlers;
use crate::response;
use crate::session::LifecycleManager;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub manager: LifecycleManager,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(manager: LifecycleManager) -> Self {
        Self {
            manager,
            started_at: Instant::now(),
        }
    }
}

pub fn build_app(state: AppState, request_timeout_secs: u64) -> Router {
    Router::new()
        .route("/livez", get(handlers::livez))
        .route("/readyz", get(handlers::readyz))
        .route("/connect", post(handlers::connect))
        .route("/send-message", post(handlers::send_message))
        .route("/status", get(handlers::status))
        .route("/instances", get(handlers::list_instances))
        .route("/instances/{instance_id}", get(handlers::get_instance))
        .with_state(state)
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(request_timeout_secs),
        ))
        .layer(TraceLayer::new_for_http())
}

/// Resolve once `signal` fires, after cancelling every session.
///
/// Passed to `with_graceful_shutdown` so that long-polling connects are
/// answered before the server waits for in-flight requests to drain.
pub async fn shutdown_on<F>(signal: F, manager: LifecycleManager)
where
    F: Future<Output = ()>,
{
    signal.await;
    info!("Shutting down sessions");
    manager.shutdown();
}

fn handle_panic(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    error!(panic = %detail, "Handler panicked");
    response::internal_error("Internal server error")
}
