//! HTTP gateway: the OpenAI-compatible surface plus the worker endpoint.
//!
//! ```text
//! POST /v1/chat/completions   dispatch to a worker, blocking
//! GET  /v1/models             static model list
//! GET  /health                liveness probe
//! GET  /stats                 worker and rendezvous counts
//! GET  /                      service banner
//! GET  /ws                    worker WebSocket endpoint
//! ```

pub mod openai;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};

use crate::broker::Broker;
use crate::error::DispatchError;
use crate::gateway::openai::{completion_envelope, model_list, ChatCompletionRequest};

/// Shared state for the gateway.
#[derive(Clone)]
pub struct GatewayState {
    pub broker: Arc<Broker>,
}

/// Build the axum router.
pub fn router(state: GatewayState) -> Router {
    // Browsers host the worker userscripts, so CORS stays wide open.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/v1/models", get(models))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/ws", get(ws::worker_socket))
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(cors)
        .with_state(state)
}

/// Bind and serve in a background task.
///
/// Returns the bound address together with the serve task's handle so the
/// caller can notice the server dying instead of running on without it.
pub async fn start_server(
    addr: SocketAddr,
    state: GatewayState,
) -> Result<(SocketAddr, JoinHandle<Result<(), std::io::Error>>), std::io::Error> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?;

    let handle = tokio::spawn(async move { axum::serve(listener, app).await });

    Ok((bound, handle))
}

/// An error rendered as the OpenAI-style envelope
/// `{"error": {"message", "type", "code"}}`.
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        let status = match &err {
            DispatchError::MissingUser => StatusCode::BAD_REQUEST,
            DispatchError::NoWorker { .. } => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::Transport { .. }
            | DispatchError::WorkerGone
            | DispatchError::WorkerReported { .. } => StatusCode::BAD_GATEWAY,
            DispatchError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            DispatchError::DuplicateRequestId(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.kind(), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "message": self.message,
                "type": self.kind,
                "code": self.status.as_u16(),
            }
        });
        (self.status, Json(body)).into_response()
    }
}

// -- Handlers --

async fn root(State(state): State<GatewayState>) -> Json<Value> {
    let snapshot = state.broker.registry().snapshot().await;
    let pending = state.broker.rendezvous().pending().await;
    Json(json!({
        "status": "online",
        "service": "chatrelay",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "connections": {
            "total_workers": snapshot.total,
            "idle_workers": snapshot.idle,
            "busy_workers": snapshot.busy,
            "pending_requests": pending,
        },
    }))
}

async fn health(State(state): State<GatewayState>) -> Json<Value> {
    let snapshot = state.broker.registry().snapshot().await;
    let status = if snapshot.total > 0 { "healthy" } else { "degraded" };
    Json(json!({
        "status": status,
        "active_workers": snapshot.total,
        "idle_workers": snapshot.idle,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn stats(State(state): State<GatewayState>) -> Json<Value> {
    let snapshot = state.broker.registry().snapshot().await;
    let workers = state.broker.registry().list().await;
    let pending = state.broker.rendezvous().pending().await;
    Json(json!({
        "total_workers": snapshot.total,
        "idle_workers": snapshot.idle,
        "busy_workers": snapshot.busy,
        "pending_requests": pending,
        "workers": workers,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn models() -> Json<Value> {
    Json(model_list())
}

async fn chat_completions(
    State(state): State<GatewayState>,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Json<Value>, ApiError> {
    if request.messages.is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "message list must not be empty",
        ));
    }

    // Run the dispatch on its own task so a caller that hangs up cannot
    // abort it mid-flight: the slot is always closed and the worker always
    // released by the dispatch itself, never left dangling.
    let broker = Arc::clone(&state.broker);
    let outcome = tokio::spawn(async move {
        let outcome = broker.dispatch(&request).await;
        (request, outcome)
    })
    .await;

    let (request, dispatched) = match outcome {
        Ok((request, dispatched)) => (request, dispatched?),
        Err(e) => {
            tracing::error!("dispatch task failed: {}", e);
            return Err(ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "dispatch task failed",
            ));
        }
    };

    Ok(Json(completion_envelope(
        &dispatched.request_id,
        &request.model,
        &request,
        &dispatched.result,
    )))
}
