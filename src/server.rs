//! HTTP server for the chat front-end.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/chat` | Send a message; the answer streams back as `text/event-stream` |
//! | `GET`  | `/conversations/{id}` | Full turn history of a conversation |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Streaming
//!
//! `POST /chat` takes `{"message", "conversationId"?, "articleIds"?}`. Once
//! the request is accepted the response is `200` and the body is a sequence
//! of `data: {json}\n\n` frames (see [`crate::stream`]) ending in exactly
//! one `done` or `error` frame. Idle streams carry `:` keep-alive comments
//! every 15 seconds. Failures after that point are reported only
//! in-band. Closing the connection cancels the request.
//!
//! # Error Contract
//!
//! Requests rejected before streaming starts get a JSON error body:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "message must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so a browser front-end
//! served from another origin can stream from `/chat`.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::Serialize;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::db;
use crate::error::ChatError;
use crate::models::Turn;
use crate::orchestrator::{ChatRequest, Orchestrator};
use crate::stream::sse_event;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
struct AppState {
    orchestrator: Orchestrator,
}

/// Starts the HTTP server on `[server].bind` and runs until the process is
/// terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let orchestrator = Orchestrator::from_config(config, pool)?;

    let app = build_router(orchestrator);

    println!("chat server listening on http://{}", config.server.bind);
    tracing::info!(
        bind = %config.server.bind,
        provider = %config.generation.provider,
        "server started"
    );

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Router with every endpoint and the CORS layer, ready to serve.
pub fn build_router(orchestrator: Orchestrator) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/chat", post(handle_chat))
        .route("/conversations/{id}", get(handle_conversation))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { orchestrator })
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

impl From<ChatError> for AppError {
    fn from(err: ChatError) -> Self {
        let message = err.to_string();
        match err {
            ChatError::MalformedRequest(_) => bad_request(message),
            ChatError::ConversationNotFound(_) => not_found(message),
            other => {
                tracing::error!(error = %other, "request failed before streaming");
                AppError {
                    code: other.code().to_string(),
                    ..internal(message)
                }
            }
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /chat ============

/// Handler for `POST /chat`.
///
/// Validation and conversation lookup happen before the response starts, so
/// those failures still get a proper status code. Everything after is
/// streamed.
async fn handle_chat(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(request) = payload.map_err(|e| bad_request(e.body_text()))?;

    let events = state.orchestrator.handle(request).await?;

    let frames =
        ReceiverStream::new(events).map(|event| Ok::<Event, Infallible>(sse_event(&event)));

    Ok(Sse::new(frames)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response())
}

// ============ GET /conversations/{id} ============

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConversationResponse {
    id: String,
    created_at: chrono::DateTime<chrono::Utc>,
    turns: Vec<Turn>,
}

async fn handle_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ConversationResponse>, AppError> {
    let store = state.orchestrator.store();

    let conversation = store
        .get(&id)
        .await
        .map_err(|e| internal(e.to_string()))?
        .ok_or_else(|| not_found(format!("conversation not found: {}", id)))?;

    let turns = store
        .read_history(&id)
        .await
        .map_err(|e| internal(e.to_string()))?;

    Ok(Json(ConversationResponse {
        id: conversation.id,
        created_at: conversation.created_at,
        turns,
    }))
}
