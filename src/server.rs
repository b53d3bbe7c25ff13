//! HTTP agent invocation boundary.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/ask` | Run one conversational turn |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! ```json
//! POST /ask
//! { "session_id": "user-42", "text": "How do we rotate signing keys?" }
//!
//! 200 OK
//! { "answer": "<p>Quarterly.</p><div class=\"cited-document\">…</div>", "dropped_fragments": 0 }
//! ```
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "invalid_request", "message": "text is empty", "retryable": false } }
//! ```
//!
//! | Code | Status |
//! |------|--------|
//! | `invalid_request`, `bad_request` | 400 |
//! | `timeout` | 504 |
//! | `transient_io`, `rate_limited` | 503 |
//! | `auth` | 502 |
//! | anything else | 500 |
//!
//! A client that disconnects mid-turn drops the turn future, so nothing is
//! written to conversation memory.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::agent::{AgentError, RetrievalAgent};
use crate::app::AppContext;
use crate::config::Config;

#[derive(Clone)]
struct AppState {
    agent: Arc<RetrievalAgent>,
}

/// Build the router around a ready agent.
pub fn router(agent: Arc<RetrievalAgent>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ask", post(handle_ask))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { agent })
}

/// Serve on `[server].bind` until Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let ctx = AppContext::open(config).await?;
    let agent = Arc::new(ctx.agent().await?);
    let app = router(agent);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "agent server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    Ok(())
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
    retryable: bool,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
    retryable: bool,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
                retryable: self.retryable,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<AgentError> for AppError {
    fn from(err: AgentError) -> Self {
        let status = match err.kind.as_str() {
            "invalid_request" => StatusCode::BAD_REQUEST,
            "timeout" => StatusCode::GATEWAY_TIMEOUT,
            "transient_io" | "rate_limited" => StatusCode::SERVICE_UNAVAILABLE,
            "auth" => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError {
            status,
            code: err.kind,
            message: err.message,
            retryable: err.retryable,
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
        retryable: false,
    }
}

// ============ POST /ask ============

#[derive(Debug, Deserialize)]
struct AskRequest {
    session_id: String,
    text: String,
}

#[derive(Debug, Serialize)]
struct AskResponse {
    answer: String,
    dropped_fragments: usize,
}

async fn handle_ask(
    State(state): State<AppState>,
    body: Result<Json<AskRequest>, JsonRejection>,
) -> Result<Json<AskResponse>, AppError> {
    let Json(req) = body.map_err(|e| bad_request(e.body_text()))?;
    let rendered = state.agent.handle_turn(&req.session_id, &req.text).await?;
    Ok(Json(AskResponse {
        answer: rendered.markup,
        dropped_fragments: rendered.dropped_fragments,
    }))
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
