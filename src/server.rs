//! HTTP invocation surface.
//!
//! Lets webhooks and schedulers trigger a reconciliation run over HTTP.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/sync` | Run a full or single-item sync |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # `POST /sync`
//!
//! ```json
//! { "mode": "single", "collection": "work", "itemId": "abc", "force": false, "stream": true }
//! ```
//!
//! All fields are optional; an empty body runs a full sync. Without
//! `stream` the response is the JSON run report. With `stream` the response
//! is NDJSON: one progress event per line, ending with a `result` or
//! `error` event.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "unknown collection 'x'" } }
//! ```
//!
//! Error codes: `bad_request` (400), `run_in_progress` (409), and the
//! engine error kind (`config`, `remote`, `transient`, ...) for 500.
//! Wrong methods get axum's 405.

use anyhow::Context;
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::SyncError;
use crate::models::CollectionKey;
use crate::pipeline::{Pipeline, RunOptions, RunReport};
use crate::progress::{ChannelProgress, NoProgress, SyncProgressEvent};
use crate::reconciler::CancelFlag;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
    /// Held for the duration of a run; runs never overlap.
    run_lock: Arc<Mutex<()>>,
    /// Set on shutdown so an active run stops between records.
    cancel: CancelFlag,
}

/// Starts the HTTP server on `[server].bind` and runs until Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pipeline = Pipeline::connect(config)
        .await
        .context("failed to connect content stores")?;
    let cancel: CancelFlag = Arc::new(AtomicBool::new(false));
    let app = router(Arc::new(pipeline), cancel.clone());

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;
    println!("mirror listening on http://{}", config.server.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested, cancelling active run");
            cancel.store(true, Ordering::Relaxed);
        })
        .await?;

    Ok(())
}

/// Routes for the sync surface, usable with any listener.
pub fn router(pipeline: Arc<Pipeline>, cancel: CancelFlag) -> Router {
    let state = AppState {
        pipeline,
        run_lock: Arc::new(Mutex::new(())),
        cancel,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/sync", post(handle_sync))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
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

fn conflict(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::CONFLICT,
        code: "run_in_progress".to_string(),
        message: message.into(),
    }
}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: err.kind().to_string(),
            message: err.to_string(),
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

// ============ POST /sync ============

#[derive(Debug, Default, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum SyncMode {
    #[default]
    Full,
    Single,
}

/// Request body for `POST /sync`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SyncRequest {
    #[serde(default)]
    mode: SyncMode,
    collection: Option<String>,
    item_id: Option<String>,
    limit: Option<usize>,
    #[serde(default)]
    force: bool,
    publish: Option<bool>,
    #[serde(default)]
    stream: bool,
}

impl SyncRequest {
    fn parse(body: &[u8]) -> Result<Self, AppError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(body).map_err(|e| bad_request(format!("invalid request body: {}", e)))
    }

    fn into_options(self, cancel: CancelFlag) -> Result<RunOptions, AppError> {
        let only = match self.collection {
            Some(ref name) => Some(name.parse::<CollectionKey>().map_err(bad_request)?),
            None => None,
        };

        match self.mode {
            SyncMode::Single => {
                if only.is_none() {
                    return Err(bad_request("single mode requires 'collection'"));
                }
                if self.item_id.as_deref().map_or(true, str::is_empty) {
                    return Err(bad_request("single mode requires 'itemId'"));
                }
            }
            SyncMode::Full => {
                if self.item_id.is_some() {
                    return Err(bad_request("'itemId' is only valid in single mode"));
                }
            }
        }
        if self.limit == Some(0) {
            return Err(bad_request("'limit' must be at least 1"));
        }

        Ok(RunOptions {
            only,
            item_id: self.item_id,
            limit: self.limit,
            force: self.force,
            publish: self.publish,
            cancel,
        })
    }
}

async fn handle_sync(State(state): State<AppState>, body: Bytes) -> Result<Response, AppError> {
    let request = SyncRequest::parse(&body)?;
    let stream = request.stream;
    let options = request.into_options(state.cancel.clone())?;

    let guard = state
        .run_lock
        .clone()
        .try_lock_owned()
        .map_err(|_| conflict("a sync run is already in progress"))?;

    if !stream {
        let report = state
            .pipeline
            .run_with_progress(options, Arc::new(NoProgress))
            .await;
        drop(guard);
        return match report {
            Ok(report) => Ok(Json(report).into_response()),
            Err(e) => {
                warn!(error = %e, "sync run failed");
                Err(AppError::from(e))
            }
        };
    }

    let (tx, rx) = mpsc::unbounded_channel::<SyncProgressEvent>();
    let (done_tx, done_rx) = oneshot::channel::<Result<RunReport, SyncError>>();
    let pipeline = state.pipeline.clone();
    tokio::spawn(async move {
        let _guard = guard;
        let outcome = pipeline
            .run_with_progress(options, Arc::new(ChannelProgress::new(tx)))
            .await;
        let _ = done_tx.send(outcome);
    });

    let events = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (ndjson(&event), rx))
    });
    let tail = futures::stream::once(async move {
        let last = match done_rx.await {
            Ok(Ok(report)) => json!({ "event": "result", "report": report }),
            Ok(Err(e)) => json!({
                "event": "error",
                "error": { "code": e.kind(), "message": e.to_string() }
            }),
            Err(_) => json!({
                "event": "error",
                "error": { "code": "internal", "message": "run ended unexpectedly" }
            }),
        };
        ndjson(&last)
    });
    let lines = events
        .chain(tail)
        .map(|line| Ok::<_, Infallible>(Bytes::from(line)));

    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response())
}

fn ndjson<T: Serialize>(value: &T) -> String {
    let mut line = serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string());
    line.push('\n');
    line
}
