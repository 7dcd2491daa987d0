//! Synchronous HTTP surface next to the control protocol.
//!
//! ## Endpoints
//!
//! - `GET /health` - Liveness
//! - `GET /exec` - Status of the current or last execution
//! - `POST /exec` - Run commands and wait for them
//! - `GET /file?file_path=` - Read a file (base64)
//! - `POST /file` - Write a file (base64)

use crate::config::AgentConfig;
use crate::dispatch::{self, ExecutionBoard};
use crate::exec;
use crate::fs::{self, FsError};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use testbed_proto::{ExecutionKind, ExecutionRecord};
use tower_http::trace::TraceLayer;

struct HttpState {
    testbed_id: String,
    workdir: PathBuf,
    exec_timeout: Duration,
    board: ExecutionBoard,
}

#[derive(Debug, Deserialize)]
pub struct ExecBody {
    pub commands: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecReply {
    pub exit_code: i32,
    pub output: String,
}

#[derive(Debug, Deserialize)]
pub struct FileQuery {
    pub file_path: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FileBody {
    pub file_path: String,
    /// Base64-encoded bytes.
    pub content: String,
}

/// Build the router for `config`. `board` is shared with the dispatch loop.
pub fn build_router(config: &AgentConfig, board: ExecutionBoard) -> Router {
    let state = Arc::new(HttpState {
        testbed_id: config.testbed_id.clone(),
        workdir: config.workdir.clone(),
        exec_timeout: config.exec_timeout,
        board,
    });

    Router::new()
        .route("/health", get(health_handler))
        .route("/exec", get(exec_status_handler).post(exec_handler))
        .route("/file", get(read_file_handler).post(write_file_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    config: &AgentConfig,
    board: ExecutionBoard,
    addr: std::net::SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let router = build_router(config, board);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Sidecar HTTP surface listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "OK",
        "testbed_id": state.testbed_id,
    }))
}

async fn exec_status_handler(State(state): State<Arc<HttpState>>) -> Response {
    match state.board.latest() {
        Some(record) => Json(record).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "no execution yet"),
    }
}

async fn exec_handler(
    State(state): State<Arc<HttpState>>,
    Json(body): Json<ExecBody>,
) -> Response {
    if body.commands.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "no commands given");
    }
    let timeout = body
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(state.exec_timeout);
    let script = body.commands.join("\n");
    let record = ExecutionRecord::running(uuid::Uuid::new_v4(), ExecutionKind::Command);
    state.board.post(&record);
    let outcome = exec::run_shell(&script, &state.workdir, timeout).await;
    let reply = ExecReply {
        exit_code: outcome.exit_code,
        output: outcome.combined_output(),
    };
    state.board.post(&dispatch::complete(record, outcome));
    Json(reply).into_response()
}

async fn read_file_handler(
    State(state): State<Arc<HttpState>>,
    Query(query): Query<FileQuery>,
) -> Response {
    let path = fs::resolve(&state.workdir, &query.file_path);
    match fs::read_file(&path).await {
        Ok(bytes) => Json(FileBody {
            file_path: query.file_path,
            content: STANDARD.encode(bytes),
        })
        .into_response(),
        Err(e) => fs_error_response(e),
    }
}

async fn write_file_handler(
    State(state): State<Arc<HttpState>>,
    Json(body): Json<FileBody>,
) -> Response {
    let bytes = match STANDARD.decode(body.content.as_bytes()) {
        Ok(bytes) => bytes,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &format!("invalid base64: {e}")),
    };
    let path = fs::resolve(&state.workdir, &body.file_path);
    match fs::write_file(&path, &bytes).await {
        Ok(()) => Json(serde_json::json!({ "status": "ok", "file_path": body.file_path }))
            .into_response(),
        Err(e) => fs_error_response(e),
    }
}

fn fs_error_response(error: FsError) -> Response {
    let status = match error {
        FsError::NotFound(_) => StatusCode::NOT_FOUND,
        FsError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        FsError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, &error.to_string())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}
