//! REST surface over the sandbox manager.
//!
//! ## Endpoints
//!
//! - `GET /health` - Health check
//! - `GET /testbeds` - List the caller's testbeds
//! - `POST /testbeds` - Create a testbed for an instance
//! - `DELETE /testbeds` - Destroy all of the caller's testbeds
//! - `GET /testbeds/:id` - Testbed details
//! - `DELETE /testbeds/:id` - Destroy a testbed
//! - `POST /testbeds/:id/run-tests` - Apply a patch and run test files
//! - `POST /testbeds/:id/run-evaluation` - Apply a patch and grade the instance
//!
//! The caller is identified by the `X-User-Id` header. Testbeds of other
//! users are reported as not found.

use crate::error::ApiError;
use crate::types::{
    CreateTestbedRequest, DeleteResponse, ListTestbedsResponse, RunEvaluationRequest,
    RunTestsRequest, TestbedSummary,
};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use testbed_core::{
    CoreError, EvaluationResult, SandboxId, SandboxInfo, SandboxManager, TestResult,
    TestbedClient,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Header carrying the caller's user id.
pub const USER_HEADER: &str = "x-user-id";

/// User id of requests without [`USER_HEADER`].
pub const DEFAULT_USER: &str = "default";

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    manager: Arc<SandboxManager>,
    client_timeout: Duration,
    run_timeout: Duration,
}

impl AppState {
    pub fn new(manager: Arc<SandboxManager>) -> Self {
        Self {
            manager,
            client_timeout: Duration::from_secs(300),
            run_timeout: Duration::from_secs(1800),
        }
    }

    /// Set how long to wait for a testbed's agent, and the default run timeout.
    pub fn with_timeouts(mut self, client_timeout: Duration, run_timeout: Duration) -> Self {
        self.client_timeout = client_timeout;
        self.run_timeout = run_timeout;
        self
    }
}

/// Build the HTTP router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/testbeds",
            get(list_handler).post(create_handler).delete(delete_all_handler),
        )
        .route("/testbeds/:id", get(get_handler).delete(delete_handler))
        .route("/testbeds/:id/run-tests", post(run_tests_handler))
        .route("/testbeds/:id/run-evaluation", post(run_evaluation_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server. Runs until `shutdown` resolves.
pub async fn serve(
    state: AppState,
    addr: std::net::SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let router = build_router(state);

    tracing::info!(%addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

fn user_id(headers: &HeaderMap) -> String {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_USER)
        .to_string()
}

/// Look up a testbed, hiding those of other users.
async fn owned(state: &AppState, id: &SandboxId, user: &str) -> Result<SandboxInfo, ApiError> {
    let info = state.manager.get(id).await?;
    if !info.belongs_to(Some(user)) {
        return Err(CoreError::NotFound(id.clone()).into());
    }
    Ok(info)
}

/// Attach a client and wait for its agent to answer.
async fn acquire(state: &AppState, id: &SandboxId) -> Result<TestbedClient, ApiError> {
    let mut client = state.manager.create_client(id, state.client_timeout).await?;
    if let Err(e) = client.wait_until_ready(state.client_timeout).await {
        release(state, client).await;
        return Err(e.into());
    }
    Ok(client)
}

/// Drop the client and hand the testbed back for the next request.
async fn release(state: &AppState, client: TestbedClient) {
    let id = client.id().clone();
    drop(client);
    if let Err(e) = state.manager.reset(&id).await {
        tracing::warn!(sandbox_id = %id, error = %e, "Failed to release testbed");
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "testbed-api"
    }))
}

async fn list_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Json<ListTestbedsResponse> {
    let user = user_id(&headers);
    let testbeds = state
        .manager
        .list(Some(&user))
        .await
        .into_iter()
        .map(TestbedSummary::from)
        .collect();
    Json(ListTestbedsResponse { testbeds })
}

async fn create_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateTestbedRequest>,
) -> Result<(StatusCode, Json<TestbedSummary>), ApiError> {
    let user = user_id(&headers);
    tracing::info!(instance_id = %request.instance_id, %user, "Creating testbed");

    let id = state.manager.create(&request.instance_id, Some(&user)).await?;
    let info = state.manager.get(&id).await?;
    Ok((StatusCode::CREATED, Json(info.into())))
}

async fn get_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<TestbedSummary>, ApiError> {
    let info = owned(&state, &SandboxId::from(id), &user_id(&headers)).await?;
    Ok(Json(info.into()))
}

async fn delete_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let id = SandboxId::from(id);
    let user = user_id(&headers);

    // Unknown ids still reach the cluster so orphaned workloads are removed.
    if let Ok(info) = state.manager.get(&id).await {
        if !info.belongs_to(Some(&user)) {
            return Err(CoreError::NotFound(id).into());
        }
    }

    state.manager.destroy(&id).await?;
    tracing::info!(sandbox_id = %id, %user, "Testbed destroyed");
    Ok(Json(DeleteResponse { deleted: 1 }))
}

async fn delete_all_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Json<DeleteResponse> {
    let user = user_id(&headers);
    let deleted = state.manager.destroy_all(Some(&user)).await;
    Json(DeleteResponse { deleted })
}

async fn run_tests_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<RunTestsRequest>,
) -> Result<Json<TestResult>, ApiError> {
    let id = SandboxId::from(id);
    owned(&state, &id, &user_id(&headers)).await?;
    if request.test_files.is_empty() {
        return Err(CoreError::InvalidArgument("no test files given".into()).into());
    }

    let timeout = request
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(state.run_timeout);
    let mut client = acquire(&state, &id).await?;
    let result = client
        .run_tests(&request.test_files, request.patch.as_deref(), timeout)
        .await;
    release(&state, client).await;
    Ok(Json(result?))
}

async fn run_evaluation_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Option<Json<RunEvaluationRequest>>,
) -> Result<Json<EvaluationResult>, ApiError> {
    let id = SandboxId::from(id);
    owned(&state, &id, &user_id(&headers)).await?;

    let request = body.map(|Json(r)| r).unwrap_or_default();
    let timeout = request
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(state.run_timeout);
    let mut client = acquire(&state, &id).await?;
    let result = client
        .run_evaluation(request.patch.as_deref(), timeout)
        .await;
    release(&state, client).await;
    Ok(Json(result?))
}
