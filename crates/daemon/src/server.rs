//! HTTP API for the VTS batch daemon
//!
//! JSON endpoints under `/api` for driving the orchestrator, plus a
//! Server-Sent Events stream of job events at `/api/events`. Clients that
//! cannot hold the stream open poll `/api/status`.

use crate::config::Config;
use crate::events::JobEvent;
use crate::job::JobRequest;
use crate::orchestrator::{Orchestrator, OrchestratorError};
use crate::startup::check_dependencies;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{self, Stream};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Errors that can occur when running the HTTP server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Server failed: {0}")]
    Serve(std::io::Error),
}

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub config: Arc<Config>,
    /// Cancelled when the server starts draining; ends open event streams.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator, config: Arc<Config>) -> Self {
        Self {
            orchestrator,
            config,
            shutdown: CancellationToken::new(),
        }
    }
}

/// Orchestrator error rendered as `{"error": "..."}` with a matching status.
#[derive(Debug)]
pub struct ApiError(OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.0 {
            OrchestratorError::InvalidInput(_) | OrchestratorError::InvalidPath(_) => {
                StatusCode::BAD_REQUEST
            }
            OrchestratorError::AlreadyRunning => StatusCode::CONFLICT,
            OrchestratorError::NoResumableState => StatusCode::NOT_FOUND,
            OrchestratorError::State(_)
            | OrchestratorError::History(_)
            | OrchestratorError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self.0, "request failed");
        }
        let body = ErrorBody {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    pub source_path: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeQuery {
    pub output_dir: PathBuf,
}

async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.status())
}

async fn post_scan(
    State(state): State<AppState>,
    Json(request): Json<ScanRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let groups = state.orchestrator.scan(&request.source_path).await?;
    Ok(Json(serde_json::json!({ "groups": groups })))
}

async fn post_convert(
    State(state): State<AppState>,
    Json(request): Json<JobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.orchestrator.start(request)?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn post_stop(State(state): State<AppState>) -> impl IntoResponse {
    state.orchestrator.stop();
    Json(state.orchestrator.status())
}

async fn get_resume_state(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.resume_state())
}

async fn post_resume(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let job = state.orchestrator.resume()?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn post_clear_resume_state(
    State(state): State<AppState>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.clear_resume_state()?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_history(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.history())
}

async fn get_history_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.history_stats())
}

async fn delete_history(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.orchestrator.clear_history()?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_analyze(
    State(state): State<AppState>,
    Query(query): Query<AnalyzeQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let analysis = state.orchestrator.analyze(&query.output_dir).await?;
    Ok(Json(analysis))
}

async fn get_check_dependencies(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let config = state.config.clone();
    let report = tokio::task::spawn_blocking(move || check_dependencies(&config))
        .await
        .map_err(|e| OrchestratorError::Io(std::io::Error::other(e)))?;
    Ok(Json(report))
}

fn sse_event(event: &JobEvent) -> Option<Event> {
    match Event::default().event(event.kind()).json_data(event) {
        Ok(sse) => Some(sse),
        Err(e) => {
            warn!(kind = event.kind(), error = %e, "failed to encode event");
            None
        }
    }
}

async fn get_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.orchestrator.events().subscribe();

    let stream = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(sse) = sse_event(&event) {
                        return Some((Ok(sse), rx));
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagging, events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    let stream = stream.take_until(state.shutdown.clone().cancelled_owned());
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Creates the axum Router with all API endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/scan", post(post_scan))
        .route("/api/convert", post(post_convert))
        .route("/api/stop", post(post_stop))
        .route("/api/resume-state", get(get_resume_state))
        .route("/api/resume", post(post_resume))
        .route("/api/clear-resume-state", post(post_clear_resume_state))
        .route("/api/history", get(get_history).delete(delete_history))
        .route("/api/history/stats", get(get_history_stats))
        .route("/api/analyze", get(get_analyze))
        .route("/api/check-dependencies", get(get_check_dependencies))
        .route("/api/events", get(get_events))
        .with_state(state)
}

/// Serves the API on `addr` until `shutdown` resolves.
pub async fn run_server<F>(state: AppState, addr: &str, shutdown: F) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;

    info!(addr, "HTTP API listening");
    serve(listener, state, shutdown).await
}

/// Serves the API on an already bound listener until `shutdown` resolves.
///
/// When the signal fires the running job is stopped and event streams are
/// closed before the server waits for open connections to drain.
pub async fn serve<F>(
    listener: TcpListener,
    state: AppState,
    shutdown: F,
) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let orchestrator = state.orchestrator.clone();
    let streams = state.shutdown.clone();
    let signal = async move {
        shutdown.await;
        orchestrator.stop();
        streams.cancel();
        info!("draining HTTP connections");
    };

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(signal)
        .await
        .map_err(ServerError::Serve)
}
