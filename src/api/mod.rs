//! HTTP adapter.
//!
//! Admin routes submit and inspect jobs; probe routes read and transition
//! the caller's own tasks. The caller's probe id is taken from the
//! `X-Probe-Id` header, which the identity layer in front of this service
//! is trusted to set. Admin routes are expected to be mounted behind the
//! deployment's admin authorizer.

mod errors;
mod handlers;
mod responses;

pub use errors::{ApiError, ErrorResponse};
pub use handlers::{ApiState, CallerProbe, DEFAULT_SINCE, PROBE_ID_HEADER};
pub use responses::*;

use axum::{
    Router,
    routing::{get, post},
};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::config::ApiSettings;
use crate::lifecycle::TaskLifecycle;
use crate::scheduler::SchedulerHandle;
use crate::storage::Storage;

/// Configuration for the API server.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to bind to.
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self::from(&ApiSettings::default())
    }
}

impl ApiConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl From<&ApiSettings> for ApiConfig {
    fn from(settings: &ApiSettings) -> Self {
        Self::new(settings.host.clone(), settings.port)
    }
}

/// Build the API router with all endpoints.
pub fn build_router<S: Storage + 'static>(state: ApiState<S>) -> Router {
    Router::new()
        .route("/api/health", get(handlers::health::<S>))
        // Admin
        .route("/api/v1/admin/jobs", get(handlers::list_jobs::<S>))
        .route("/api/v1/admin/job", post(handlers::add_job::<S>))
        .route("/api/v1/admin/job/{job_id}", get(handlers::get_job::<S>))
        // Probes
        .route("/api/v1/tasks", get(handlers::list_tasks::<S>))
        .route("/api/v1/task/{task_id}", get(handlers::get_task::<S>))
        .route(
            "/api/v1/task/{task_id}/accept",
            post(handlers::accept_task::<S>),
        )
        .route(
            "/api/v1/task/{task_id}/reject",
            post(handlers::reject_task::<S>),
        )
        .route("/api/v1/task/{task_id}/done", post(handlers::done_task::<S>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Create the API state from the scheduler handle and task lifecycle.
pub fn create_api_state<S: Storage>(
    handle: SchedulerHandle,
    lifecycle: TaskLifecycle<S>,
) -> ApiState<S> {
    ApiState { handle, lifecycle }
}

/// Start the API server.
///
/// Binds the listener before returning, so a bad address is reported to
/// the caller. The server runs until the returned task is aborted.
pub async fn start_server<S: Storage + 'static>(
    config: ApiConfig,
    state: ApiState<S>,
) -> std::io::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let router = build_router(state);

    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    let addr = listener.local_addr()?;
    tracing::info!("API server listening on http://{}", addr);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!("API server error: {}", e);
        }
    });

    Ok((addr, handle))
}
