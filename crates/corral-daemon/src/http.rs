//! HTTP control API.
//!
//! ## Endpoints
//!
//! - `GET /health` - Health check
//! - `GET /domains` - Snapshots of every domain
//! - `GET /domains/:name` - One snapshot
//! - `GET /domains/:name/job` - Job information
//! - `POST /domains/:name/{start,shutdown,destroy,suspend,resume,save,abort-job}`
//! - `POST /domains/:name/migrate` - Body `{"uri": "..."}`

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use corral_core::{ops, CoreError, Domain, DomainManager};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<DomainManager>,
}

/// A core error rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            CoreError::JobBusy { .. } | CoreError::Aborted(_) => StatusCode::CONFLICT,
            CoreError::DomainGone(_) | CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::ChannelClosed { .. } => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::InvalidState { .. } | CoreError::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        } else {
            tracing::debug!(error = %self.0, %status, "Request rejected");
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Build the HTTP router.
pub fn build_router(manager: Arc<DomainManager>) -> Router {
    tracing::debug!("Building HTTP router");

    Router::new()
        .route("/health", get(health_handler))
        .route("/domains", get(list_handler))
        .route("/domains/:name", get(get_handler))
        .route("/domains/:name/job", get(job_handler))
        .route("/domains/:name/start", post(start_handler))
        .route("/domains/:name/shutdown", post(shutdown_handler))
        .route("/domains/:name/destroy", post(destroy_handler))
        .route("/domains/:name/suspend", post(suspend_handler))
        .route("/domains/:name/resume", post(resume_handler))
        .route("/domains/:name/save", post(save_handler))
        .route("/domains/:name/abort-job", post(abort_handler))
        .route("/domains/:name/migrate", post(migrate_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { manager })
}

async fn lookup(state: &AppState, name: &str) -> ApiResult<Arc<Domain>> {
    Ok(state.manager.get_by_name(name).await?)
}

fn snapshot(domain: &Domain) -> Response {
    Json(domain.snapshot()).into_response()
}

/// Health check endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    tracing::trace!("Health check request");
    Json(serde_json::json!({
        "status": "healthy",
        "service": "corrald",
        "domains": state.manager.list().await.len(),
    }))
}

async fn list_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.manager.list().await)
}

async fn get_handler(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Response> {
    let domain = lookup(&state, &name).await?;
    Ok(snapshot(&domain))
}

async fn job_handler(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Response> {
    let domain = lookup(&state, &name).await?;
    Ok(Json(ops::job_info(&domain)).into_response())
}

async fn start_handler(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Response> {
    let domain = lookup(&state, &name).await?;
    ops::start(state.manager.services(), &domain).await?;
    Ok(snapshot(&domain))
}

async fn shutdown_handler(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Response> {
    let domain = lookup(&state, &name).await?;
    ops::shutdown(state.manager.services(), &domain).await?;
    Ok(StatusCode::ACCEPTED.into_response())
}

async fn destroy_handler(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Response> {
    let domain = lookup(&state, &name).await?;
    ops::destroy(state.manager.services(), &domain).await?;
    Ok(snapshot(&domain))
}

async fn suspend_handler(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Response> {
    let domain = lookup(&state, &name).await?;
    ops::suspend(state.manager.services(), &domain).await?;
    Ok(snapshot(&domain))
}

async fn resume_handler(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Response> {
    let domain = lookup(&state, &name).await?;
    ops::resume(state.manager.services(), &domain).await?;
    Ok(snapshot(&domain))
}

async fn save_handler(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Response> {
    let domain = lookup(&state, &name).await?;
    let path = ops::save(state.manager.services(), &domain).await?;
    Ok(Json(serde_json::json!({ "path": path })).into_response())
}

async fn abort_handler(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Response> {
    let domain = lookup(&state, &name).await?;
    let outcome = ops::abort_job(&domain).await?;
    Ok(Json(serde_json::json!({ "outcome": outcome })).into_response())
}

/// Body of `POST /domains/:name/migrate`.
#[derive(Debug, Deserialize)]
pub struct MigrateRequest {
    /// Destination URI handed to the emulator.
    pub uri: String,
}

async fn migrate_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<MigrateRequest>,
) -> ApiResult<Response> {
    let domain = lookup(&state, &name).await?;
    ops::migrate(state.manager.services(), &domain, &request.uri).await?;
    Ok(snapshot(&domain))
}

/// Start the HTTP server.
///
/// This function runs until the server is shut down via the provided
/// shutdown signal.
pub async fn serve(
    manager: Arc<DomainManager>,
    addr: std::net::SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let router = build_router(manager);

    tracing::info!(%addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::debug!(%addr, "TCP listener bound");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use corral_core::{
        Connection, DomainDef, JobKind, LaunchMode, LaunchedChannels, ManagerConfig, MemoryStore,
        ProcessManager,
    };
    use std::time::Duration;
    use tower::ServiceExt;

    /// Process manager whose emulator never comes up.
    struct Unreachable;

    #[async_trait]
    impl ProcessManager for Unreachable {
        async fn launch(&self, _def: &DomainDef, _mode: LaunchMode) -> corral_core::Result<LaunchedChannels> {
            Err(CoreError::monitor_closed("connection refused"))
        }

        async fn connect_agent(&self, _def: &DomainDef) -> corral_core::Result<Connection> {
            Err(CoreError::agent_closed("connection refused"))
        }

        async fn terminate(&self, _uuid: uuid::Uuid, _force: bool) -> corral_core::Result<()> {
            Ok(())
        }
    }

    fn manager(wait: Duration) -> Arc<DomainManager> {
        let config = ManagerConfig::default().job_wait_timeout(wait);
        Arc::new(DomainManager::new(config, Arc::new(MemoryStore::new()), Arc::new(Unreachable)).unwrap())
    }

    async fn send(router: Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = send(build_router(manager(Duration::from_secs(1))), "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["domains"], 0);
    }

    #[tokio::test]
    async fn test_unknown_domain_is_404() {
        let router = build_router(manager(Duration::from_secs(1)));
        let (status, body) = send(router, "GET", "/domains/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn test_get_and_list() {
        let manager = manager(Duration::from_secs(1));
        manager.define(DomainDef::new("web01")).await.unwrap();

        let (status, body) = send(build_router(Arc::clone(&manager)), "GET", "/domains/web01").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "web01");
        assert_eq!(body["status"], "shutoff");

        let (_, body) = send(build_router(Arc::clone(&manager)), "GET", "/domains").await;
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (status, body) = send(build_router(manager), "GET", "/domains/web01/job").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["async_job"].is_null());
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let manager = manager(Duration::from_millis(50));
        let domain = manager.define(DomainDef::new("web01")).await.unwrap();

        // Suspending a shut-off domain is a bad request.
        let (status, _) = send(build_router(Arc::clone(&manager)), "POST", "/domains/web01/suspend").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // The emulator never answers.
        let (status, _) = send(build_router(Arc::clone(&manager)), "POST", "/domains/web01/start").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        // Another job holds the domain past the bounded wait.
        let (guard, job) = domain.begin_job(JobKind::Modify).await.unwrap();
        drop(guard);
        let (status, _) = send(build_router(Arc::clone(&manager)), "POST", "/domains/web01/resume").await;
        assert_eq!(status, StatusCode::CONFLICT);
        domain.lock().await.end_job(job);

        let (status, _) = send(build_router(manager), "POST", "/domains/web01/abort-job").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
