//! Axum JSON surface over the refresh trigger and the job read path.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use jobfeed_core::JobListing;
use jobfeed_sync::{maybe_build_scheduler, Orchestrator, RefreshSummary, DEFAULT_LIST_LIMIT};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "jobfeed-web";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[derive(Debug, Deserialize, Default)]
struct JobsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub message: String,
    pub summary: RefreshSummary,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/jobs", get(jobs_handler))
        .route("/jobs/refresh", post(refresh_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(port: u16, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "serving jobfeed api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Serves the API, running the refresh cron alongside when it is enabled.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let (config, orchestrator) = jobfeed_sync::orchestrator_from_env().await?;
    let scheduler = maybe_build_scheduler(&config, Arc::clone(&orchestrator)).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.refresh_cron, "refresh scheduler started");
    }
    serve(config.web_port, AppState::new(orchestrator)).await
}

async fn health_handler() -> Json<JsonValue> {
    Json(json!({ "status": "ok" }))
}

async fn jobs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<JobsQuery>,
) -> Json<Vec<JobListing>> {
    let read = state
        .orchestrator
        .list_jobs(query.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        .await;
    Json(read.jobs)
}

async fn refresh_handler(State(state): State<Arc<AppState>>) -> Json<RefreshResponse> {
    let summary = state.orchestrator.refresh().await;
    Json(RefreshResponse {
        message: format!("{} jobs upserted", summary.written),
        summary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use jobfeed_storage::{HttpClientConfig, JobStore, MemoryJobStore};
    use tower::ServiceExt;

    fn state_with(store: Arc<MemoryJobStore>) -> AppState {
        let orchestrator = Orchestrator::new(vec![], HttpClientConfig::default(), store).unwrap();
        AppState::new(Arc::new(orchestrator))
    }

    async fn body_json(resp: axum::response::Response) -> JsonValue {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn handler_smoke_health() {
        let app = app(state_with(Arc::new(MemoryJobStore::new())));
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, json!({ "status": "ok" }));
    }

    #[tokio::test]
    async fn handler_smoke_jobs_backfills_empty_store() {
        let store = Arc::new(MemoryJobStore::new());
        let app = app(state_with(store.clone()));
        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/jobs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let jobs = body_json(resp).await;
        let jobs = jobs.as_array().unwrap();
        assert_eq!(jobs.len(), 5);
        assert_eq!(jobs[0]["source"], "test_data");
        assert_eq!(store.len().await, 5);

        let resp = app
            .oneshot(Request::builder().uri("/jobs?limit=2").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(resp).await.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn handler_smoke_jobs_rejects_bad_limit() {
        let app = app(state_with(Arc::new(MemoryJobStore::new())));
        let resp = app
            .oneshot(Request::builder().uri("/jobs?limit=lots").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn handler_smoke_refresh_post() {
        let store = Arc::new(MemoryJobStore::new());
        let app = app(state_with(store.clone()));
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/jobs/refresh")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["message"], "5 jobs upserted");
        assert_eq!(body["summary"]["used_fallback"], true);
        assert_eq!(store.select_all(10).await.unwrap().len(), 5);
    }
}
