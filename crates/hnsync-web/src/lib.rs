//! Axum JSON API: post listing for readers, run status and manual triggers per source.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use hnsync_core::{Post, SourceKind};
use hnsync_storage::{PostQuery, PostStore};
use hnsync_sync::{IngestionOrchestrator, SyncConfig, SyncError, SyncPipeline};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "hnsync-web";

/// Body of the 409 returned by the listing while any source is ingesting.
pub const BUSY_MESSAGE: &str = "Update with Hackernews In Progress";

const DEFAULT_PER_PAGE: usize = 30;
const MAX_PER_PAGE: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: IngestionOrchestrator,
    pub store: Arc<dyn PostStore>,
}

impl AppState {
    pub fn new(orchestrator: IngestionOrchestrator, store: Arc<dyn PostStore>) -> Self {
        Self { orchestrator, store }
    }

    pub fn from_pipeline(pipeline: &SyncPipeline) -> Self {
        Self::new(pipeline.orchestrator().clone(), Arc::clone(pipeline.store()))
    }
}

#[derive(Debug, Deserialize)]
struct PostsQuery {
    search: Option<String>,
    page: Option<usize>,
    per_page: Option<usize>,
}

#[derive(Debug, Serialize)]
struct PostsPage {
    page: usize,
    per_page: usize,
    results: Vec<Post>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/posts", get(posts_handler))
        .route("/api/sources/{source}/status", get(status_handler))
        .route("/api/sources/{source}/sync", post(trigger_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let pipeline = SyncPipeline::new(SyncConfig::from_env()).await?;
    let _scheduler = match pipeline.maybe_build_scheduler().await? {
        Some(sched) => {
            sched.start().await.context("starting scheduler")?;
            info!("scheduler started");
            Some(sched)
        }
        None => None,
    };

    let port = pipeline.config().web_port;
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "serving api");
    axum::serve(listener, app(AppState::from_pipeline(&pipeline))).await?;
    Ok(())
}

async fn posts_handler(State(state): State<Arc<AppState>>, Query(query): Query<PostsQuery>) -> Response {
    if state.orchestrator.any_active() {
        return message(StatusCode::CONFLICT, BUSY_MESSAGE);
    }

    let per_page = query.per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE);
    let page = query.page.unwrap_or(1).max(1);
    let store_query = PostQuery {
        search: query.search,
        offset: (page - 1).saturating_mul(per_page),
        limit: per_page,
    };
    match state.store.list(&store_query).await {
        Ok(results) => Json(PostsPage {
            page,
            per_page,
            results,
        })
        .into_response(),
        Err(err) => {
            warn!(error = %err, "listing posts failed");
            message(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
        }
    }
}

async fn status_handler(State(state): State<Arc<AppState>>, Path(source): Path<String>) -> Response {
    match source.parse::<SourceKind>() {
        Ok(source) => Json(state.orchestrator.status(source)).into_response(),
        Err(err) => message(StatusCode::NOT_FOUND, &err.to_string()),
    }
}

async fn trigger_handler(State(state): State<Arc<AppState>>, Path(source): Path<String>) -> Response {
    let source = match source.parse::<SourceKind>() {
        Ok(source) => source,
        Err(err) => return message(StatusCode::NOT_FOUND, &err.to_string()),
    };
    match state.orchestrator.trigger(source) {
        Ok(run_state) => {
            info!(%source, "run triggered");
            (StatusCode::ACCEPTED, Json(run_state)).into_response()
        }
        Err(err @ SyncError::AlreadyActive(_)) => message(StatusCode::CONFLICT, &err.to_string()),
        Err(err) => message(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

fn message(status: StatusCode, text: &str) -> Response {
    (status, Json(json!({ "message": text }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use hnsync_adapters::{
        ItemApi, PageSource, ProviderError, RawItem, SentimentProvider, SentimentReading, SourceError,
    };
    use hnsync_core::{Observation, PostId, RunStatus, Sentiment};
    use hnsync_storage::MemoryPostStore;
    use hnsync_sync::{EnrichmentPool, JitterBackoff, RetryingEnricher, UpsertPolicy};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct NoPages;

    #[async_trait]
    impl PageSource for NoPages {
        async fn fetch_page(&self, _page: u32) -> Result<Vec<RawItem>, SourceError> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl ItemApi for NoPages {
        async fn fetch_top_ids(&self) -> Result<Vec<PostId>, SourceError> {
            Ok(Vec::new())
        }

        async fn fetch_item(&self, _id: PostId, _rank: u32) -> Result<Option<RawItem>, SourceError> {
            Ok(None)
        }
    }

    #[async_trait]
    impl SentimentProvider for NoPages {
        async fn classify(&self, _url: &str) -> Result<SentimentReading, ProviderError> {
            Err(ProviderError::NotConfigured)
        }
    }

    async fn state() -> AppState {
        let store = Arc::new(MemoryPostStore::new());
        for (id, rank, subject) in [(1, 2, "Show HN: a tiny database"), (2, 1, "Rust 2.0 released")] {
            let observation = Observation {
                id,
                rank,
                subject: subject.into(),
                url: format!("https://example.com/{id}"),
                age: "1 hour ago".into(),
                score: Some(5),
                submitted_by: Some("pg".into()),
                num_comments: Some(1),
            };
            store.insert(Post::new(observation, Sentiment::pending())).await.unwrap();
        }
        let upserts = UpsertPolicy::new(store.clone());
        let enrichment = Arc::new(EnrichmentPool::new(
            RetryingEnricher::new(Arc::new(NoPages), JitterBackoff::default()),
            upserts.clone(),
            1,
        ));
        let sources = Arc::new(NoPages);
        let orchestrator = IngestionOrchestrator::new(sources.clone(), sources, upserts, enrichment);
        AppState::new(orchestrator, store)
    }

    async fn call(app: Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn posts_are_listed_by_rank_and_searchable() {
        let app = app(state().await);
        let (status, body) = call(app.clone(), "GET", "/api/posts").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["per_page"], 30);
        assert_eq!(body["results"][0]["id"], 2);
        assert_eq!(body["results"][1]["id"], 1);

        let (_, body) = call(app, "GET", "/api/posts?search=show%20hn").await;
        assert_eq!(body["results"].as_array().unwrap().len(), 1);
        assert_eq!(body["results"][0]["sentiment_label"], "Not Ready");
    }

    #[tokio::test]
    async fn huge_page_number_returns_empty_results() {
        let (status, body) = call(app(state().await), "GET", "/api/posts?page=18446744073709551615").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["results"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn listing_is_refused_while_a_run_is_active() {
        let state = state().await;
        state.orchestrator.tracker().activate(SourceKind::Api).unwrap();
        let (status, body) = call(app(state), "GET", "/api/posts").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["message"], BUSY_MESSAGE);
    }

    #[tokio::test]
    async fn status_reports_run_state() {
        let state = state().await;
        state.orchestrator.tracker().activate(SourceKind::Scraper).unwrap();
        let app = app(state);

        let (status, body) = call(app.clone(), "GET", "/api/sources/scraper/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "active");
        assert!(body["last_run_at"].is_string());

        let (status, _) = call(app, "GET", "/api/sources/rss/status").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn trigger_accepts_then_conflicts() {
        let state = state().await;
        state.orchestrator.tracker().activate(SourceKind::Scraper).unwrap();
        let orchestrator = state.orchestrator.clone();
        let app = app(state);

        let (status, body) = call(app.clone(), "POST", "/api/sources/scraper/sync").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["message"], "a scraper run is already active");

        let (status, body) = call(app, "POST", "/api/sources/api/sync").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "active");

        for _ in 0..100 {
            if orchestrator.status(SourceKind::Api).status != RunStatus::Active {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(orchestrator.status(SourceKind::Api).status, RunStatus::Idle);
    }
}
