//! Axum JSON + NDJSON surface for repo scout.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, ConnectInfo, FromRequestParts, Path as AxumPath, State},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use scout_core::{rank_visible, DeveloperProfile, RunStatus, ScoutEvent, SearchFilters};
use scout_pipeline::{AdmissionError, Orchestrator, RunContext, RunRegistry, ScoutConfig, ScoutServices};
use scout_storage::{ScoutStore, StoreError};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "scout-web";

const NDJSON: &str = "application/x-ndjson";
const EVENT_BUFFER: usize = 32;
const NO_PROFILE: &str = "No developer profile saved. Create one before searching.";

#[derive(Clone)]
pub struct AppState {
    pub store: ScoutStore,
    pub registry: RunRegistry,
    pub orchestrator: Arc<Orchestrator>,
}

impl From<ScoutServices> for AppState {
    fn from(services: ScoutServices) -> Self {
        Self {
            store: services.store,
            registry: services.registry,
            orchestrator: services.orchestrator,
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unprocessable(String),
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Admission(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn detail(&self) -> String {
        match self {
            ApiError::Store(err) => {
                error!(error = %err, "storage failure while serving request");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        }
    }

    /// The error as a one-frame NDJSON stream, for clients already reading events.
    fn into_frame(self) -> Response {
        let status = self.status();
        let frame = ScoutEvent::error(self.detail());
        ndjson_response(status, futures::stream::iter([frame]))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "detail": self.detail() }))).into_response()
    }
}

/// Admission key of the caller: peer address, else first `X-Forwarded-For` hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientKey(pub String);

impl<S: Send + Sync> FromRequestParts<S> for ClientKey {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(ConnectInfo(addr)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
            return Ok(Self(addr.ip().to_string()));
        }
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        Ok(Self(forwarded.unwrap_or("unknown").to_string()))
    }
}

#[derive(Debug, Serialize)]
struct StartedRun {
    run_id: String,
    status: RunStatus,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/scout/profile", post(save_profile_handler).get(get_profile_handler))
        .route("/scout/search", post(start_search_handler))
        .route("/scout/search/{run_id}/stream", get(stream_handler))
        .route("/scout/search/{run_id}/results", get(results_handler))
        .route("/scout/search/{run_id}/cancel", post(cancel_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &ScoutConfig, services: ScoutServices) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.web_port))
        .await
        .with_context(|| format!("binding port {}", config.web_port))?;
    info!(port = config.web_port, "scout web listening");
    axum::serve(
        listener,
        app(AppState::from(services)).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn save_profile_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<DeveloperProfile>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(profile) = payload.map_err(|r| ApiError::Unprocessable(r.body_text()))?;
    let id = state.store.save_profile(&profile).await?;
    Ok(Json(json!({ "id": id })))
}

async fn get_profile_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let stored = state
        .store
        .get_profile()
        .await?
        .ok_or_else(|| ApiError::NotFound("No developer profile saved".into()))?;
    Ok(Json(stored).into_response())
}

async fn start_search_handler(
    State(state): State<Arc<AppState>>,
    client: ClientKey,
    payload: Result<Json<SearchFilters>, JsonRejection>,
) -> Result<(StatusCode, Json<StartedRun>), ApiError> {
    let Json(filters) = payload.map_err(|r| ApiError::Unprocessable(r.body_text()))?;
    let profile = state
        .store
        .get_profile()
        .await?
        .ok_or_else(|| ApiError::BadRequest(NO_PROFILE.into()))?;
    state.registry.admit(&client.0)?;

    let run_id = Uuid::new_v4().to_string();
    state
        .store
        .create_run(&run_id, Some(&profile.id), &filters)
        .await?;
    info!(%run_id, client = %client.0, "search run created");
    Ok((
        StatusCode::CREATED,
        Json(StartedRun {
            run_id,
            status: RunStatus::Running,
        }),
    ))
}

async fn stream_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(run_id): AxumPath<String>,
) -> Response {
    match start_stream(&state, &run_id).await {
        Ok(events) => ndjson_response(StatusCode::OK, ReceiverStream::new(events)),
        Err(err) => err.into_frame(),
    }
}

/// Activate `run_id` and spawn its orchestration. The registry guard lives in the spawned
/// task, so the run stays active until that task ends.
async fn start_stream(
    state: &AppState,
    run_id: &str,
) -> Result<mpsc::Receiver<ScoutEvent>, ApiError> {
    let run = state
        .store
        .get_run(run_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Search run {run_id} not found")))?;
    if run.status != RunStatus::Running {
        return Err(ApiError::Conflict(format!(
            "Search run {run_id} is already {}",
            run.status
        )));
    }
    let profile = state
        .store
        .get_profile()
        .await?
        .ok_or_else(|| ApiError::BadRequest(NO_PROFILE.into()))?;
    let active = state.registry.activate(run_id).map_err(|_| {
        ApiError::Conflict("Another search is already streaming".to_string())
    })?;

    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let orchestrator = Arc::clone(&state.orchestrator);
    let ctx = RunContext {
        run_id: run_id.to_string(),
        profile: Arc::new(profile.profile),
        filters: run.filters,
    };
    tokio::spawn(async move {
        let status = orchestrator.run(ctx, active.token(), tx).await;
        debug!(run_id = active.run_id(), %status, "stream task finished");
    });
    Ok(rx)
}

async fn results_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(run_id): AxumPath<String>,
) -> Result<Response, ApiError> {
    let mut outcome = state
        .store
        .get_results(&run_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Search run {run_id} not found")))?;
    outcome.results = rank_visible(&outcome.results);
    Ok(Json(outcome).into_response())
}

async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(run_id): AxumPath<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !state.registry.cancel(&run_id) {
        if state.store.get_run(&run_id).await?.is_none() {
            return Err(ApiError::NotFound(format!("Search run {run_id} not found")));
        }
        // Not streaming: a run still marked running is closed out directly.
        state.store.mark_cancelled(&run_id).await?;
    }
    Ok(Json(json!({ "status": RunStatus::Cancelled })))
}

fn ndjson_line(event: &ScoutEvent) -> Result<Bytes, serde_json::Error> {
    let mut line = serde_json::to_vec(event)?;
    line.push(b'\n');
    Ok(Bytes::from(line))
}

fn ndjson_response<S>(status: StatusCode, events: S) -> Response
where
    S: Stream<Item = ScoutEvent> + Send + 'static,
{
    let body = Body::from_stream(events.map(|event| ndjson_line(&event)));
    (status, [(header::CONTENT_TYPE, NDJSON)], body).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use scout_core::{AnalysisResult, RepositoryMetadata};
    use scout_github::{DiscoveryError, RepoRef, RepositorySource, SearchResults};
    use scout_pipeline::{AnalysisConfig, RepoScorer, ScoreError, ScoringInput};
    use tower::ServiceExt;

    struct FixedSource;

    #[async_trait]
    impl RepositorySource for FixedSource {
        async fn search(&self, _filters: &SearchFilters) -> Result<SearchResults, DiscoveryError> {
            let repo = |id: i64, name: &str| RepositoryMetadata {
                host_id: id,
                owner: "org".into(),
                name: name.into(),
                url: format!("https://github.com/org/{name}"),
                primary_language: Some("Rust".into()),
                star_count: 400,
                open_issue_count: 9,
                ..Default::default()
            };
            Ok(SearchResults {
                repos: vec![repo(1, "tokio-lite"), repo(2, "serde-extra")],
                warnings: Vec::new(),
            })
        }

        async fn fetch_long_text(
            &self,
            repos: &[RepoRef],
        ) -> Result<HashMap<String, Option<String>>, DiscoveryError> {
            Ok(repos.iter().map(|r| (r.key(), None)).collect())
        }
    }

    struct FixedScorer;

    #[async_trait]
    impl RepoScorer for FixedScorer {
        async fn score(
            &self,
            _profile: &DeveloperProfile,
            batch: &[ScoringInput],
        ) -> Result<Vec<AnalysisResult>, ScoreError> {
            Ok(batch
                .iter()
                .map(|input| AnalysisResult {
                    repo_key: input.repo.repo_key(),
                    fit_score: if input.repo.name == "tokio-lite" { 8.5 } else { 3.0 },
                    reason: "matches async interests".into(),
                    contributions: Vec::new(),
                    reject: input.repo.name == "serde-extra",
                    reject_reason: None,
                })
                .collect())
        }
    }

    struct TestApp {
        _dir: tempfile::TempDir,
        app: Router,
        store: ScoutStore,
    }

    async fn test_app(rate_limit: usize) -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let store = ScoutStore::open(dir.path().join("scout.db"), chrono::Duration::days(30))
            .await
            .unwrap();
        let services = ScoutServices::new(
            store.clone(),
            Arc::new(FixedSource),
            Arc::new(FixedScorer),
            AnalysisConfig::default(),
            RunRegistry::new(rate_limit, Duration::from_secs(3600)),
        );
        TestApp {
            _dir: dir,
            app: app(AppState::from(services)),
            store,
        }
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    async fn body_lines(resp: Response) -> Vec<serde_json::Value> {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(body.to_vec())
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    async fn save_profile(app: &Router) {
        let resp = app
            .clone()
            .oneshot(post_json(
                "/scout/profile",
                json!({"languages": ["Rust"], "topics": ["async"], "skill_level": "advanced"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    async fn start_run(app: &Router) -> String {
        let resp = app
            .clone()
            .oneshot(post_json(
                "/scout/search",
                json!({"languages": ["Rust"], "min_stars": 100, "max_stars": 5000}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "running");
        body["run_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn healthz_answers_ok() {
        let t = test_app(5).await;
        let resp = t.app.oneshot(get("/healthz")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn profile_round_trip_and_validation() {
        let t = test_app(5).await;
        let missing = t.app.clone().oneshot(get("/scout/profile")).await.unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        assert!(body_json(missing).await["detail"].is_string());

        save_profile(&t.app).await;
        let resp = t.app.clone().oneshot(get("/scout/profile")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["profile"]["languages"], json!(["Rust"]));
        assert_eq!(body["profile"]["skill_level"], "advanced");

        let bad = t
            .app
            .oneshot(post_json("/scout/profile", json!({"languages": []})))
            .await
            .unwrap();
        assert_eq!(bad.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn search_start_validates_before_creating_a_run() {
        let t = test_app(5).await;
        let no_profile = t
            .app
            .clone()
            .oneshot(post_json("/scout/search", json!({"languages": ["Rust"]})))
            .await
            .unwrap();
        assert_eq!(no_profile.status(), StatusCode::BAD_REQUEST);

        save_profile(&t.app).await;
        let inverted = t
            .app
            .clone()
            .oneshot(post_json(
                "/scout/search",
                json!({"languages": ["Rust"], "min_stars": 500, "max_stars": 10}),
            ))
            .await
            .unwrap();
        assert_eq!(inverted.status(), StatusCode::UNPROCESSABLE_ENTITY);

        assert_eq!(count_runs(&t.store).await, 0);
    }

    async fn count_runs(store: &ScoutStore) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM search_runs")
            .fetch_one(store.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn search_start_is_rate_limited_per_client() {
        let t = test_app(1).await;
        save_profile(&t.app).await;
        start_run(&t.app).await;
        let resp = t
            .app
            .clone()
            .oneshot(post_json("/scout/search", json!({"languages": ["Rust"]})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(body_json(resp).await["detail"]
            .as_str()
            .unwrap()
            .starts_with("Rate limit exceeded"));
    }

    #[tokio::test]
    async fn stream_runs_to_completion_then_serves_results() {
        let t = test_app(5).await;
        save_profile(&t.app).await;
        let run_id = start_run(&t.app).await;

        let resp = t
            .app
            .clone()
            .oneshot(get(&format!("/scout/search/{run_id}/stream")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], NDJSON);
        let frames = body_lines(resp).await;
        assert_eq!(frames[0]["type"], "status");
        assert_eq!(frames[0]["phase"], "discovering");
        let last = frames.last().unwrap();
        assert_eq!(last["type"], "complete");
        assert_eq!(last["data"]["status"], "completed");
        assert_eq!(last["data"]["total_discovered"], 2);
        assert_eq!(last["data"]["results"].as_array().unwrap().len(), 1);
        assert_eq!(frames.iter().filter(|f| f["type"] != "status").count(), 1);

        let results = t
            .app
            .clone()
            .oneshot(get(&format!("/scout/search/{run_id}/results")))
            .await
            .unwrap();
        assert_eq!(results.status(), StatusCode::OK);
        let body = body_json(results).await;
        assert_eq!(body["total_analyzed"], 2);
        assert_eq!(body["results"][0]["repo_key"], "org/tokio-lite");
        assert_eq!(body["results"].as_array().unwrap().len(), 1);

        let again = t
            .app
            .oneshot(get(&format!("/scout/search/{run_id}/stream")))
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::CONFLICT);
        let frames = body_lines(again).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "error");
    }

    #[tokio::test]
    async fn unknown_runs_are_not_found() {
        let t = test_app(5).await;
        let stream = t
            .app
            .clone()
            .oneshot(get("/scout/search/nope/stream"))
            .await
            .unwrap();
        assert_eq!(stream.status(), StatusCode::NOT_FOUND);
        assert_eq!(stream.headers()[header::CONTENT_TYPE], NDJSON);
        let frames = body_lines(stream).await;
        assert_eq!(frames, vec![json!({"type": "error", "message": "Search run nope not found"})]);

        let results = t
            .app
            .clone()
            .oneshot(get("/scout/search/nope/results"))
            .await
            .unwrap();
        assert_eq!(results.status(), StatusCode::NOT_FOUND);

        let cancel = t
            .app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/scout/search/nope/cancel")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(cancel.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancelling_an_unstreamed_run_closes_it() {
        let t = test_app(5).await;
        save_profile(&t.app).await;
        let run_id = start_run(&t.app).await;

        let cancel = t
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/scout/search/{run_id}/cancel"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(cancel.status(), StatusCode::OK);
        assert_eq!(body_json(cancel).await, json!({"status": "cancelled"}));

        let run = t.store.get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);

        let stream = t
            .app
            .oneshot(get(&format!("/scout/search/{run_id}/stream")))
            .await
            .unwrap();
        assert_eq!(stream.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn client_key_prefers_peer_then_forwarded_header() {
        let (mut parts, _) = Request::builder()
            .header("x-forwarded-for", "10.0.0.7, 172.16.0.1")
            .body(())
            .unwrap()
            .into_parts();
        let key = ClientKey::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(key, ClientKey("10.0.0.7".into()));

        parts
            .extensions
            .insert(ConnectInfo(SocketAddr::from(([192, 168, 1, 4], 5555))));
        let key = ClientKey::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(key, ClientKey("192.168.1.4".into()));

        let (mut bare, _) = Request::builder().body(()).unwrap().into_parts();
        let key = ClientKey::from_request_parts(&mut bare, &()).await.unwrap();
        assert_eq!(key.0, "unknown");
    }
}
