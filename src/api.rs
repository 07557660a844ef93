//! HTTP and SSE boundary.
//!
//! ## API Endpoints
//!
//! - `GET /health` - Server health check
//! - `GET|POST /api/projects` - List / create projects
//! - `GET /api/projects/{id}/messages` - Persisted conversation
//! - `POST /api/projects/{id}/chat` - Send a message, SSE of the turn
//! - `POST /api/projects/{id}/chat/stop` - Cancel the streaming turn
//! - `GET /api/projects/{id}/chat/status` - Streaming state
//! - `POST /api/projects/{id}/chat/reset` - Forget the agent session
//! - `POST /api/projects/{id}/preview/{start,stop}` - Dev servers
//! - `GET /api/projects/{id}/preview/{status,ready}`
//! - `GET /api/projects/{id}/watch` - SSE of file changes and preview status
//! - `POST /api/projects/{id}/tests/run`, `GET /api/projects/{id}/tests/results`

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::{convert::Infallible, sync::Arc, time::Duration, time::Instant};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::agent::{ChatMode, ClaudeCli};
use crate::chat::{ActiveConversation, ChatEvent, ChatService};
use crate::config::Config;
use crate::error::{AgentError, ChatError, PreviewError, StoreError, TestError, WatchError};
use crate::preview::{self, ConnectionGuard, PreviewManager, PreviewState, PreviewStatus, ReadinessReport};
use crate::store::{FileStore, NewProject, Project, ProjectStore, Turn};
use crate::testing::{TestDriver, TestResult, TestScenario};
use crate::watcher::{WatchManager, WatchSubscription};

/// How often the watch stream repeats the preview status
const PREVIEW_STATUS_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_MESSAGE_LIMIT: usize = 100;

// ============================================================================
// App State - Shared state across all request handlers
// ============================================================================

pub struct AppState {
    pub start_time: Instant,
    pub config: Config,
    pub store: Arc<FileStore>,
    pub chat: ChatService,
    pub preview: Arc<PreviewManager>,
    pub watcher: Arc<WatchManager>,
    pub tests: TestDriver,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self, StoreError> {
        let store = Arc::new(FileStore::open(&config.data_dir, &config.projects_dir)?);
        let shared: Arc<dyn ProjectStore> = store.clone();
        let agent = Arc::new(ClaudeCli::new(config.agent.clone()));

        Ok(Self {
            start_time: Instant::now(),
            chat: ChatService::new(agent, shared.clone()),
            preview: Arc::new(PreviewManager::new(config.preview.clone(), shared)),
            watcher: Arc::new(WatchManager::new(config.watch_debounce)),
            tests: TestDriver::new(config.test_timeout),
            store,
            config,
        })
    }

    /// Stop every dev server and watcher.
    pub async fn shutdown(&self) {
        self.preview.shutdown_all().await;
        self.watcher.stop_all().await;
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health
        .route("/health", get(health))
        // Projects & conversation
        .route("/api/projects", get(list_projects).post(create_project))
        .route("/api/projects/{project_id}/messages", get(list_messages))
        .route("/api/projects/{project_id}/chat", post(chat_send))
        .route("/api/projects/{project_id}/chat/stop", post(chat_stop))
        .route("/api/projects/{project_id}/chat/status", get(chat_status))
        .route("/api/projects/{project_id}/chat/reset", post(chat_reset))
        // Preview
        .route("/api/projects/{project_id}/preview/start", post(preview_start))
        .route("/api/projects/{project_id}/preview/stop", post(preview_stop))
        .route("/api/projects/{project_id}/preview/status", get(preview_status))
        .route("/api/projects/{project_id}/preview/ready", get(preview_ready))
        .route("/api/projects/{project_id}/watch", get(watch_project))
        // Browser tests
        .route("/api/projects/{project_id}/tests/run", post(tests_run))
        .route("/api/projects/{project_id}/tests/results", get(tests_results))
        .layer(cors)
        .with_state(state)
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Chat(#[from] ChatError),

    #[error(transparent)]
    Preview(#[from] PreviewError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error(transparent)]
    Test(#[from] TestError),

    #[error("Preview is not running for {0}")]
    PreviewNotRunning(String),

    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Store(e) => store_status(e),
            ApiError::Chat(e) => match e {
                ChatError::ProjectNotFound(_) => StatusCode::NOT_FOUND,
                ChatError::ConcurrentStreamRejected(_) => StatusCode::CONFLICT,
                ChatError::Agent(AgentError::InvalidProject(_)) => StatusCode::UNPROCESSABLE_ENTITY,
                ChatError::Store(e) => store_status(e),
                ChatError::Agent(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Preview(e) => preview_status_code(e),
            ApiError::Watch(WatchError::MissingRoot(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Watch(_) | ApiError::Test(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::PreviewNotRunning(_) => StatusCode::CONFLICT,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

fn store_status(err: &StoreError) -> StatusCode {
    match err {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn preview_status_code(err: &PreviewError) -> StatusCode {
    match err {
        PreviewError::ProjectNotFound(_) => StatusCode::NOT_FOUND,
        PreviewError::NoPortAvailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        PreviewError::Backend(inner) => preview_status_code(inner),
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("{}", self);
        }
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

// ============================================================================
// Health & Projects
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    version: &'static str,
    preview_ports: String,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.start_time.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION"),
        preview_ports: format!("{}-{}", state.config.preview.port_start, state.config.preview.port_end),
    })
}

#[derive(Serialize)]
struct ProjectsResponse {
    projects: Vec<Project>,
}

async fn list_projects(State(state): State<Arc<AppState>>) -> Json<ProjectsResponse> {
    Json(ProjectsResponse {
        projects: state.store.list_projects(),
    })
}

async fn create_project(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NewProject>,
) -> Result<(StatusCode, Json<Project>), ApiError> {
    let project = state.store.create_project(req)?;
    Ok((StatusCode::CREATED, Json(project)))
}

#[derive(Deserialize)]
struct MessagesQuery {
    #[serde(default = "default_message_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

fn default_message_limit() -> usize {
    DEFAULT_MESSAGE_LIMIT
}

#[derive(Serialize)]
struct MessagesResponse {
    messages: Vec<Turn>,
}

async fn list_messages(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<MessagesResponse>, ApiError> {
    let messages = state.store.list_turns(&project_id, query.limit, query.offset)?;
    Ok(Json(MessagesResponse { messages }))
}

// ============================================================================
// Chat
// ============================================================================

#[derive(Deserialize)]
struct ChatRequest {
    content: String,
    #[serde(default)]
    mode: ChatMode,
}

fn chat_event(event: &ChatEvent) -> Event {
    Event::default()
        .event(event.name())
        .data(serde_json::to_string(event).unwrap_or_default())
}

/// Streams one turn. Rejections (unknown project, a turn already
/// streaming) are plain HTTP errors, not SSE.
async fn chat_send(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if req.content.trim().is_empty() {
        return Err(ApiError::BadRequest("Message content is empty".to_string()));
    }
    let rx = state.chat.send_message(&project_id, &req.content, req.mode).await?;

    let stream = stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        Some((Ok(chat_event(&event)), rx))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[derive(Serialize)]
struct StopResponse {
    stopped: bool,
}

async fn chat_stop(State(state): State<Arc<AppState>>, Path(project_id): Path<String>) -> Json<StopResponse> {
    let stopped = state.chat.stop(&project_id);
    if stopped {
        info!("Stop requested for chat turn in {}", project_id);
    }
    Json(StopResponse { stopped })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatStatusResponse {
    is_streaming: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    active: Option<ActiveConversation>,
}

async fn chat_status(State(state): State<Arc<AppState>>, Path(project_id): Path<String>) -> Json<ChatStatusResponse> {
    let active = state.chat.active(&project_id);
    Json(ChatStatusResponse {
        is_streaming: active.as_ref().map(|a| a.is_streaming).unwrap_or(false),
        active,
    })
}

#[derive(Serialize)]
struct SimpleResponse {
    status: String,
}

async fn chat_reset(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> Result<Json<SimpleResponse>, ApiError> {
    state.chat.reset_session(&project_id)?;
    Ok(Json(SimpleResponse {
        status: "reset".to_string(),
    }))
}

// ============================================================================
// Preview
// ============================================================================

async fn preview_start(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> Result<Json<PreviewStatus>, ApiError> {
    Ok(Json(state.preview.start(&project_id).await?))
}

async fn preview_stop(State(state): State<Arc<AppState>>, Path(project_id): Path<String>) -> Json<PreviewStatus> {
    Json(state.preview.stop(&project_id).await)
}

async fn preview_status(State(state): State<Arc<AppState>>, Path(project_id): Path<String>) -> Json<PreviewStatus> {
    Json(state.preview.status(&project_id))
}

async fn preview_ready(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> Result<Json<ReadinessReport>, ApiError> {
    Ok(Json(state.preview.check_project_ready(&project_id)?))
}

/// Everything one watch stream holds; dropping it (client gone) releases
/// the watch subscription and the preview viewer registration.
struct WatchFeed {
    changes: WatchSubscription,
    _viewer: ConnectionGuard,
    preview: Arc<PreviewManager>,
    project_id: String,
    ticker: tokio::time::Interval,
}

async fn watch_project(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let project = state.store.find_project(&project_id)?;
    let changes = state.watcher.subscribe(&project_id, &project.path).await?;
    let viewer = state.preview.connect(&project_id);

    let feed = WatchFeed {
        changes,
        _viewer: viewer,
        preview: state.preview.clone(),
        project_id,
        ticker: tokio::time::interval(PREVIEW_STATUS_INTERVAL),
    };

    let stream = stream::unfold(feed, |mut feed| async move {
        let event = tokio::select! {
            change = feed.changes.recv() => match change {
                Some(change) => Event::default()
                    .event("file_change")
                    .data(serde_json::to_string(&change).unwrap_or_default()),
                None => return None,
            },
            _ = feed.ticker.tick() => {
                let status = feed.preview.status(&feed.project_id);
                Event::default()
                    .event("preview_status")
                    .data(serde_json::to_string(&status).unwrap_or_default())
            }
        };
        Some((Ok(event), feed))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ============================================================================
// Browser tests
// ============================================================================

async fn tests_run(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
    Json(scenario): Json<TestScenario>,
) -> Result<Json<TestResult>, ApiError> {
    if scenario.steps.is_empty() {
        return Err(ApiError::BadRequest("Test scenario has no steps".to_string()));
    }
    let project = state.store.find_project(&project_id)?;
    let status = state.preview.status(&project_id);
    let base_url = match (status.status, status.url) {
        (PreviewState::Running, Some(url)) => url,
        _ => return Err(ApiError::PreviewNotRunning(project_id)),
    };

    let work_dir = preview::frontend_dir(&project.path);
    let result = state.tests.run(&project_id, &work_dir, &base_url, scenario).await?;
    Ok(Json(result))
}

#[derive(Serialize)]
struct TestResultsResponse {
    results: Vec<TestResult>,
}

async fn tests_results(State(state): State<Arc<AppState>>, Path(project_id): Path<String>) -> Json<TestResultsResponse> {
    Json(TestResultsResponse {
        results: state.tests.results(&project_id),
    })
}
