//! JSON HTTP API over the knowledge core.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/ingest` | Ingest base64-encoded files |
//! | `POST` | `/query` | Search enabled files |
//! | `POST` | `/rag` | Run the RAG pipeline for one chat turn |
//! | `GET`  | `/rag/{thread_id}` | Cached RAG results of a thread |
//! | `GET`  | `/agents` | All agent configs |
//! | `GET`/`PUT`/`DELETE` | `/agents/{kind}` | Read, replace, or reset one agent config |
//! | `GET`  | `/files` | Knowledge file list |
//! | `DELETE` | `/files/{id}` | Delete a file and its chunks |
//! | `PUT`  | `/files/{id}/enabled` | Include or exclude a file from retrieval |
//! | `GET`  | `/index/stats` | Index summary |
//! | `GET`  | `/events` | Server-sent `knowledge:progress` events |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404),
//! `embeddings_unavailable` (503), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! clients.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post, put},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::agents::{AgentConfig, AgentKind};
use crate::app::App;
use crate::config::Config;
use crate::error::RagError;
use crate::index::IndexStats;
use crate::ingest::{IngestReport, IngestSource};
use crate::models::{KnowledgeFileList, RetrievedChunk, ThreadMessage};
use crate::rag::{build_final_prompt, RagHistoryEntry, RagOutcome};

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
struct AppState {
    app: Arc<App>,
}

/// Starts the HTTP server on `[server].bind`. Runs until the process is
/// terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let app = Arc::new(App::open(config.clone()).await?);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(bind = %bind_addr, "knowledge server listening");
    println!("Knowledge server listening on http://{}", bind_addr);
    axum::serve(listener, router(app)).await?;

    Ok(())
}

/// The API routes over `app`.
pub fn router(app: Arc<App>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/ingest", post(handle_ingest))
        .route("/query", post(handle_query))
        .route("/rag", post(handle_rag))
        .route("/rag/{thread_id}", get(handle_rag_history))
        .route("/agents", get(handle_list_agents))
        .route(
            "/agents/{kind}",
            get(handle_get_agent).put(handle_put_agent).delete(handle_reset_agent),
        )
        .route("/files", get(handle_list_files))
        .route("/files/{id}", axum::routing::delete(handle_delete_file))
        .route("/files/{id}/enabled", put(handle_set_enabled))
        .route("/index/stats", get(handle_index_stats))
        .route("/events", get(handle_events))
        .layer(cors)
        .with_state(AppState { app })
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
#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

impl From<RagError> for AppError {
    fn from(e: RagError) -> Self {
        match e {
            RagError::Template(_) | RagError::InvalidConfig(_) | RagError::UnsupportedFormat(_) => {
                bad_request(e.to_string())
            }
            RagError::EmbeddingUnavailable(_) => AppError {
                status: StatusCode::SERVICE_UNAVAILABLE,
                code: "embeddings_unavailable",
                message: e.to_string(),
            },
            _ => AppError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                code: "internal",
                message: e.to_string(),
            },
        }
    }
}

fn parse_kind(kind: &str) -> Result<AgentKind, AppError> {
    kind.parse::<AgentKind>().map_err(|_| not_found(format!("no agent named {}", kind)))
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

// ============ POST /ingest ============

#[derive(Deserialize)]
struct IngestRequest {
    files: Vec<IngestFile>,
}

#[derive(Deserialize)]
struct IngestFile {
    name: String,
    content_base64: String,
}

async fn handle_ingest(
    State(state): State<AppState>,
    Json(req): Json<IngestRequest>,
) -> Result<Json<IngestReport>, AppError> {
    if req.files.is_empty() {
        return Err(bad_request("files must not be empty"));
    }
    let sources = req
        .files
        .into_iter()
        .map(|f| {
            STANDARD
                .decode(f.content_base64.as_bytes())
                .map(|bytes| IngestSource::new(f.name.clone(), bytes))
                .map_err(|e| bad_request(format!("{}: invalid base64: {}", f.name, e)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let pipeline = state.app.pipeline(Arc::new(state.app.events.clone()));
    Ok(Json(pipeline.ingest(sources).await))
}

// ============ POST /query ============

#[derive(Deserialize)]
struct QueryRequest {
    query: String,
    top_k: Option<usize>,
}

#[derive(Serialize)]
struct QueryResponse {
    results: Vec<RetrievedChunk>,
}

async fn handle_query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let top_k = req.top_k.unwrap_or(state.app.config.retrieval.refine_top_k);
    let results = state.app.search.search(&req.query, top_k).await;
    Ok(Json(QueryResponse { results }))
}

// ============ POST /rag ============

#[derive(Deserialize)]
struct RagRequest {
    thread_id: Option<String>,
    query: String,
    #[serde(default)]
    history: Vec<ThreadMessage>,
    /// Context the chat already carries, folded into `prompt`.
    existing_context: Option<String>,
}

#[derive(Serialize)]
struct RagResponse {
    #[serde(flatten)]
    outcome: RagOutcome,
    /// The message to send to the chat model.
    prompt: String,
}

async fn handle_rag(State(state): State<AppState>, Json(req): Json<RagRequest>) -> Result<Json<RagResponse>, AppError> {
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let outcome = state
        .app
        .rag
        .run(req.thread_id.as_deref(), &req.query, &req.history)
        .await;
    let prompt = build_final_prompt(&req.query, &outcome.context, req.existing_context.as_deref());
    Ok(Json(RagResponse { outcome, prompt }))
}

async fn handle_rag_history(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Result<Json<RagHistoryEntry>, AppError> {
    state
        .app
        .history
        .get(&thread_id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(format!("no cached results for thread {}", thread_id)))
}

// ============ /agents ============

#[derive(Serialize)]
struct AgentEntry {
    kind: AgentKind,
    config: AgentConfig,
}

async fn handle_list_agents(State(state): State<AppState>) -> Result<Json<Vec<AgentEntry>>, AppError> {
    let mut agents = Vec::with_capacity(AgentKind::ALL.len());
    for kind in AgentKind::ALL {
        agents.push(AgentEntry {
            kind,
            config: state.app.configs.get(kind).await?,
        });
    }
    Ok(Json(agents))
}

async fn handle_get_agent(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> Result<Json<AgentConfig>, AppError> {
    let kind = parse_kind(&kind)?;
    Ok(Json(state.app.configs.get(kind).await?))
}

async fn handle_put_agent(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Json(config): Json<AgentConfig>,
) -> Result<Json<AgentConfig>, AppError> {
    let kind = parse_kind(&kind)?;
    state.app.configs.put(kind, &config).await?;
    Ok(Json(config))
}

async fn handle_reset_agent(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> Result<Json<AgentConfig>, AppError> {
    let kind = parse_kind(&kind)?;
    state.app.configs.reset(kind).await?;
    Ok(Json(state.app.configs.get(kind).await?))
}

// ============ /files ============

async fn handle_list_files(State(state): State<AppState>) -> Result<Json<KnowledgeFileList>, AppError> {
    Ok(Json(state.app.kb.files.list().await?))
}

async fn handle_delete_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    if state.app.kb.delete_file(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(format!("no file with id {}", id)))
    }
}

#[derive(Deserialize)]
struct EnabledRequest {
    enabled: bool,
}

async fn handle_set_enabled(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<EnabledRequest>,
) -> Result<StatusCode, AppError> {
    if state.app.kb.files.set_enabled(&id, req.enabled).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(format!("no file with id {}", id)))
    }
}

// ============ GET /index/stats ============

async fn handle_index_stats(State(state): State<AppState>) -> Json<IndexStats> {
    Json(state.app.kb.index.stats().await)
}

// ============ GET /events ============

/// Progress events as they are published. A subscriber that falls behind
/// skips the events it missed.
async fn handle_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let topic = state.app.events.topic();
    let rx = state.app.events.subscribe();
    let events = stream::unfold(rx, move |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(ev) => {
                    let data = match serde_json::to_string(&ev) {
                        Ok(data) => data,
                        Err(e) => {
                            warn!(error = %e, "unserializable progress event");
                            continue;
                        }
                    };
                    return Some((Ok(Event::default().event(topic).data(data)), rx));
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "progress subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}
