//! HTTP bindings for the tool-protocol surface (§4.L/§4.M/§4.N).
//!
//! Exposes the six operations a host integration calls: `reflect_on_past`,
//! `store_reflection`, `search_by_file`, `search_by_concept`,
//! `get_full_conversation`, and `get_status`.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/tools/reflect` | Semantic search over indexed conversations |
//! | `POST` | `/tools/reflection` | Save a free-form note as a searchable point |
//! | `POST` | `/tools/search-by-file` | Search conversations that touched a file |
//! | `POST` | `/tools/search-by-concept` | Search conversations tagged with a concept |
//! | `GET`  | `/tools/conversation/:id` | Reassemble one conversation's full text |
//! | `GET`  | `/tools/status` | Indexing progress and watcher liveness |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! All error responses follow [`crate::error::AppError`]'s envelope:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted, matching the teacher's
//! own MCP-server CORS posture for browser-based and cross-origin tool
//! callers.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::embedding::{self, local::LocalProvider, voyage::VoyageProvider, EmbeddingProvider};
use crate::error::{AppError, AppResult};
use crate::reflection;
use crate::resolver::Resolver;
use crate::search::{DecayMode, ResponseFormat, SearchEngine, SearchRequest};
use crate::status;
use crate::vector_store::VectorStore;

/// Shared application state passed to all route handlers via Axum's `State`
/// extractor. The write-path provider (used for reflections) and the two
/// search-path providers are kept separate because a collection resolved at
/// search time may belong to either backend, while writes always go
/// through whichever single backend is currently active.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    store: Arc<VectorStore>,
    resolver: Arc<Resolver>,
    write_provider: Arc<dyn EmbeddingProvider>,
    local_provider: Arc<dyn EmbeddingProvider>,
    voyage_provider: Option<Arc<dyn EmbeddingProvider>>,
}

impl AppState {
    fn engine(&self) -> SearchEngine<'_> {
        SearchEngine {
            config: &self.config,
            store: &self.store,
            resolver: &self.resolver,
            local_provider: self.local_provider.as_ref(),
            voyage_provider: self.voyage_provider.as_deref(),
        }
    }
}

/// Starts the HTTP server. Binds to `config.listen_addr` and registers all
/// route handlers; runs until the process is terminated.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let bind_addr = config.listen_addr.clone();
    let config = Arc::new(config);

    let store = Arc::new(VectorStore::with_timeout(&config.qdrant_url, config.max_concurrent_qdrant, config.qdrant_timeout)?);
    let resolver = Arc::new(Resolver::new(Some(config.logs_dir.clone())));

    let write_provider: Arc<dyn EmbeddingProvider> = Arc::from(embedding::create_provider(&config));
    let local_provider: Arc<dyn EmbeddingProvider> =
        Arc::new(LocalProvider::new(&config.embedding_model, config.max_concurrent_embeddings)?);
    let voyage_provider: Option<Arc<dyn EmbeddingProvider>> = config.voyage_api_key.clone().map(|key| {
        Arc::new(VoyageProvider::new(key)) as Arc<dyn EmbeddingProvider>
    });

    let state = AppState {
        config,
        store,
        resolver,
        write_provider,
        local_provider,
        voyage_provider,
    };

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let app = Router::new()
        .route("/tools/reflect", post(handle_reflect_on_past))
        .route("/tools/reflection", post(handle_store_reflection))
        .route("/tools/search-by-file", post(handle_search_by_file))
        .route("/tools/search-by-concept", post(handle_search_by_concept))
        .route("/tools/conversation/:id", get(handle_get_full_conversation))
        .route("/tools/status", get(handle_status))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    tracing::info!(addr = %bind_addr, "server listening");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Wraps a rendered XML or Markdown body with the matching content type,
/// since `reflect_on_past` and friends hand back a raw document rather than
/// a JSON envelope.
struct RenderedBody {
    content_type: &'static str,
    body: String,
}

impl IntoResponse for RenderedBody {
    fn into_response(self) -> Response {
        (StatusCode::OK, [(header::CONTENT_TYPE, self.content_type)], self.body).into_response()
    }
}

fn decay_from_str(value: &str) -> Option<DecayMode> {
    match value {
        "off" => Some(DecayMode::Off),
        "client" => Some(DecayMode::Client),
        "server" => Some(DecayMode::Server),
        _ => None,
    }
}

/// Absent a `decay` field, picks the mode implied by the configured decay
/// settings rather than always defaulting to off, so a server with decay
/// enabled behaves the same whether a caller names the mode explicitly.
fn default_decay_mode(config: &Config) -> DecayMode {
    if !config.enable_memory_decay {
        DecayMode::Off
    } else if config.use_native_decay {
        DecayMode::Server
    } else {
        DecayMode::Client
    }
}

// ============ POST /tools/reflect_on_past ============

#[derive(Deserialize)]
struct ReflectOnPastRequest {
    query: String,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    min_score: f32,
    #[serde(default)]
    decay: Option<String>,
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    include_raw: bool,
    #[serde(default)]
    brief: bool,
    #[serde(default = "default_format")]
    format: String,
}

fn default_limit() -> usize {
    10
}

fn default_format() -> String {
    "xml".to_string()
}

async fn handle_reflect_on_past(
    State(state): State<AppState>,
    Json(req): Json<ReflectOnPastRequest>,
) -> AppResult<RenderedBody> {
    if req.query.trim().is_empty() {
        return Err(AppError::BadRequest("query must not be empty".to_string()));
    }

    let decay = match req.decay.as_deref() {
        Some(s) => decay_from_str(s).ok_or_else(|| AppError::BadRequest(format!("unknown decay mode: {s}")))?,
        None => default_decay_mode(&state.config),
    };
    let format = match req.format.as_str() {
        "xml" => ResponseFormat::Xml,
        "markdown" | "md" => ResponseFormat::Markdown,
        other => return Err(AppError::BadRequest(format!("unknown format: {other}"))),
    };
    let content_type = match format {
        ResponseFormat::Xml => "application/xml",
        ResponseFormat::Markdown => "text/markdown",
    };

    let engine_req = SearchRequest {
        query: req.query,
        limit: req.limit,
        min_score: req.min_score,
        decay,
        project: req.project,
        include_raw: req.include_raw,
        format,
        brief: req.brief,
    };

    let body = state.engine().reflect_on_past(&engine_req).await?;
    Ok(RenderedBody { content_type, body })
}

// ============ POST /tools/store_reflection ============

#[derive(Deserialize)]
struct StoreReflectionRequest {
    content: String,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Serialize)]
struct StoreReflectionResponse {
    collection: String,
    id: u64,
}

async fn handle_store_reflection(
    State(state): State<AppState>,
    Json(req): Json<StoreReflectionRequest>,
) -> AppResult<Json<StoreReflectionResponse>> {
    let (collection, id) = reflection::store_reflection(
        &state.store,
        state.write_provider.as_ref(),
        &req.content,
        &req.tags,
    )
    .await?;

    Ok(Json(StoreReflectionResponse { collection, id }))
}

// ============ POST /tools/search_by_file ============

#[derive(Deserialize)]
struct SearchByFileRequest {
    path: String,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    project: Option<String>,
}

async fn handle_search_by_file(
    State(state): State<AppState>,
    Json(req): Json<SearchByFileRequest>,
) -> AppResult<RenderedBody> {
    if req.path.trim().is_empty() {
        return Err(AppError::BadRequest("path must not be empty".to_string()));
    }

    let body = state
        .engine()
        .search_by_file(&req.path, req.limit, req.project.as_deref())
        .await?;

    Ok(RenderedBody {
        content_type: "application/xml",
        body,
    })
}

// ============ POST /tools/search_by_concept ============

#[derive(Deserialize)]
struct SearchByConceptRequest {
    concept: String,
    #[serde(default)]
    include_files: bool,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    project: Option<String>,
}

async fn handle_search_by_concept(
    State(state): State<AppState>,
    Json(req): Json<SearchByConceptRequest>,
) -> AppResult<RenderedBody> {
    if req.concept.trim().is_empty() {
        return Err(AppError::BadRequest("concept must not be empty".to_string()));
    }

    let body = state
        .engine()
        .search_by_concept(&req.concept, req.include_files, req.limit, req.project.as_deref())
        .await?;

    Ok(RenderedBody {
        content_type: "application/xml",
        body,
    })
}

// ============ GET /tools/conversation/:id ============

#[derive(Deserialize)]
struct GetFullConversationQuery {
    #[serde(default)]
    project: Option<String>,
}

async fn handle_get_full_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Query(query): Query<GetFullConversationQuery>,
) -> AppResult<RenderedBody> {
    if conversation_id.trim().is_empty() {
        return Err(AppError::BadRequest("conversation_id must not be empty".to_string()));
    }

    let body = state
        .engine()
        .get_full_conversation(&conversation_id, query.project.as_deref())
        .await?;

    Ok(RenderedBody {
        content_type: "application/xml",
        body,
    })
}

// ============ GET /tools/status ============

async fn handle_status(State(state): State<AppState>) -> Json<status::StatusReport> {
    Json(status::get_status(&state.config))
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
