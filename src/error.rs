//! Typed error kinds at each service boundary, converging into a single
//! [`AppError`] that `main`/`server` propagate and log.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Errors from the vector-store boundary (§4.F).
#[derive(Error, Debug)]
pub enum VectorStoreError {
    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("vector dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("request timed out after retries")]
    Timeout,

    #[error("qdrant client error: {0}")]
    Client(#[from] anyhow::Error),
}

/// Errors from the embedding-provider boundary (§4.E).
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("embeddings are disabled")]
    Disabled,

    #[error("embedding request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("embedding provider returned an unexpected response: {0}")]
    BadResponse(String),

    #[error("local embedding backend error: {0}")]
    Local(String),
}

/// Errors from the state-store boundary (§4.G).
#[derive(Error, Debug)]
pub enum StateError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state file is corrupt and was reset: {0}")]
    Corrupt(String),
}

/// Top-level application error. Orchestration code (the watcher loop, the
/// CLI) mostly propagates `anyhow::Error`; the HTTP surface needs a typed
/// error so it can map variants to status codes.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    VectorStore(#[from] VectorStoreError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found", self.to_string()),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request", self.to_string()),
            AppError::Embedding(EmbeddingError::Disabled) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "embeddings_disabled",
                self.to_string(),
            ),
            AppError::VectorStore(VectorStoreError::CollectionNotFound(_)) => {
                (StatusCode::NOT_FOUND, "collection_not_found", self.to_string())
            }
            AppError::VectorStore(_) => (
                StatusCode::BAD_GATEWAY,
                "vector_store_error",
                self.to_string(),
            ),
            AppError::Embedding(_) => (
                StatusCode::BAD_GATEWAY,
                "embedding_error",
                self.to_string(),
            ),
            AppError::State(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "state_error",
                self.to_string(),
            ),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "internal error".to_string(),
            ),
        };

        let body = json!({
            "error": {
                "code": code,
                "message": message,
            }
        });

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
