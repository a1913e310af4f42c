//! In-process local embedding backend (§4.E).
//!
//! Fixed to a single 384-dimension sentence-embedding model
//! (`all-MiniLM-L6-v2`), run via `fastembed` on primary platforms or via the
//! pure-Rust `tract` fallback (musl, Intel Mac) behind the
//! `local-embeddings-tract` feature. Inference is CPU-bound, so every call
//! is offloaded to [`tokio::task::spawn_blocking`]; a semaphore caps how
//! many inference calls run concurrently (default 2 — see
//! `MAX_CONCURRENT_EMBEDDINGS`), since each one pins a CPU core and the
//! watcher loop still needs to make progress elsewhere.

#[cfg(feature = "local-embeddings-tract")]
mod tract_backend;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::error::EmbeddingError;

use super::{EmbedKind, EmbeddingProvider};

pub const LOCAL_DIMS: usize = 384;
const MODEL_NAME: &str = "all-MiniLM-L6-v2";

pub struct LocalProvider {
    semaphore: Arc<Semaphore>,
}

impl LocalProvider {
    /// `_model_name` is accepted for forward compatibility with
    /// `EMBEDDING_MODEL` overrides but the only model currently supported is
    /// the fixed 384-dim MiniLM; other values are ignored rather than
    /// rejected, since a bad override shouldn't take indexing down.
    pub fn new(_model_name: &str, max_concurrent: usize) -> Result<Self> {
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for LocalProvider {
    async fn embed(&self, texts: &[String], _kind: EmbedKind) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| EmbeddingError::Local(e.to_string()))?;

        let texts = texts.to_vec();

        tokio::task::spawn_blocking(move || embed_blocking(&texts))
            .await
            .map_err(|e| EmbeddingError::Local(format!("embedding task panicked: {e}")))?
    }

    fn dims(&self) -> usize {
        LOCAL_DIMS
    }

    fn suffix(&self) -> &'static str {
        "local"
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn embed_blocking(texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    use std::sync::{Mutex, OnceLock};

    static MODEL: OnceLock<Mutex<fastembed::TextEmbedding>> = OnceLock::new();

    if MODEL.get().is_none() {
        let built = fastembed::TextEmbedding::try_new(
            fastembed::InitOptions::new(fastembed::EmbeddingModel::AllMiniLML6V2)
                .with_show_download_progress(false),
        )
        .map_err(|e| EmbeddingError::Local(format!("failed to initialize {MODEL_NAME}: {e}")))?;
        // Another thread may have raced us to initialize; either way MODEL is set now.
        let _ = MODEL.set(Mutex::new(built));
    }

    let model = MODEL.get().expect("model initialized above");
    let mut model = model.lock().map_err(|_| EmbeddingError::Local("embedding model mutex poisoned".to_string()))?;
    model
        .embed(texts.to_vec(), None)
        .map_err(|e| EmbeddingError::Local(format!("{MODEL_NAME} inference failed: {e}")))
}

#[cfg(all(feature = "local-embeddings-tract", not(feature = "local-embeddings-fastembed")))]
fn embed_blocking(texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    tract_backend::embed(texts).map_err(|e| EmbeddingError::Local(e.to_string()))
}

#[cfg(not(any(feature = "local-embeddings-fastembed", feature = "local-embeddings-tract")))]
fn embed_blocking(_texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    Err(EmbeddingError::Local(
        "no local embedding backend compiled in".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_batch_short_circuits_without_touching_the_model() {
        let provider = LocalProvider::new(MODEL_NAME, 2).unwrap();
        let out = provider.embed(&[], EmbedKind::Document).await.unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn reports_fixed_dims() {
        let provider = LocalProvider::new(MODEL_NAME, 2).unwrap();
        assert_eq!(provider.dims(), 384);
    }
}
