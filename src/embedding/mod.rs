//! Embedding provider abstraction (§4.E).
//!
//! Two backends, selected by [`Config::prefer_local_embeddings`] and the
//! presence of a Voyage API key:
//!
//! - **[`local`]** — in-process inference via `fastembed`, 384 dimensions,
//!   no network calls after the first model download.
//! - **[`voyage`]** — `POST api.voyageai.com/v1/embeddings`, 1024 dimensions,
//!   retried with backoff.
//!
//! Both write into collections named with a suffix matching the backend
//! (`_local` / `_voyage`) so a project can be indexed under either, or both,
//! without the vectors colliding.

pub mod local;
pub mod voyage;

use async_trait::async_trait;

use crate::config::Config;
use crate::error::EmbeddingError;

/// Whether a batch of texts is being embedded for storage or for a query.
/// Some backends (Voyage) use a different `input_type` for each; local
/// models treat them identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedKind {
    Document,
    Query,
}

/// A backend capable of turning text into vectors.
///
/// `embed` takes a batch rather than one text at a time so backends that
/// hit a remote API can coalesce requests; local backends batch internally
/// before handing work to `spawn_blocking`.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, texts: &[String], kind: EmbedKind) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Output vector dimensionality, used to size and validate collections.
    fn dims(&self) -> usize;

    /// Collection-name suffix for this backend (`"local"` or `"voyage"`).
    fn suffix(&self) -> &'static str;
}

/// No-op provider used when embeddings are disabled (`DISABLE_EMBEDDINGS=1`
/// or no backend is usable — no local feature compiled in and no Voyage
/// key). All calls fail; the watcher surfaces this as a per-file skip
/// rather than aborting the whole run.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    async fn embed(&self, _texts: &[String], _kind: EmbedKind) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Err(EmbeddingError::Disabled)
    }

    fn dims(&self) -> usize {
        0
    }

    fn suffix(&self) -> &'static str {
        "disabled"
    }
}

/// Selects a provider based on configuration: local-first unless
/// `prefer_local_embeddings` is false and a Voyage key is present, falling
/// back to local if Voyage isn't configured, and to [`DisabledProvider`] if
/// neither is usable.
pub fn create_provider(config: &Config) -> Box<dyn EmbeddingProvider> {
    let want_voyage = !config.prefer_local_embeddings && config.voyage_api_key.is_some();

    if want_voyage {
        if let Some(key) = &config.voyage_api_key {
            return Box::new(voyage::VoyageProvider::new(key.clone()));
        }
    }

    #[cfg(any(feature = "local-embeddings-fastembed", feature = "local-embeddings-tract"))]
    {
        if let Ok(provider) = local::LocalProvider::new(&config.embedding_model, config.max_concurrent_embeddings) {
            return Box::new(provider);
        }
    }

    if let Some(key) = &config.voyage_api_key {
        return Box::new(voyage::VoyageProvider::new(key.clone()));
    }

    Box::new(DisabledProvider)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_provider_errors_on_embed() {
        let provider = DisabledProvider;
        let err = provider.embed(&["hi".to_string()], EmbedKind::Document).await;
        assert!(matches!(err, Err(EmbeddingError::Disabled)));
    }

    #[test]
    fn disabled_provider_has_zero_dims() {
        assert_eq!(DisabledProvider.dims(), 0);
    }
}
