//! Reflection store (§4.M): lets a caller save a free-form note as a
//! searchable point alongside indexed transcripts, in a collection that
//! isn't tied to any one project.
//!
//! Reflections land in `reflections_<suffix>` rather than a
//! `conv_<hash>_<suffix>` collection, and carry a `project` payload derived
//! from the caller's working directory so [`crate::search::filter_by_project`]
//! can still narrow to one project when asked, while leaving the collection
//! itself global.

use chrono::Utc;
use serde_json::json;

use crate::embedding::{EmbedKind, EmbeddingProvider};
use crate::error::AppError;
use crate::project::project_from_cwd;
use crate::vector_store::{UpsertPoint, VectorStore};

/// Saves `content` as a reflection point tagged with `tags`. Returns the
/// collection it was written to and the point id, for a confirmation
/// message back to the caller.
pub async fn store_reflection(
    store: &VectorStore,
    provider: &dyn EmbeddingProvider,
    content: &str,
    tags: &[String],
) -> Result<(String, u64), AppError> {
    if content.trim().is_empty() {
        return Err(AppError::BadRequest("reflection content must not be empty".to_string()));
    }

    let collection = format!("reflections_{}", provider.suffix());
    store
        .ensure_collection(&collection, provider.dims() as u64)
        .await?;

    let vectors = provider.embed(&[content.to_string()], EmbedKind::Document).await?;
    let vector = vectors
        .into_iter()
        .next()
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("embedding provider returned no vectors")))?;

    let project = project_from_cwd();
    let project_path = std::env::current_dir().ok().map(|p| p.display().to_string());
    let timestamp = Utc::now();
    let id = reflection_id(timestamp.timestamp_millis());

    let payload = json!({
        "text": content,
        "tags": tags,
        "timestamp": timestamp.to_rfc3339(),
        "type": "reflection",
        "role": "user_reflection",
        "project": project,
        "project_path": project_path,
    });

    let point = UpsertPoint { id, vector, payload };
    store.upsert(&collection, vec![point]).await?;

    Ok((collection, id))
}

/// Derives a 63-bit point id from an epoch-millis timestamp so reflections
/// saved in quick succession still sort close together and never collide
/// with `point_id_for`'s conversation-hash ids.
fn reflection_id(epoch_millis: i64) -> u64 {
    (epoch_millis as u64) & 0x7fff_ffff_ffff_ffff
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reflection_id_fits_63_bits() {
        let id = reflection_id(i64::MAX);
        assert!(id <= 0x7fff_ffff_ffff_ffff);
    }

    #[test]
    fn reflection_id_is_monotonic_in_timestamp() {
        let a = reflection_id(1_000);
        let b = reflection_id(2_000);
        assert!(b > a);
    }
}
