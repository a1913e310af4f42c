//! Core data types shared across the pipeline: the reconstructed [`Chunk`]
//! payload and the vector-store [`Point`] it is embedded into.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which chunking algorithm produced a chunk. v2 hits receive a search-time
/// score boost; readers must treat an absent field as `V1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkingVersion {
    V1,
    V2,
}

impl Default for ChunkingVersion {
    fn default() -> Self {
        ChunkingVersion::V1
    }
}

/// Bounded, tool-derived metadata extracted from one transcript file and
/// stamped onto every chunk produced from it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub metadata_version: u32,
    #[serde(default)]
    pub files_analyzed: Vec<String>,
    #[serde(default)]
    pub files_edited: Vec<String>,
    #[serde(default)]
    pub files_created: Vec<String>,
    #[serde(default)]
    pub tools_used: Vec<String>,
    #[serde(default)]
    pub tool_summary: HashMap<String, u32>,
    #[serde(default)]
    pub search_patterns: Vec<String>,
    #[serde(default)]
    pub bash_commands: Vec<String>,
    #[serde(default)]
    pub glob_patterns: Vec<String>,
    #[serde(default)]
    pub task_calls: Vec<String>,
    #[serde(default)]
    pub web_searches: Vec<String>,
    #[serde(default)]
    pub git_file_changes: Vec<String>,
    #[serde(default)]
    pub tool_outputs: Vec<String>,
    #[serde(default)]
    pub concepts: Vec<String>,
    #[serde(default)]
    pub analysis_only: bool,
    /// Regex-derived code idioms found in the chunk's source file, grouped
    /// by category (e.g. "async_patterns", "error_handling").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_patterns: Option<HashMap<String, Vec<String>>>,
    /// Set when a chunk's `code_patterns` were copied forward from another
    /// chunk in the same file rather than extracted directly from its own
    /// text (the common case for sliding-window chunks past the first).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern_inheritance: Option<PatternInheritance>,
}

/// Provenance of an inherited `code_patterns` value: which chunk it came
/// from, how far from it (in chunk-index terms), and how confident the
/// inheritance is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternInheritance {
    pub source_chunk: String,
    pub confidence: f32,
    pub distance: u32,
}

/// The unit of embedding and search: a contiguous slice of reconstructed
/// transcript text plus the metadata extracted from the file it came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    pub conversation_id: String,
    /// The conversation id with any `-reflections`/`-continued` suffix
    /// stripped; used to group chunks for the base-conversation boost.
    pub base_conversation_id: String,
    pub chunk_index: i64,
    pub start_role: String,
    pub timestamp: DateTime<Utc>,
    pub project: String,
    #[serde(default)]
    pub chunking_version: ChunkingVersion,
    #[serde(default)]
    pub was_truncated: bool,
    #[serde(flatten)]
    pub metadata: ChunkMetadata,
    #[serde(default)]
    pub message_count: Option<u32>,
    #[serde(default)]
    pub total_length: Option<u32>,
}

/// A vector-store row: a stable 63-bit id, the embedding vector, and the
/// chunk it carries as payload. Ids are derived from
/// `hash(conversation_id || "_" || chunk_index)` so re-processing the same
/// chunk always produces the same id (idempotent upsert).
#[derive(Debug, Clone)]
pub struct Point {
    pub id: u64,
    pub vector: Vec<f32>,
    pub payload: Chunk,
}

/// Caps point ids to 63 bits so they fit into signed 64-bit id fields some
/// vector-store wire protocols use.
pub fn point_id_for(conversation_id: &str, chunk_index: i64) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    conversation_id.hash(&mut hasher);
    "_".hash(&mut hasher);
    chunk_index.hash(&mut hasher);
    hasher.finish() & 0x7fff_ffff_ffff_ffff
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_id_is_stable_across_calls() {
        let a = point_id_for("conv-123", 4);
        let b = point_id_for("conv-123", 4);
        assert_eq!(a, b);
    }

    #[test]
    fn point_id_differs_by_index() {
        let a = point_id_for("conv-123", 4);
        let b = point_id_for("conv-123", 5);
        assert_ne!(a, b);
    }

    #[test]
    fn point_id_fits_63_bits() {
        let id = point_id_for("anything-at-all", 999_999);
        assert!(id <= 0x7fff_ffff_ffff_ffff);
    }

    #[test]
    fn default_chunking_version_is_v1() {
        assert_eq!(ChunkingVersion::default(), ChunkingVersion::V1);
    }
}
