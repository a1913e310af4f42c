//! Watcher loop (§4.J): the incremental-indexing half of the service.
//!
//! One cycle is scan → classify → enqueue (respecting the per-cycle COLD
//! admission cap) → drain a batch → process each file → persist state.
//! Cadence is dynamic: while HOT/URGENT_WARM work is queued the loop wakes
//! every `hot_check_interval`, otherwise it sleeps a full `import_frequency`.
//! A processing error for one file is logged and skipped rather than
//! aborting the cycle — the file stays unmarked and is retried next scan.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::chunk;
use crate::config::Config;
use crate::embedding::{EmbedKind, EmbeddingProvider};
use crate::freshness::{Classifier, Queue, QueuedFile};
use crate::metadata::extract_metadata;
use crate::models::{Chunk, ChunkingVersion, Point};
use crate::project::{normalize_project_name, project_hash};
use crate::state::{epoch_secs, State, StateStore};
use crate::transcript::{index_tool_outputs, stream_messages, Role};
use crate::vector_store::{UpsertPoint, VectorStore};

/// Suffixes a conversation id carries when it is itself a reflection or a
/// continuation of an earlier session; stripped to recover the
/// `base_conversation_id` chunks are grouped by for the search-time boost.
const CONVERSATION_ID_SUFFIXES: &[&str] = &["-reflections", "-continued", "-continuation"];

/// Outcome of [`Watcher::process_file`]: how many chunks the chunker
/// produced versus how many were actually embedded and upserted.
struct ProcessOutcome {
    attempted: usize,
    stored: usize,
}

pub struct Watcher {
    config: Arc<Config>,
    store: Arc<VectorStore>,
    provider: Arc<dyn EmbeddingProvider>,
    state_store: StateStore,
    memory: crate::resource::MemoryMonitor,
    cpu: crate::resource::CpuMonitor,
    legacy_chunking: bool,
}

impl Watcher {
    pub fn new(config: Arc<Config>, store: Arc<VectorStore>, provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self::with_chunking(config, store, provider, false)
    }

    /// Like [`Watcher::new`] but allows forcing the legacy paragraph chunker
    /// (`chunk::chunk_v1`) instead of the default sliding-window chunker, for
    /// older-format transcripts that the window chunker handles poorly.
    pub fn with_chunking(
        config: Arc<Config>,
        store: Arc<VectorStore>,
        provider: Arc<dyn EmbeddingProvider>,
        legacy_chunking: bool,
    ) -> Self {
        let state_store = StateStore::new(config.state_file.clone());
        let memory = crate::resource::MemoryMonitor::new(config.memory_warning_mb, config.memory_limit_mb);
        let cpu = crate::resource::CpuMonitor::new(config.max_cpu_percent_per_core, config.effective_cores_override);
        Self {
            config,
            store,
            provider,
            state_store,
            memory,
            cpu,
            legacy_chunking,
        }
    }

    /// Runs one scan-classify-process cycle and returns the number of files
    /// successfully processed. Used directly by the `sync` CLI subcommand
    /// (one-shot) and by `run`'s loop (repeated).
    pub async fn run_cycle(&self, state: &mut State, classifier: &mut Classifier, queue: &mut Queue) -> usize {
        let now = Utc::now();
        let files = self.scan();
        debug!(found = files.len(), "scan complete");

        let mut categorized = Vec::new();
        for (path, project, mtime) in files {
            let full_path = path.to_string_lossy().into_owned();
            let mtime_epoch = epoch_secs(mtime.into());
            if state.is_imported(&full_path, mtime_epoch) {
                continue;
            }
            let freshness = classifier.classify(&full_path, &project, mtime, now);
            categorized.push(QueuedFile {
                path: full_path,
                project,
                freshness,
            });
        }
        queue.add_categorized(categorized, self.config.max_cold_files);

        let batch = queue.get_batch(self.config.batch_size);
        let mut processed = 0usize;

        for qf in &batch {
            let path = PathBuf::from(&qf.path);
            let mtime = match std::fs::metadata(&path).and_then(|m| m.modified()) {
                Ok(m) => m,
                Err(_) => continue, // file disappeared between scan and processing
            };
            let mtime_epoch = epoch_secs(mtime);
            if state.is_imported(&qf.path, mtime_epoch) {
                continue;
            }

            let (should_cleanup, metrics) = self.memory.check();
            if should_cleanup {
                self.memory.cleanup();
                let (_, after) = self.memory.check();
                if after.level == crate::resource::AlertLevel::Critical {
                    warn!(path = %qf.path, rss_mb = metrics.rss_mb, "memory critical, deferring file");
                    continue;
                }
            }

            match self.process_file(&path, &qf.project).await {
                Ok(outcome) if outcome.attempted == 0 || outcome.stored > 0 => {
                    state.mark_imported(&qf.path, mtime_epoch);
                    classifier.mark_processed(&qf.path);
                    if let Err(e) = self.state_store.save(state) {
                        warn!("failed to persist state after {}: {e}", qf.path);
                    }
                    processed += 1;
                    debug!(path = %qf.path, chunks = outcome.stored, "file processed");
                }
                Ok(outcome) => {
                    warn!(
                        path = %qf.path,
                        attempted = outcome.attempted,
                        "every chunk failed to embed or upsert, leaving file unmarked for retry"
                    );
                }
                Err(e) => {
                    warn!(path = %qf.path, "failed to process file: {e:#}");
                }
            }
        }

        processed
    }

    /// Runs the full watch loop until `shutdown` fires.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut state = match self.state_store.load(&self.config.logs_dir) {
            Ok(s) => s,
            Err(e) => {
                warn!("state load failed, starting from empty state: {e}");
                State::default()
            }
        };

        let current_project = crate::project::project_from_cwd().unwrap_or_default();
        let mut classifier = Classifier::new(
            self.config.hot_window_minutes,
            self.config.warm_window_hours,
            self.config.max_warm_wait_minutes,
            current_project,
        );
        let mut queue = Queue::new(self.config.max_queue_size);

        info!(logs_dir = %self.config.logs_dir.display(), "watcher starting");
        let mut cycle = 0u64;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let processed = self.run_cycle(&mut state, &mut classifier, &mut queue).await;

            if processed > 0 || cycle % 6 == 0 {
                let (_, mem) = self.memory.check();
                info!(
                    cycle,
                    processed,
                    queue_len = queue.len(),
                    rss_mb = mem.rss_mb,
                    high_water_mark = state.high_water_mark,
                    "cycle complete"
                );
            }

            if let Some(oldest) = classifier.oldest_wait(Utc::now()) {
                let backlog_limit = chrono::Duration::hours(self.config.max_backlog_hours as i64);
                if oldest > backlog_limit {
                    warn!(
                        oldest_wait_hours = oldest.num_hours(),
                        limit_hours = self.config.max_backlog_hours,
                        queue_len = queue.len(),
                        "critical backlog: file has waited past MAX_BACKLOG_HOURS"
                    );
                }
            }

            let wait = if queue.has_hot_or_urgent() {
                self.config.hot_check_interval
            } else {
                self.config.import_frequency
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }

            cycle += 1;
        }

        if let Err(e) = self.state_store.save(&state) {
            warn!("final state save failed: {e}");
        }
        info!("watcher stopped");
        Ok(())
    }

    /// Walks `logs_dir` for `*.jsonl` transcript files, returning each with
    /// its inferred project (from the parent directory's dash-encoded name)
    /// and mtime.
    fn scan(&self) -> Vec<(PathBuf, String, DateTime<Utc>)> {
        let mut out = Vec::new();
        for entry in WalkDir::new(&self.config.logs_dir).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            let Ok(modified) = meta.modified() else { continue };
            let mtime: DateTime<Utc> = modified.into();

            let project_dir = path
                .parent()
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str())
                .unwrap_or("unknown");
            let project = normalize_project_name(project_dir);

            out.push((path.to_path_buf(), project, mtime));
        }
        out
    }

    /// Reads, chunks, embeds, and upserts one transcript file. `attempted`
    /// is the number of chunks the chunker produced (zero means the file
    /// had no extractable text, which is trivially "fully processed");
    /// `stored` is how many were actually embedded and upserted. A caller
    /// must only mark the file imported when `attempted == 0 || stored >
    /// 0` — a non-empty file where every chunk failed (e.g. a dimension
    /// mismatch, per §7/S6) must stay unmarked so it is retried next scan.
    async fn process_file(&self, path: &Path, project: &str) -> anyhow::Result<ProcessOutcome> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let messages: Vec<_> = stream_messages(reader).collect();
        if messages.is_empty() {
            return Ok(ProcessOutcome { attempted: 0, stored: 0 });
        }

        let tool_outputs = index_tool_outputs(&messages);
        let metadata = extract_metadata(&messages, &tool_outputs);

        let mut combined = String::new();
        let mut boundaries: Vec<(usize, String)> = Vec::new();
        for msg in &messages {
            let text = msg.text();
            if text.trim().is_empty() {
                continue;
            }
            let role_str = role_label(&msg.role);
            boundaries.push((combined.len(), role_str.clone()));
            combined.push_str(&role_str);
            combined.push_str(": ");
            combined.push_str(&text);
            combined.push_str("\n\n");
        }

        if combined.trim().is_empty() {
            return Ok(ProcessOutcome { attempted: 0, stored: 0 });
        }

        let conversation_id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();
        let base_conversation_id = strip_conversation_suffix(&conversation_id);

        let (raw_chunks, chunking_version) = if self.legacy_chunking {
            (chunk::chunk_v1(&combined), ChunkingVersion::V1)
        } else {
            (chunk::chunk_v2(&combined), ChunkingVersion::V2)
        };
        if raw_chunks.is_empty() {
            return Ok(ProcessOutcome { attempted: 0, stored: 0 });
        }

        let collection = format!("conv_{}_{}", project_hash(project), self.provider.suffix());
        self.store.ensure_collection(&collection, self.provider.dims() as u64).await?;

        let message_count = messages.len() as u32;
        let mut stored = 0usize;

        for (i, raw) in raw_chunks.iter().enumerate() {
            if self.cpu.should_throttle() {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }

            let vector = match self.embed_with_retry(&raw.text).await {
                Some(v) => v,
                None => {
                    warn!(path = %path.display(), index = raw.index, "embedding failed after retries, skipping chunk");
                    continue;
                }
            };
            if vector.len() != self.provider.dims() {
                warn!(
                    path = %path.display(),
                    index = raw.index,
                    expected = self.provider.dims(),
                    got = vector.len(),
                    "embedding dimension mismatch, skipping chunk"
                );
                continue;
            }

            let start_role = boundaries
                .iter()
                .rev()
                .find(|(off, _)| *off <= raw.start)
                .map(|(_, role)| role.clone())
                .unwrap_or_else(|| "user".to_string());

            let mut chunk_metadata = metadata.clone();
            if raw.index > 0 && chunk_metadata.code_patterns.is_some() {
                chunk_metadata.pattern_inheritance = Some(crate::models::PatternInheritance {
                    source_chunk: format!("{conversation_id}_0"),
                    confidence: 1.0,
                    distance: raw.index as u32,
                });
            }

            let chunk_payload = Chunk {
                text: raw.text.clone(),
                conversation_id: conversation_id.clone(),
                base_conversation_id: base_conversation_id.clone(),
                chunk_index: raw.index,
                start_role,
                timestamp: Utc::now(),
                project: project.to_string(),
                chunking_version,
                was_truncated: raw.was_truncated,
                metadata: chunk_metadata,
                message_count: Some(message_count),
                total_length: Some(raw.text.len() as u32),
            };

            let point = Point {
                id: crate::models::point_id_for(&conversation_id, raw.index),
                vector,
                payload: chunk_payload,
            };
            let payload_json = serde_json::to_value(&point.payload)?;
            let upsert_point = UpsertPoint {
                id: point.id,
                vector: point.vector,
                payload: payload_json,
            };

            match self.store.upsert(&collection, vec![upsert_point]).await {
                Ok(()) => stored += 1,
                Err(e) => warn!(path = %path.display(), index = raw.index, "upsert failed: {e}"),
            }

            if i % 10 == 0 {
                let (should_cleanup, _) = self.memory.check();
                if should_cleanup {
                    self.memory.cleanup();
                }
            }
        }

        Ok(ProcessOutcome {
            attempted: raw_chunks.len(),
            stored,
        })
    }

    /// Embeds one chunk of text, retrying up to `config.max_retries` times
    /// with `retry_delay * 2^attempt` backoff. Returns `None` (rather than
    /// propagating) on exhausted retries so the caller can skip just this
    /// chunk instead of aborting the whole file.
    async fn embed_with_retry(&self, text: &str) -> Option<Vec<f32>> {
        let mut attempt = 0u32;
        loop {
            match self.provider.embed(&[text.to_string()], EmbedKind::Document).await {
                Ok(mut vectors) if !vectors.is_empty() => return Some(vectors.remove(0)),
                Ok(_) => return None,
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.config.max_retries {
                        warn!("embedding failed after {attempt} attempts: {e}");
                        return None;
                    }
                    tokio::time::sleep(self.config.retry_delay * (1 << attempt.min(4))).await;
                }
            }
        }
    }
}

fn role_label(role: &Role) -> String {
    match role {
        Role::User => "user".to_string(),
        Role::Assistant => "assistant".to_string(),
        Role::Tool => "tool".to_string(),
        Role::UserReflection => "user_reflection".to_string(),
        Role::Other(s) => s.clone(),
    }
}

fn strip_conversation_suffix(conversation_id: &str) -> String {
    for suffix in CONVERSATION_ID_SUFFIXES {
        if let Some(stripped) = conversation_id.strip_suffix(suffix) {
            return stripped.to_string();
        }
    }
    conversation_id.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_known_conversation_suffixes() {
        assert_eq!(strip_conversation_suffix("abc-reflections"), "abc");
        assert_eq!(strip_conversation_suffix("abc-continued"), "abc");
        assert_eq!(strip_conversation_suffix("abc"), "abc");
    }

    #[test]
    fn role_label_maps_known_roles() {
        assert_eq!(role_label(&Role::User), "user");
        assert_eq!(role_label(&Role::Other("custom".to_string())), "custom");
    }
}
