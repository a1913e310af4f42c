//! Project resolver (§4.K): maps a user-supplied project string to the set
//! of collection names holding that project's points.
//!
//! Six strategies are tried in order and their results unioned, stopping
//! as soon as a non-empty union is found. Results (and the collections
//! list itself) are cached with a short TTL so a burst of searches against
//! the same project doesn't repeat the filesystem/payload-probe work.

use std::collections::HashSet;
use std::path::Path;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

use crate::project::{normalize_project_name, project_hash};
use crate::vector_store::VectorStore;

const RESOLUTION_TTL: Duration = Duration::from_secs(300);
const COLLECTIONS_TTL: Duration = Duration::from_secs(300);
const PAYLOAD_PROBE_MAX_COLLECTIONS: usize = 200;
const MAX_SEGMENT_CANDIDATES: usize = 5;

fn project_like_words() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^(app|project|service|client|server|api)").unwrap())
}

fn hash_like_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9a-fA-F]{6,}$").unwrap())
}

pub struct Resolver {
    resolution_cache: DashMap<String, (Instant, HashSet<String>)>,
    collections_cache: std::sync::Mutex<Option<(Instant, Vec<String>)>>,
    transcripts_root: Option<std::path::PathBuf>,
}

impl Resolver {
    pub fn new(transcripts_root: Option<std::path::PathBuf>) -> Self {
        Self {
            resolution_cache: DashMap::new(),
            collections_cache: std::sync::Mutex::new(None),
            transcripts_root,
        }
    }

    /// Resolves `user_string` to a set of collection name prefixes (the
    /// part before the `_local`/`_voyage` suffix); callers expand each
    /// prefix against both backend suffixes that currently exist.
    pub async fn resolve(&self, store: &VectorStore, user_string: &str) -> HashSet<String> {
        if let Some(entry) = self.resolution_cache.get(user_string) {
            let (seen_at, ref hashes) = *entry;
            if seen_at.elapsed() < RESOLUTION_TTL {
                return hashes.clone();
            }
        }

        let all_collections = self.collections(store).await;
        let mut matched = HashSet::new();

        for strategy in strategies(user_string) {
            for hash in strategy {
                for name in &all_collections {
                    if collection_matches_hash(name, &hash) {
                        matched.insert(name.clone());
                    }
                }
            }
            if !matched.is_empty() {
                break;
            }
        }

        if matched.is_empty() {
            if let Some(root) = &self.transcripts_root {
                for hash in filesystem_heuristic(root, user_string) {
                    for name in &all_collections {
                        if collection_matches_hash(name, &hash) {
                            matched.insert(name.clone());
                        }
                    }
                }
            }
        }

        if matched.is_empty() {
            for hash in segment_candidates(user_string) {
                for name in &all_collections {
                    if collection_matches_hash(name, &hash) {
                        matched.insert(name.clone());
                    }
                }
            }
        }

        if matched.is_empty() && all_collections.len() <= PAYLOAD_PROBE_MAX_COLLECTIONS {
            for name in &all_collections {
                if let Ok(true) = payload_probe_matches(store, name, user_string).await {
                    matched.insert(name.clone());
                }
            }
        }

        for name in &all_collections {
            if name.starts_with("reflections") {
                matched.insert(name.clone());
            }
        }

        self.resolution_cache
            .insert(user_string.to_string(), (Instant::now(), matched.clone()));
        matched
    }

    /// Every collection currently in Qdrant, TTL-cached. Used by callers
    /// that need to scan everything (an unscoped search, or resolution that
    /// otherwise came up empty).
    pub async fn all_collections(&self, store: &VectorStore) -> Vec<String> {
        self.collections(store).await
    }

    async fn collections(&self, store: &VectorStore) -> Vec<String> {
        {
            let guard = self.collections_cache.lock().unwrap();
            if let Some((seen_at, ref names)) = *guard {
                if seen_at.elapsed() < COLLECTIONS_TTL {
                    return names.clone();
                }
            }
        }

        let names = match store.raw_client().list_collections().await {
            Ok(resp) => resp.collections.into_iter().map(|c| c.name).collect(),
            Err(_) => Vec::new(),
        };

        *self.collections_cache.lock().unwrap() = Some((Instant::now(), names.clone()));
        names
    }
}

fn collection_matches_hash(collection_name: &str, hash: &str) -> bool {
    collection_name.contains(&format!("_{hash}_")) || collection_name.contains(&format!("_{hash}"))
}

/// Strategies 1-3: direct hash, normalized hash, case-insensitive
/// normalized hash. Each yields both the MD5[:8] form (current) and a
/// legacy SHA-256[:16] form, since older collections were named with the
/// latter.
fn strategies(user_string: &str) -> Vec<Vec<String>> {
    let direct = vec![project_hash(user_string), sha256_16(user_string)];

    let normalized_name = normalize_project_name(user_string);
    let normalized = vec![project_hash(&normalized_name), sha256_16(&normalized_name)];

    let lowered = normalized_name.to_lowercase();
    let case_insensitive = vec![project_hash(&lowered), sha256_16(&lowered)];

    vec![direct, normalized, case_insensitive]
}

fn sha256_16(s: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..16].to_string()
}

/// Strategy 4: scan a known transcripts root for dash-encoded directory
/// names ending in `-<user_string>` or containing `-<user_string>-`.
fn filesystem_heuristic(root: &Path, user_string: &str) -> Vec<String> {
    let suffix = format!("-{user_string}");
    let infix = format!("-{user_string}-");

    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };

    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| name.ends_with(&suffix) || name.contains(&infix))
        .map(|name| project_hash(&normalize_project_name(&name)))
        .collect()
}

/// Strategy 5: extract meaningful dash-separated segments from
/// `user_string`, score them, and try the top candidates (plus adjacent
/// pairs) as project names.
fn segment_candidates(user_string: &str) -> Vec<String> {
    let segments: Vec<&str> = user_string
        .split(['-', '/'])
        .filter(|s| s.len() >= 3 && !hash_like_pattern().is_match(s) && !s.contains('.'))
        .collect();

    let mut scored: Vec<(&str, i32)> = segments
        .iter()
        .enumerate()
        .map(|(i, seg)| {
            let mut score = seg.len() as i32;
            score += (segments.len() - i) as i32; // earlier segments score slightly higher
            if project_like_words().is_match(seg) {
                score += 10;
            }
            if seg.chars().next().map(|c| c.is_uppercase()).unwrap_or(false) {
                score += 2;
            }
            (*seg, score)
        })
        .collect();

    scored.sort_by(|a, b| b.1.cmp(&a.1));

    let mut hashes: Vec<String> = scored
        .iter()
        .take(MAX_SEGMENT_CANDIDATES)
        .map(|(seg, _)| project_hash(&normalize_project_name(seg)))
        .collect();

    for window in segments.windows(2).take(MAX_SEGMENT_CANDIDATES) {
        let pair = format!("{}-{}", window[0], window[1]);
        hashes.push(project_hash(&normalize_project_name(&pair)));
    }

    hashes
}

/// Strategy 6: last resort. Samples one point per collection and checks
/// whether its `project` payload matches `user_string` (case-insensitive,
/// after normalization).
async fn payload_probe_matches(
    store: &VectorStore,
    collection: &str,
    user_string: &str,
) -> Result<bool, crate::error::VectorStoreError> {
    let response = store.scroll(collection, None, None, 1).await?;
    let target = normalize_project_name(user_string).to_lowercase();

    for point in response.result {
        if let Some(value) = point.payload.get("project") {
            if let Some(qdrant_client::qdrant::value::Kind::StringValue(project)) = &value.kind {
                let candidate = project.to_lowercase();
                if candidate.contains(&target) || target.contains(&candidate) {
                    return Ok(true);
                }
            }
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_matches_hash_with_underscored_segment() {
        assert!(collection_matches_hash("conv_abcd1234_local", "abcd1234"));
        assert!(!collection_matches_hash("conv_deadbeef_local", "abcd1234"));
    }

    #[test]
    fn segment_candidates_favors_project_like_words() {
        let hashes = segment_candidates("-Users-alice-projects-api-gateway-service");
        // "service" and "api" should score highly enough to produce hashes
        // matching their normalized-name hash.
        assert!(hashes.contains(&project_hash("service")) || hashes.contains(&project_hash("api-gateway-service")));
    }

    #[test]
    fn strategies_direct_and_normalized_agree_for_bare_names() {
        let direct = &strategies("foo-bar")[0];
        let normalized = &strategies("foo-bar")[1];
        assert_eq!(direct[0], normalized[0]);
    }

    #[test]
    fn sha256_16_is_sixteen_hex_chars() {
        let h = sha256_16("foo");
        assert_eq!(h.len(), 16);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
