//! Status reporter (§4.N): a read-only summary of indexing progress,
//! computed fresh from the filesystem and the watcher's state file rather
//! than tracked incrementally, so it stays correct even if the reporting
//! process and the watcher process are different.

use std::collections::HashMap;
use std::path::Path;
use std::time::SystemTime;

use serde::Serialize;
use walkdir::WalkDir;

use crate::config::Config;
use crate::project::normalize_project_name;
use crate::state::{epoch_secs, StateStore};

const WATCHER_LIVENESS_SECS: i64 = 120;

#[derive(Debug, Clone, Serialize)]
pub struct ProjectStatus {
    pub percentage: f64,
    pub indexed: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OverallStatus {
    pub percentage: f64,
    pub indexed: u64,
    pub total: u64,
    pub backlog: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WatcherStatus {
    pub running: bool,
    pub files_processed: u64,
    pub last_update_seconds: Option<i64>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub overall: OverallStatus,
    pub projects: HashMap<String, ProjectStatus>,
    pub watcher: WatcherStatus,
}

/// Walks `config.logs_dir` for transcript files, cross-references each
/// against the watcher's imported-files set, and rolls the result up into
/// overall and per-project percentages plus watcher liveness.
pub fn get_status(config: &Config) -> StatusReport {
    let state_store = StateStore::new(config.state_file.clone());
    let state = state_store.load(&config.logs_dir).unwrap_or_default();

    let mut totals: HashMap<String, (u64, u64)> = HashMap::new(); // project -> (indexed, total)
    let mut total_indexed = 0u64;
    let mut total_files = 0u64;

    for entry in WalkDir::new(&config.logs_dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }

        let project_dir = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .unwrap_or("unknown");
        let project = normalize_project_name(project_dir);

        let is_indexed = is_file_indexed(&state, path, &config.logs_dir);

        total_files += 1;
        if is_indexed {
            total_indexed += 1;
        }

        let entry = totals.entry(project).or_insert((0, 0));
        entry.1 += 1;
        if is_indexed {
            entry.0 += 1;
        }
    }

    let projects = totals
        .into_iter()
        .map(|(project, (indexed, total))| {
            (
                project,
                ProjectStatus {
                    percentage: percentage(indexed, total),
                    indexed,
                    total,
                },
            )
        })
        .collect();

    let overall = OverallStatus {
        percentage: percentage(total_indexed, total_files),
        indexed: total_indexed,
        total: total_files,
        backlog: total_files.saturating_sub(total_indexed),
    };

    StatusReport {
        overall,
        projects,
        watcher: watcher_status(config),
    }
}

fn percentage(indexed: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        (indexed as f64 / total as f64) * 100.0
    }
}

/// A file counts as indexed if its path (after rewriting a leading
/// `/logs/` to the configured `logs_dir`, the shape the path takes inside a
/// container) is present in the imported-files set.
fn is_file_indexed(state: &crate::state::State, path: &Path, logs_dir: &Path) -> bool {
    let full_path = path.to_string_lossy().into_owned();
    if state.imported_files.contains_key(&full_path) {
        return true;
    }

    let normalized = normalize_container_path(&full_path, logs_dir);
    state.imported_files.contains_key(&normalized)
}

/// Rewrites a `/logs/...` prefixed path (the mount point a containerized
/// watcher sees) onto the local `logs_dir`, so status reads agree whether
/// the reporting process and the watcher run on the host or in a container
/// against the same transcript tree.
fn normalize_container_path(path: &str, logs_dir: &Path) -> String {
    match path.strip_prefix("/logs/") {
        Some(rest) => logs_dir.join(rest).to_string_lossy().into_owned(),
        None => path.to_string(),
    }
}

fn watcher_status(config: &Config) -> WatcherStatus {
    let files_processed = StateStore::new(config.state_file.clone())
        .load(&config.logs_dir)
        .map(|s| s.imported_files.len() as u64)
        .unwrap_or(0);

    let mtime = std::fs::metadata(&config.state_file).and_then(|m| m.modified());

    match mtime {
        Ok(modified) => {
            let age = epoch_secs(SystemTime::now()) - epoch_secs(modified);
            let running = age <= WATCHER_LIVENESS_SECS;
            WatcherStatus {
                running,
                files_processed,
                last_update_seconds: Some(age.max(0)),
                status: if running { "running" } else { "stale" }.to_string(),
            }
        }
        Err(_) => WatcherStatus {
            running: false,
            files_processed,
            last_update_seconds: None,
            status: "not_running".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::State;
    use tempfile::tempdir;

    #[test]
    fn percentage_of_empty_total_is_100() {
        assert_eq!(percentage(0, 0), 100.0);
    }

    #[test]
    fn percentage_computes_ratio() {
        assert_eq!(percentage(1, 4), 25.0);
    }

    #[test]
    fn container_path_is_rewritten_onto_logs_dir() {
        let logs_dir = Path::new("/home/alice/.claude/projects");
        let rewritten = normalize_container_path("/logs/foo/bar.jsonl", logs_dir);
        assert_eq!(rewritten, logs_dir.join("foo/bar.jsonl").to_string_lossy());
    }

    #[test]
    fn non_container_path_passes_through_unchanged() {
        let logs_dir = Path::new("/home/alice/.claude/projects");
        let path = "/home/alice/.claude/projects/foo/bar.jsonl";
        assert_eq!(normalize_container_path(path, logs_dir), path);
    }

    #[test]
    fn file_is_indexed_when_present_in_imported_set() {
        let mut state = State::default();
        state.mark_imported("/a/b.jsonl", 100);
        assert!(is_file_indexed(&state, Path::new("/a/b.jsonl"), Path::new("/a")));
    }

    #[test]
    fn watcher_status_reports_not_running_without_a_state_file() {
        let dir = tempdir().unwrap();
        let mut config = Config::from_env();
        config.state_file = dir.path().join("nope.json");
        config.logs_dir = dir.path().to_path_buf();
        let status = watcher_status(&config);
        assert!(!status.running);
        assert_eq!(status.status, "not_running");
    }

    #[test]
    fn watcher_status_reports_running_for_a_freshly_written_state_file() {
        let dir = tempdir().unwrap();
        let mut config = Config::from_env();
        config.state_file = dir.path().join("state.json");
        config.logs_dir = dir.path().to_path_buf();
        StateStore::new(config.state_file.clone()).save(&State::default()).unwrap();

        let status = watcher_status(&config);
        assert!(status.running);
        assert_eq!(status.status, "running");
    }
}
