//! Crash-safe JSON state store (§4.G).
//!
//! The watcher's only durable bookkeeping: which files have been imported,
//! and up to what mtime. Written with a tmp-file + fsync + rename so a
//! crash mid-write never leaves a truncated or torn `state_file` behind —
//! the rename is what the teacher's own `db.rs` relied on SQLite's WAL for;
//! here there's no database, so the atomic-rename idiom takes its place.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::StateError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImportedFile {
    pub imported_at: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub imported_files: HashMap<String, ImportedFile>,
    #[serde(default)]
    pub high_water_mark: i64,
}

impl State {
    /// A file is already imported iff it was imported at or after its
    /// current mtime — an mtime bump (the file changed) makes it eligible
    /// for reprocessing again.
    pub fn is_imported(&self, full_path: &str, mtime_epoch: i64) -> bool {
        self.imported_files
            .get(full_path)
            .map(|f| f.imported_at >= mtime_epoch)
            .unwrap_or(false)
    }

    pub fn mark_imported(&mut self, full_path: &str, imported_at_epoch: i64) {
        self.imported_files.insert(
            full_path.to_string(),
            ImportedFile {
                imported_at: imported_at_epoch,
            },
        );
        self.high_water_mark = self.high_water_mark.max(imported_at_epoch);
    }
}

pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Loads `state_file`, migrating relative keys to absolute where the
    /// corresponding file still exists under the watcher's `logs_dir`. A
    /// missing file is treated as empty state (first run); a corrupt file
    /// is reset to empty state rather than aborting the watcher.
    pub fn load(&self, logs_dir: &Path) -> Result<State, StateError> {
        if !self.path.exists() {
            return Ok(State::default());
        }

        let raw = std::fs::read_to_string(&self.path)?;
        let mut state: State = match serde_json::from_str(&raw) {
            Ok(s) => s,
            Err(e) => {
                warn!("state file {} is corrupt, resetting: {e}", self.path.display());
                return Err(StateError::Corrupt(e.to_string()));
            }
        };

        state.imported_files = migrate_relative_keys(state.imported_files, logs_dir);
        Ok(state)
    }

    /// Atomic write: serialize to `state_file.tmp`, fsync the file, rename
    /// over `state_file`, then best-effort fsync the parent directory (a
    /// no-op failure mode on platforms/filesystems that don't support it).
    pub fn save(&self, state: &State) -> Result<(), StateError> {
        let tmp_path = self.path.with_extension("tmp");

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        {
            let mut file = std::fs::File::create(&tmp_path)?;
            let json = serde_json::to_vec_pretty(state).map_err(|e| StateError::Corrupt(e.to_string()))?;
            file.write_all(&json)?;
            file.sync_all()?;
        }

        std::fs::rename(&tmp_path, &self.path)?;

        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = std::fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        Ok(())
    }
}

fn migrate_relative_keys(files: HashMap<String, ImportedFile>, logs_dir: &Path) -> HashMap<String, ImportedFile> {
    files
        .into_iter()
        .map(|(key, value)| {
            if Path::new(&key).is_absolute() {
                (key, value)
            } else {
                let candidate = logs_dir.join(&key);
                if candidate.exists() {
                    (candidate.to_string_lossy().into_owned(), value)
                } else {
                    (key, value)
                }
            }
        })
        .collect()
}

pub fn epoch_secs(time: SystemTime) -> i64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trips_state_through_save_and_load() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let mut state = State::default();
        state.mark_imported("/logs/a.jsonl", 100);

        store.save(&state).unwrap();
        let loaded = store.load(dir.path()).unwrap();

        assert!(loaded.is_imported("/logs/a.jsonl", 100));
        assert!(loaded.is_imported("/logs/a.jsonl", 50));
        assert!(!loaded.is_imported("/logs/a.jsonl", 150));
    }

    #[test]
    fn missing_state_file_loads_as_empty() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("nonexistent.json"));
        let state = store.load(dir.path()).unwrap();
        assert!(state.imported_files.is_empty());
    }

    #[test]
    fn corrupt_state_file_is_reported_as_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"not valid json").unwrap();
        let store = StateStore::new(path);
        assert!(matches!(store.load(dir.path()), Err(StateError::Corrupt(_))));
    }

    #[test]
    fn high_water_mark_tracks_the_latest_import() {
        let mut state = State::default();
        state.mark_imported("/logs/a.jsonl", 100);
        state.mark_imported("/logs/b.jsonl", 50);
        assert_eq!(state.high_water_mark, 100);
    }

    #[test]
    fn relative_keys_are_migrated_to_absolute_when_file_exists() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.jsonl"), b"{}").unwrap();

        let mut files = HashMap::new();
        files.insert("a.jsonl".to_string(), ImportedFile { imported_at: 1 });

        let migrated = migrate_relative_keys(files, dir.path());
        let expected = dir.path().join("a.jsonl").to_string_lossy().into_owned();
        assert!(migrated.contains_key(&expected));
    }
}
