//! Environment-driven configuration.
//!
//! There is no config file: every knob in this module is read from an
//! environment variable with `std::env::var(...).ok().and_then(|v|
//! v.parse().ok()).unwrap_or(default)`, and out-of-range values are clamped
//! to a documented safe range with a warning rather than rejected outright
//! (see the Config-invalid error kind).

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

#[derive(Debug, Clone)]
pub struct Config {
    pub qdrant_url: String,
    pub voyage_api_key: Option<String>,
    pub prefer_local_embeddings: bool,
    pub embedding_model: String,
    pub logs_dir: PathBuf,
    pub state_file: PathBuf,

    pub import_frequency: Duration,
    pub hot_check_interval: Duration,
    pub batch_size: usize,

    pub memory_limit_mb: u64,
    pub memory_warning_mb: u64,
    pub max_cpu_percent_per_core: f32,

    pub max_concurrent_embeddings: usize,
    pub max_concurrent_qdrant: usize,

    pub max_queue_size: usize,
    pub max_backlog_hours: u64,

    pub hot_window_minutes: i64,
    pub warm_window_hours: i64,
    pub max_cold_files: usize,
    pub max_warm_wait_minutes: i64,

    pub qdrant_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,

    pub enable_memory_decay: bool,
    pub use_native_decay: bool,
    pub decay_weight: f64,
    pub decay_scale_days: f64,

    pub effective_cores_override: Option<usize>,
    pub listen_addr: String,
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

/// Clamps `value` into `[min, max]`, logging a warning naming the offending
/// environment variable when a clamp actually changes the value.
fn clamp_u64(key: &str, value: u64, min: u64, max: u64) -> u64 {
    let clamped = value.clamp(min, max);
    if clamped != value {
        warn!("{key}={value} out of range [{min}, {max}], clamped to {clamped}");
    }
    clamped
}

impl Config {
    pub fn from_env() -> Self {
        let home = dirs_home();
        let default_logs_dir = home.join(".claude").join("projects");
        let default_state_file = home.join(".csr").join("csr-watcher.json");

        let memory_limit_mb = clamp_u64("MEMORY_LIMIT_MB", env_parsed("MEMORY_LIMIT_MB", 1024), 128, 16384);
        let memory_warning_mb = clamp_u64(
            "MEMORY_WARNING_MB",
            env_parsed("MEMORY_WARNING_MB", 768),
            64,
            memory_limit_mb,
        );
        let batch_size = clamp_u64("BATCH_SIZE", env_parsed::<u64>("BATCH_SIZE", 10), 1, 1000) as usize;
        let max_queue_size =
            clamp_u64("MAX_QUEUE_SIZE", env_parsed::<u64>("MAX_QUEUE_SIZE", 100), 1, 100_000) as usize;

        Config {
            qdrant_url: env_string("QDRANT_URL", "http://localhost:6333"),
            voyage_api_key: std::env::var("VOYAGE_API_KEY")
                .ok()
                .or_else(|| std::env::var("VOYAGE_KEY").ok()),
            prefer_local_embeddings: env_bool("PREFER_LOCAL_EMBEDDINGS", true),
            embedding_model: env_string("EMBEDDING_MODEL", "sentence-transformers/all-MiniLM-L6-v2"),
            logs_dir: std::env::var("LOGS_DIR")
                .map(PathBuf::from)
                .unwrap_or(default_logs_dir),
            state_file: std::env::var("STATE_FILE")
                .map(PathBuf::from)
                .unwrap_or(default_state_file),

            import_frequency: Duration::from_secs(env_parsed("IMPORT_FREQUENCY", 60)),
            hot_check_interval: Duration::from_secs(env_parsed("HOT_CHECK_INTERVAL_S", 2)),
            batch_size,

            memory_limit_mb,
            memory_warning_mb,
            max_cpu_percent_per_core: env_parsed("MAX_CPU_PERCENT_PER_CORE", 80.0),

            max_concurrent_embeddings: env_parsed("MAX_CONCURRENT_EMBEDDINGS", 2),
            max_concurrent_qdrant: env_parsed("MAX_CONCURRENT_QDRANT", 3),

            max_queue_size,
            max_backlog_hours: env_parsed("MAX_BACKLOG_HOURS", 4),

            hot_window_minutes: env_parsed("HOT_WINDOW_MINUTES", 5),
            warm_window_hours: env_parsed("WARM_WINDOW_HOURS", 24),
            max_cold_files: env_parsed("MAX_COLD_FILES", 5),
            max_warm_wait_minutes: env_parsed("MAX_WARM_WAIT_MINUTES", 30),

            qdrant_timeout: Duration::from_secs(env_parsed("QDRANT_TIMEOUT", 10)),
            max_retries: env_parsed("MAX_RETRIES", 3),
            retry_delay: Duration::from_millis(env_parsed("RETRY_DELAY", 500)),

            enable_memory_decay: env_bool("ENABLE_MEMORY_DECAY", true),
            use_native_decay: env_bool("USE_NATIVE_DECAY", true),
            decay_weight: env_parsed("DECAY_WEIGHT", 0.3),
            decay_scale_days: env_parsed("DECAY_SCALE_DAYS", 90.0),

            effective_cores_override: std::env::var("EFFECTIVE_CORES").ok().and_then(|v| v.parse().ok()),
            listen_addr: env_string("LISTEN_ADDR", "127.0.0.1:8787"),
        }
    }

    pub fn decay_scale_ms(&self) -> f64 {
        self.decay_scale_days * 24.0 * 60.0 * 60.0 * 1000.0
    }
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_u64_leaves_in_range_values_untouched() {
        assert_eq!(clamp_u64("X", 500, 0, 1000), 500);
    }

    #[test]
    fn clamp_u64_clamps_above_max() {
        assert_eq!(clamp_u64("X", 5000, 0, 1000), 1000);
    }

    #[test]
    fn clamp_u64_clamps_below_min() {
        assert_eq!(clamp_u64("X", 1, 10, 1000), 10);
    }

    #[test]
    fn decay_scale_ms_matches_days_conversion() {
        let mut cfg = Config::from_env();
        cfg.decay_scale_days = 1.0;
        assert_eq!(cfg.decay_scale_ms(), 86_400_000.0);
    }
}
