//! Server and engine configuration.
//!
//! Follows the teacher's precedence (explicit override > config file >
//! built-in default) but folds "CLI" into "explicit builder call", since
//! `ripple` is a library, not the daemon binary it's grounded on.

use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use serde::Deserialize;

pub const DEFAULT_WORKER_POOL_SIZE: usize = 1_048_576;
pub const DEFAULT_WORKER_IDLE_EXPIRY: Duration = Duration::from_secs(10);
pub const DEFAULT_CONN_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_SWEEP_PERIOD: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_PAYLOAD_SIZE: u64 = 512 * 1024;
pub const DEFAULT_MAX_ERROR_COUNT: u32 = 3;

/// On-disk overrides, `{"server": {...}, "engine": {...}}` in TOML.
#[derive(Debug, Default, Deserialize)]
struct TomlConfig {
    server: Option<TomlServerSection>,
    engine: Option<TomlEngineSection>,
}

#[derive(Debug, Default, Deserialize)]
struct TomlServerSection {
    conn_timeout_secs: Option<u64>,
    worker_pool_size: Option<usize>,
    worker_idle_expiry_secs: Option<u64>,
    nonblocking: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct TomlEngineSection {
    max_payload_size: Option<u64>,
    max_error_count: Option<u32>,
}

fn load_toml(path: &Path) -> Option<TomlConfig> {
    let contents = std::fs::read_to_string(path).ok()?;
    match toml::from_str(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            tracing::warn!(path = %path.display(), err = %e, "failed to parse ripple config — using defaults");
            None
        }
    }
}

/// Worker-pool sizing knobs (spec.md §4.3 / §6 "WithWorkerPool").
#[derive(Debug, Clone)]
pub struct WorkerPoolOptions {
    pub size: usize,
    pub pre_alloc: bool,
    pub idle_expiry: Duration,
    pub nonblocking: bool,
}

impl Default for WorkerPoolOptions {
    fn default() -> Self {
        Self {
            size: DEFAULT_WORKER_POOL_SIZE,
            pre_alloc: false,
            idle_expiry: DEFAULT_WORKER_IDLE_EXPIRY,
            nonblocking: true,
        }
    }
}

/// Server-level configuration (spec.md §6 configuration surface).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub conn_timeout: Duration,
    pub sweep_period: Duration,
    pub worker_pool: WorkerPoolOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            conn_timeout: DEFAULT_CONN_TIMEOUT,
            sweep_period: DEFAULT_SWEEP_PERIOD,
            worker_pool: WorkerPoolOptions::default(),
        }
    }
}

impl ServerConfig {
    /// Merge overrides from a TOML file at `path`, if present and valid.
    /// Missing file or parse error silently falls back to the current
    /// values (teacher pattern: never panic on a bad config path).
    pub fn merge_toml_file(mut self, path: &Path) -> Self {
        if let Some(toml_cfg) = load_toml(path) {
            if let Some(s) = toml_cfg.server {
                if let Some(v) = s.conn_timeout_secs {
                    self.conn_timeout = Duration::from_secs(v);
                }
                if let Some(v) = s.worker_pool_size {
                    self.worker_pool.size = v;
                }
                if let Some(v) = s.worker_idle_expiry_secs {
                    self.worker_pool.idle_expiry = Duration::from_secs(v);
                }
                if let Some(v) = s.nonblocking {
                    self.worker_pool.nonblocking = v;
                }
            }
        }
        self
    }
}

/// Atomic, hot-swappable engine configuration (spec.md §3 `EngineConfig`).
///
/// Fields are plain atomics rather than an `ArcSwap<EngineConfigSnapshot>`
/// because there are exactly two scalar knobs and no cross-field
/// invariant between them — spec.md §9's own guidance ("a dedicated
/// atomic u32 ... is cleaner than a generic map") applies equally here.
#[derive(Debug)]
pub struct EngineConfig {
    max_payload_size: AtomicU64,
    max_error_count: AtomicU32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_payload_size: AtomicU64::new(DEFAULT_MAX_PAYLOAD_SIZE),
            max_error_count: AtomicU32::new(DEFAULT_MAX_ERROR_COUNT),
        }
    }
}

impl EngineConfig {
    pub fn new(max_payload_size: u64, max_error_count: u32) -> Self {
        Self {
            max_payload_size: AtomicU64::new(max_payload_size),
            max_error_count: AtomicU32::new(max_error_count),
        }
    }

    pub fn max_payload_size(&self) -> u64 {
        self.max_payload_size.load(Ordering::Relaxed)
    }

    pub fn set_max_payload_size(&self, bytes: u64) {
        self.max_payload_size.store(bytes, Ordering::Relaxed);
    }

    pub fn max_error_count(&self) -> u32 {
        self.max_error_count.load(Ordering::Relaxed)
    }

    pub fn set_max_error_count(&self, n: u32) {
        self.max_error_count.store(n, Ordering::Relaxed);
    }

    /// `true` if `len` meets or exceeds the configured limit. `0` disables
    /// the check (spec.md §3).
    pub fn payload_too_large(&self, len: usize) -> bool {
        let max = self.max_payload_size();
        max != 0 && len as u64 >= max
    }

    /// Merge overrides from a TOML file at `path`, if present and valid.
    pub fn merge_toml_file(self, path: &Path) -> Self {
        if let Some(toml_cfg) = load_toml(path) {
            if let Some(e) = toml_cfg.engine {
                if let Some(v) = e.max_payload_size {
                    self.set_max_payload_size(v);
                }
                if let Some(v) = e.max_error_count {
                    self.set_max_error_count(v);
                }
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_zero_disables_check() {
        let cfg = EngineConfig::new(0, 3);
        assert!(!cfg.payload_too_large(usize::MAX));
    }

    #[test]
    fn payload_boundary() {
        let cfg = EngineConfig::new(16, 3);
        assert!(!cfg.payload_too_large(15));
        assert!(cfg.payload_too_large(16));
    }

    #[test]
    fn toml_missing_file_keeps_defaults() {
        let cfg = ServerConfig::default().merge_toml_file(Path::new("/nonexistent/ripple.toml"));
        assert_eq!(cfg.conn_timeout, DEFAULT_CONN_TIMEOUT);
    }
}
