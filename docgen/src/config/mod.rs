//! Engine configuration.
//!
//! All values come from the environment and fall back to documented defaults
//! when a variable is absent, unparsable, or not a positive integer.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Cores kept free for the host process when deriving the pool size.
pub const RESERVED_CORES: usize = 1;

/// Upper bound for an auto-derived pool size.
pub const MAX_AUTO_WORKERS: usize = 4;

/// Default retention after a job reaches a terminal state (10 minutes).
pub const DEFAULT_RETENTION_SECS: u64 = 600;

/// Default per-render timeout.
pub const DEFAULT_RENDER_TIMEOUT_SECS: u64 = 60;

/// Default expiry sweeper interval.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Default coordinator mailbox capacity.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;

/// Name of the worker executable looked up next to the current executable.
pub const WORKER_BINARY_NAME: &str = "docgen-worker";

/// Derive a pool size from the number of available cores.
///
/// One core stays with the host process; the result is at least one and at
/// most [`MAX_AUTO_WORKERS`].
pub fn derive_default_worker_count(available_cores: usize) -> usize {
    available_cores
        .saturating_sub(RESERVED_CORES)
        .clamp(1, MAX_AUTO_WORKERS)
}

/// Configuration for the job engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum concurrent worker units.
    pub max_workers: usize,
    /// How long terminal jobs and their payloads are kept.
    pub retention: Duration,
    /// Per-render timeout.
    pub render_timeout: Duration,
    /// Interval between expiry sweeps.
    pub sweep_interval: Duration,
    /// Coordinator mailbox capacity.
    pub mailbox_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: auto_worker_count(),
            retention: Duration::from_secs(DEFAULT_RETENTION_SECS),
            render_timeout: Duration::from_secs(DEFAULT_RENDER_TIMEOUT_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
        }
    }
}

impl EngineConfig {
    /// Create EngineConfig from environment variables.
    ///
    /// Environment variables:
    /// - `DOCGEN_MAX_WORKERS`: pool size (default: 0 = derive from host parallelism)
    /// - `DOCGEN_JOB_RETENTION_SECS`: retention after terminal state (default: 600)
    /// - `DOCGEN_RENDER_TIMEOUT_SECS`: per-render timeout (default: 60)
    /// - `DOCGEN_SWEEP_INTERVAL_SECS`: expiry sweep interval (default: 60)
    /// - `DOCGEN_MAILBOX_CAPACITY`: coordinator mailbox size (default: 256)
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let max_workers = positive(lookup("DOCGEN_MAX_WORKERS"))
            .map(|n| n as usize)
            .unwrap_or_else(auto_worker_count);

        let retention = positive(lookup("DOCGEN_JOB_RETENTION_SECS"))
            .unwrap_or(DEFAULT_RETENTION_SECS);

        let render_timeout = positive(lookup("DOCGEN_RENDER_TIMEOUT_SECS"))
            .unwrap_or(DEFAULT_RENDER_TIMEOUT_SECS);

        let sweep_interval = positive(lookup("DOCGEN_SWEEP_INTERVAL_SECS"))
            .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS);

        let mailbox_capacity = positive(lookup("DOCGEN_MAILBOX_CAPACITY"))
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAILBOX_CAPACITY);

        Self {
            max_workers,
            retention: Duration::from_secs(retention),
            render_timeout: Duration::from_secs(render_timeout),
            sweep_interval: Duration::from_secs(sweep_interval),
            mailbox_capacity,
        }
    }

    /// Set the pool size.
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    /// Set the retention window.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Set the render timeout.
    pub fn with_render_timeout(mut self, timeout: Duration) -> Self {
        self.render_timeout = timeout;
        self
    }

    /// Set the sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// Resolve the worker executable.
///
/// `DOCGEN_WORKER_PATH` wins; otherwise the worker binary is expected next to
/// the running executable, and finally on `PATH`.
pub fn worker_path_from_env() -> PathBuf {
    if let Some(path) = std::env::var_os("DOCGEN_WORKER_PATH").filter(|p| !p.is_empty()) {
        return PathBuf::from(path);
    }

    let file_name = format!("{}{}", WORKER_BINARY_NAME, std::env::consts::EXE_SUFFIX);
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(&file_name)))
        .filter(|candidate| candidate.is_file())
        .unwrap_or_else(|| PathBuf::from(file_name))
}

fn auto_worker_count() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    derive_default_worker_count(cores)
}

fn positive(value: Option<String>) -> Option<u64> {
    value
        .and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|n| *n > 0)
}
