//! Logging setup shared by the `docgen` and `docgen-worker` binaries.
//!
//! Console output always goes to stderr: the worker's stdout carries its
//! protocol reply and must stay clean.

use std::path::PathBuf;

use chrono::Local;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "docgen=info,process_utils=info";

/// Prefix of rolled log files inside the log directory.
pub const LOG_FILE_PREFIX: &str = "docgen.log";

/// Timer that formats timestamps in the host's local timezone.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Logging options, usually read from the environment.
#[derive(Debug, Clone, Default)]
pub struct LoggingOptions {
    /// Filter directive; `None` uses `RUST_LOG` or [`DEFAULT_LOG_FILTER`].
    pub filter: Option<String>,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Also write daily-rotated log files into this directory.
    pub log_dir: Option<PathBuf>,
}

impl LoggingOptions {
    /// Read `DOCGEN_LOG`, `DOCGEN_LOG_JSON` and `DOCGEN_LOG_DIR`.
    pub fn from_env() -> Self {
        let filter = std::env::var("DOCGEN_LOG").ok().filter(|s| !s.is_empty());

        let json = std::env::var("DOCGEN_LOG_JSON").ok().is_some_and(|v| {
            matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        });

        let log_dir = std::env::var_os("DOCGEN_LOG_DIR")
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);

        Self {
            filter,
            json,
            log_dir,
        }
    }

    fn env_filter(&self) -> crate::Result<EnvFilter> {
        match &self.filter {
            Some(directive) => EnvFilter::try_new(directive)
                .map_err(|e| crate::Error::config(format!("Invalid log filter: {}", e))),
            None => Ok(EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))),
        }
    }
}

/// Initialize the global subscriber.
///
/// Returns the file writer guard when file output is enabled; keep it alive
/// for the lifetime of the process or buffered lines are lost.
pub fn init_logging(options: &LoggingOptions) -> crate::Result<Option<WorkerGuard>> {
    let filter = options.env_filter()?;

    let (file_layer, guard) = match &options.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let json_layer = options.json.then(|| {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_timer(LocalTimer)
    });

    let console_layer = (!options.json).then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_timer(LocalTimer)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(json_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| crate::Error::Other(format!("Failed to set global default subscriber: {}", e)))?;

    Ok(guard)
}
