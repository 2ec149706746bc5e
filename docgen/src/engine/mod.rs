//! Job engine.
//!
//! The engine is a single coordinator task that owns the job registry, the
//! dispatch queue and the worker pool. Callers talk to it through a cloneable
//! [`EngineHandle`]; worker units report back over a completion channel. All
//! state mutation happens on the coordinator, so no locks are involved.
//!
//! ```text
//! EngineHandle ──mailbox──▶ Coordinator ──launch──▶ WorkerUnit (supervised)
//!       ▲                       │  ▲                       │
//!       └────── oneshot ────────┘  └────── completion ─────┘
//! ```

mod coordinator;
mod handle;
mod job;
mod registry;
mod sweeper;

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::worker::WorkerLauncher;

pub use handle::EngineHandle;
pub use job::{
    ArtifactMeta, JobArtifact, JobEvent, JobKey, JobSnapshot, JobStatus, PDF_CONTENT_TYPE,
    fingerprint,
};
pub use registry::{Admission, JobRegistry};
pub use sweeper::{ExpirySweeper, SweepReport};

use coordinator::Coordinator;

/// Capacity of the job event broadcast channel.
pub const EVENT_CAPACITY: usize = 256;

/// Point-in-time engine counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Configured pool size.
    pub max_workers: usize,
    /// Worker units currently running.
    pub active_workers: usize,
    /// Ids waiting in the dispatch queue.
    pub queue_depth: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    /// Bytes held by completed payloads.
    pub payload_bytes: usize,
}

/// A running job engine.
///
/// Dropping the engine cancels the coordinator; prefer [`JobEngine::shutdown`]
/// to also wait for worker units to be released.
pub struct JobEngine {
    handle: EngineHandle,
    cancellation_token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl JobEngine {
    /// Start the coordinator on the current tokio runtime.
    pub fn start(config: EngineConfig, launcher: Arc<dyn WorkerLauncher>) -> Self {
        let max_workers = config.max_workers;
        let config = config.with_max_workers(max_workers);
        let (mailbox_tx, mailbox_rx) = mpsc::channel(config.mailbox_capacity.max(1));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let cancellation_token = CancellationToken::new();

        info!(
            max_workers = config.max_workers,
            retention_secs = config.retention.as_secs(),
            render_timeout_secs = config.render_timeout.as_secs(),
            launcher = launcher.name(),
            "Starting job engine"
        );

        let coordinator = Coordinator::new(
            config,
            launcher,
            mailbox_rx,
            events.clone(),
            cancellation_token.clone(),
        );
        let task = tokio::spawn(coordinator.run());

        Self {
            handle: EngineHandle::new(mailbox_tx, events),
            cancellation_token,
            task: Some(task),
        }
    }

    /// A handle for submitting and querying jobs.
    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Stop the coordinator and wait until every worker unit is released.
    ///
    /// Running jobs fail with a cancellation message; later requests on any
    /// handle return [`crate::Error::EngineStopped`].
    pub async fn shutdown(mut self) {
        self.cancellation_token.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!("Job engine coordinator ended abnormally: {}", e);
        }
        debug!("Job engine stopped");
    }
}

impl Drop for JobEngine {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}
