//! Worker units: isolated execution contexts that render exactly one job.
//!
//! A [`WorkerLauncher`] spawns one [`WorkerUnit`] per dispatched job. The
//! coordinator never touches a unit directly; [`supervise`] drives it to a
//! terminal [`WorkerOutcome`] under the render timeout and releases it
//! exactly once, whatever happened.

mod entry;
mod process;
mod protocol;
mod task;

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

pub use entry::{handle_request, serve, serve_stdio};
pub use process::ProcessLauncher;
pub use protocol::{WorkerReply, WorkerRequest};
pub use task::TaskLauncher;

/// Error message recorded for replies that do not match the protocol.
pub const MALFORMED_RESPONSE: &str = "worker response malformed";

/// Terminal outcome of a worker unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// The unit rendered the document.
    Success(Bytes),
    /// The renderer reported an error.
    Failure(String),
    /// The unit replied with something that is not a valid reply.
    Malformed,
    /// The unit exited or crashed before replying.
    Crashed(String),
    /// No reply arrived within the render timeout.
    TimedOut(Duration),
    /// The unit could not be started.
    SpawnFailed(String),
    /// The engine shut down while the unit was running.
    Cancelled,
}

impl WorkerOutcome {
    /// The message recorded on the job when this outcome is a failure.
    pub fn failure_message(&self) -> Option<String> {
        match self {
            WorkerOutcome::Success(_) => None,
            WorkerOutcome::Failure(error) => Some(error.clone()),
            WorkerOutcome::Malformed => Some(MALFORMED_RESPONSE.to_string()),
            WorkerOutcome::Crashed(reason) => Some(reason.clone()),
            WorkerOutcome::TimedOut(timeout) => {
                Some(format!("render timed out after {}", format_timeout(*timeout)))
            }
            WorkerOutcome::SpawnFailed(reason) => Some(format!("failed to start worker: {}", reason)),
            WorkerOutcome::Cancelled => Some("render cancelled: engine shutting down".to_string()),
        }
    }

    /// Split into the payload or the failure message.
    pub fn into_result(self) -> std::result::Result<Bytes, String> {
        match self {
            WorkerOutcome::Success(bytes) => Ok(bytes),
            other => Err(other.failure_message().unwrap_or_default()),
        }
    }

    /// Short label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerOutcome::Success(_) => "success",
            WorkerOutcome::Failure(_) => "failure",
            WorkerOutcome::Malformed => "malformed",
            WorkerOutcome::Crashed(_) => "crashed",
            WorkerOutcome::TimedOut(_) => "timeout",
            WorkerOutcome::SpawnFailed(_) => "spawn_failed",
            WorkerOutcome::Cancelled => "cancelled",
        }
    }
}

impl From<WorkerReply> for WorkerOutcome {
    fn from(reply: WorkerReply) -> Self {
        match reply {
            WorkerReply::Success(bytes) => WorkerOutcome::Success(bytes),
            WorkerReply::Failure(error) => WorkerOutcome::Failure(error),
        }
    }
}

fn format_timeout(timeout: Duration) -> String {
    if timeout >= Duration::from_secs(1) && timeout.subsec_millis() == 0 {
        format!("{}s", timeout.as_secs())
    } else {
        format!("{}ms", timeout.as_millis())
    }
}

/// A running worker unit.
#[async_trait]
pub trait WorkerUnit: Send {
    /// Wait for the unit's terminal message, or for it to exit without one.
    ///
    /// The future may be dropped before completion (timeout, shutdown); the
    /// unit must stay releasable afterwards.
    async fn wait(&mut self) -> WorkerOutcome;

    /// Terminate the unit if it is still alive and free its resources.
    ///
    /// Tolerates units that already exited.
    async fn release(&mut self);
}

/// Spawns worker units.
pub trait WorkerLauncher: Send + Sync {
    /// Start a unit rendering `request` for job `job_id`.
    fn launch(&self, job_id: &str, request: WorkerRequest) -> crate::Result<Box<dyn WorkerUnit>>;

    /// Units spawned but not yet released.
    fn live_units(&self) -> usize;

    fn name(&self) -> &'static str;
}

/// Drive a unit to its terminal outcome and release it.
///
/// The timeout is disarmed as soon as the unit replies or exits. On timeout or
/// cancellation the unit is terminated.
pub async fn supervise(
    mut unit: Box<dyn WorkerUnit>,
    timeout: Duration,
    cancellation_token: CancellationToken,
) -> WorkerOutcome {
    let outcome = tokio::select! {
        result = tokio::time::timeout(timeout, unit.wait()) => match result {
            Ok(outcome) => outcome,
            Err(_) => WorkerOutcome::TimedOut(timeout),
        },
        _ = cancellation_token.cancelled() => WorkerOutcome::Cancelled,
    };

    unit.release().await;
    outcome
}

/// Gauge of units that have been spawned and not yet released.
#[derive(Debug, Clone, Default)]
pub struct LiveUnits(Arc<AtomicUsize>);

impl LiveUnits {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn acquire(&self) -> LiveUnitGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        LiveUnitGuard(self.0.clone())
    }
}

/// Decrements the gauge when dropped.
#[derive(Debug)]
struct LiveUnitGuard(Arc<AtomicUsize>);

impl Drop for LiveUnitGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
