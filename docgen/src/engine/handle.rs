//! Caller-facing handle to the engine coordinator.

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};

use super::EngineStats;
use super::job::{ArtifactMeta, JobArtifact, JobEvent, JobKey, JobSnapshot};
use crate::{Error, Result};

/// Requests processed by the coordinator.
#[derive(Debug)]
pub(crate) enum EngineMessage {
    StartJob {
        key: JobKey,
        record: Value,
        meta: ArtifactMeta,
        reply: oneshot::Sender<JobSnapshot>,
    },
    GetStatus {
        id: String,
        reply: oneshot::Sender<Option<JobSnapshot>>,
    },
    GetResult {
        id: String,
        reply: oneshot::Sender<Result<JobArtifact>>,
    },
    Stats {
        reply: oneshot::Sender<EngineStats>,
    },
}

/// Cloneable handle to a running [`super::JobEngine`].
#[derive(Debug, Clone)]
pub struct EngineHandle {
    sender: mpsc::Sender<EngineMessage>,
    events: broadcast::Sender<JobEvent>,
}

impl EngineHandle {
    pub(crate) fn new(sender: mpsc::Sender<EngineMessage>, events: broadcast::Sender<JobEvent>) -> Self {
        Self { sender, events }
    }

    /// Submit a render request for `record` on behalf of `target`.
    ///
    /// Returns the existing job when an identical request is queued, running
    /// or completed; otherwise a new queued job. Never waits for rendering.
    pub async fn start_job(&self, target: &str, record: Value, meta: ArtifactMeta) -> Result<JobSnapshot> {
        let key = JobKey::derive(target, &record);
        self.start_job_with_key(key, record, meta).await
    }

    /// Submit a render request under a caller-computed deduplication key.
    pub async fn start_job_with_key(
        &self,
        key: JobKey,
        record: Value,
        meta: ArtifactMeta,
    ) -> Result<JobSnapshot> {
        self.request(|reply| EngineMessage::StartJob {
            key,
            record,
            meta,
            reply,
        })
        .await
    }

    /// Current snapshot of a job.
    pub async fn job_status(&self, id: &str) -> Result<JobSnapshot> {
        let id = id.to_string();
        self.request(|reply| EngineMessage::GetStatus {
            id: id.clone(),
            reply,
        })
        .await?
        .ok_or_else(|| Error::not_found(id))
    }

    /// Rendered artifact of a completed job.
    pub async fn job_result(&self, id: &str) -> Result<JobArtifact> {
        let id = id.to_string();
        self.request(|reply| EngineMessage::GetResult { id, reply })
            .await?
    }

    pub async fn stats(&self) -> Result<EngineStats> {
        self.request(|reply| EngineMessage::Stats { reply }).await
    }

    /// Subscribe to job lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Whether the coordinator has stopped.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> EngineMessage) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(build(reply_tx))
            .await
            .map_err(|_| Error::EngineStopped)?;
        reply_rx.await.map_err(|_| Error::EngineStopped)
    }
}
