//! Job data model: status, keys, snapshots and events.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Content type of rendered documents.
pub const PDF_CONTENT_TYPE: &str = "application/pdf";

/// Job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for a free worker slot.
    Queued,
    /// Owned by a worker unit.
    Running,
    /// Rendered; the payload is available until eviction.
    Completed,
    /// Render failed, timed out, or the worker crashed.
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Whether no further transitions can happen.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether the job is still waiting for or doing work.
    pub fn is_live(self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    /// Whether `next` is an edge of the job state machine.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name and content type of the artifact a job produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactMeta {
    pub name: String,
    pub content_type: String,
}

impl ArtifactMeta {
    pub fn new(name: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
        }
    }

    /// Metadata for a PDF document.
    pub fn pdf(name: impl Into<String>) -> Self {
        Self::new(name, PDF_CONTENT_TYPE)
    }
}

/// Deduplication identity of a job: target identity plus content fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobKey(String);

impl JobKey {
    /// Use a caller-computed key as is.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Derive the key for rendering `record` on behalf of `target`.
    pub fn derive(target: &str, record: &Value) -> Self {
        Self(format!("{}:{}", target, fingerprint(record)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// SHA-256 of the record's compact JSON form, hex encoded.
///
/// Object keys serialize in sorted order, so two records with the same
/// content always share a fingerprint.
pub fn fingerprint(record: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(record.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Immutable copy of a job's observable state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: String,
    pub key: JobKey,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub result_meta: ArtifactMeta,
    pub error_message: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl JobSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// A rendered document ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobArtifact {
    pub job_id: String,
    pub bytes: Bytes,
    pub meta: ArtifactMeta,
}

/// Lifecycle events broadcast by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// A new job was admitted.
    Queued { job_id: String, key: JobKey },
    /// A worker unit picked the job up.
    Started { job_id: String },
    /// The job rendered successfully.
    Completed {
        job_id: String,
        bytes: usize,
        duration_secs: f64,
    },
    /// The job failed.
    Failed { job_id: String, error: String },
    /// The job aged out and was removed.
    Evicted { job_id: String },
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::Queued { job_id, .. }
            | JobEvent::Started { job_id }
            | JobEvent::Completed { job_id, .. }
            | JobEvent::Failed { job_id, .. }
            | JobEvent::Evicted { job_id } => job_id,
        }
    }
}
