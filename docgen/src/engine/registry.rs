//! In-memory job registry with key-based deduplication.
//!
//! The registry owns every job record, the rendered payloads, the key index
//! and the dispatch queue. It is a plain synchronous structure: the
//! coordinator is its only owner, so no locking happens here, and every
//! time-dependent method takes `now` explicitly.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use super::job::{ArtifactMeta, JobArtifact, JobKey, JobSnapshot, JobStatus};
use super::sweeper::SweepReport;
use super::EngineStats;
use crate::{Error, Result};

/// Result of an admission.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// A new job was created and queued.
    Created(JobSnapshot),
    /// An existing live or completed job already covers the key.
    Existing(JobSnapshot),
}

impl Admission {
    pub fn snapshot(&self) -> &JobSnapshot {
        match self {
            Admission::Created(s) | Admission::Existing(s) => s,
        }
    }

    pub fn into_snapshot(self) -> JobSnapshot {
        match self {
            Admission::Created(s) | Admission::Existing(s) => s,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Admission::Created(_))
    }
}

/// A job record plus the source record it will be rendered from.
#[derive(Debug)]
struct JobEntry {
    snapshot: JobSnapshot,
    /// Taken when the job is dispatched.
    record: Option<Value>,
}

/// Registry of jobs, payloads, the key index and the dispatch queue.
#[derive(Debug)]
pub struct JobRegistry {
    jobs: HashMap<String, JobEntry>,
    keys: HashMap<JobKey, String>,
    payloads: HashMap<String, Bytes>,
    queue: VecDeque<String>,
    retention: TimeDelta,
}

impl JobRegistry {
    /// Create a registry keeping terminal jobs for `retention`.
    pub fn new(retention: Duration) -> Self {
        Self {
            jobs: HashMap::new(),
            keys: HashMap::new(),
            payloads: HashMap::new(),
            queue: VecDeque::new(),
            retention: TimeDelta::from_std(retention).unwrap_or(TimeDelta::MAX),
        }
    }

    /// Admit a render request.
    ///
    /// A key whose current job is queued, running or completed returns that
    /// job. A failed or unknown key gets a fresh queued job.
    pub fn admit(
        &mut self,
        key: JobKey,
        meta: ArtifactMeta,
        record: Value,
        now: DateTime<Utc>,
    ) -> Admission {
        self.sweep_expired(now);

        if let Some(existing) = self
            .keys
            .get(&key)
            .and_then(|id| self.jobs.get(id))
            .filter(|entry| entry.snapshot.status != JobStatus::Failed)
        {
            return Admission::Existing(existing.snapshot.clone());
        }

        let id = Uuid::new_v4().to_string();
        let snapshot = JobSnapshot {
            id: id.clone(),
            key: key.clone(),
            status: JobStatus::Queued,
            created_at: now,
            updated_at: now,
            result_meta: meta,
            error_message: None,
            expires_at: None,
        };

        self.jobs.insert(
            id.clone(),
            JobEntry {
                snapshot: snapshot.clone(),
                record: Some(record),
            },
        );
        self.keys.insert(key, id.clone());
        self.queue.push_back(id);

        Admission::Created(snapshot)
    }

    /// Look up a job.
    pub fn get(&mut self, id: &str, now: DateTime<Utc>) -> Option<JobSnapshot> {
        self.sweep_expired(now);
        self.jobs.get(id).map(|entry| entry.snapshot.clone())
    }

    /// Fetch the rendered artifact of a job.
    pub fn result(&mut self, id: &str, now: DateTime<Utc>) -> Result<JobArtifact> {
        self.sweep_expired(now);

        let entry = self.jobs.get(id).ok_or_else(|| Error::not_found(id))?;
        match entry.snapshot.status {
            JobStatus::Queued | JobStatus::Running => Err(Error::NotReady {
                id: id.to_string(),
                status: entry.snapshot.status,
            }),
            JobStatus::Failed => Err(Error::JobFailed {
                id: id.to_string(),
                reason: entry.snapshot.error_message.clone().unwrap_or_default(),
            }),
            JobStatus::Completed => {
                let bytes = self.payloads.get(id).cloned().ok_or_else(|| Error::not_found(id))?;
                Ok(JobArtifact {
                    job_id: id.to_string(),
                    bytes,
                    meta: entry.snapshot.result_meta.clone(),
                })
            }
        }
    }

    /// Pop the next queued job and hand out its source record.
    ///
    /// Ids whose job is gone or no longer queued are skipped.
    pub fn pop_queued(&mut self) -> Option<(String, Value)> {
        while let Some(id) = self.queue.pop_front() {
            match self.jobs.get_mut(&id) {
                Some(entry) if entry.snapshot.status == JobStatus::Queued => {
                    let record = entry.record.take().unwrap_or(Value::Null);
                    return Some((id, record));
                }
                Some(entry) => {
                    debug!(job_id = %id, status = %entry.snapshot.status, "Skipping dequeued job that is no longer queued");
                }
                None => {
                    debug!(job_id = %id, "Skipping dequeued job that no longer exists");
                }
            }
        }
        None
    }

    /// Move a job along the state machine.
    ///
    /// Terminal transitions stamp `expires_at`; `error_message` is only kept
    /// for failures.
    pub fn transition(
        &mut self,
        id: &str,
        next: JobStatus,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<JobSnapshot> {
        let retention = self.retention;
        let entry = self.jobs.get_mut(id).ok_or_else(|| Error::not_found(id))?;
        let current = entry.snapshot.status;

        if !current.can_transition_to(next) {
            warn!(job_id = %id, from = %current, to = %next, "Rejected invalid job transition");
            return Err(Error::InvalidStateTransition {
                from: current,
                to: next,
            });
        }

        let snapshot = &mut entry.snapshot;
        snapshot.status = next;
        snapshot.updated_at = now;
        if next == JobStatus::Failed {
            snapshot.error_message = Some(error_message.unwrap_or_else(|| "job failed".to_string()));
        }
        if next.is_terminal() {
            snapshot.expires_at = Some(
                now.checked_add_signed(retention)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC),
            );
            entry.record = None;
        }

        Ok(snapshot.clone())
    }

    /// Mark a running job completed and store its payload.
    pub fn complete(&mut self, id: &str, bytes: Bytes, now: DateTime<Utc>) -> Result<JobSnapshot> {
        let snapshot = self.transition(id, JobStatus::Completed, None, now)?;
        self.payloads.insert(id.to_string(), bytes);
        Ok(snapshot)
    }

    /// Mark a running job failed.
    pub fn fail(&mut self, id: &str, message: impl Into<String>, now: DateTime<Utc>) -> Result<JobSnapshot> {
        self.transition(id, JobStatus::Failed, Some(message.into()), now)
    }

    /// Remove every terminal job whose `expires_at` has passed.
    pub fn sweep_expired(&mut self, now: DateTime<Utc>) -> SweepReport {
        let expired: Vec<String> = self
            .jobs
            .iter()
            .filter(|(_, entry)| {
                entry.snapshot.status.is_terminal()
                    && entry.snapshot.expires_at.is_some_and(|at| at <= now)
            })
            .map(|(id, _)| id.clone())
            .collect();

        let mut report = SweepReport::default();
        for id in expired {
            let Some(entry) = self.jobs.remove(&id) else {
                continue;
            };
            if let Some(bytes) = self.payloads.remove(&id) {
                report.freed_bytes += bytes.len();
            }
            // A newer job may own the key by now.
            if self.keys.get(&entry.snapshot.key) == Some(&id) {
                self.keys.remove(&entry.snapshot.key);
            }
            report.evicted.push(id);
        }
        report
    }

    /// Number of ids waiting in the dispatch queue.
    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    /// Number of jobs currently held.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Counts per status and payload usage; worker fields are left at zero.
    pub fn stats(&self) -> EngineStats {
        let mut stats = EngineStats {
            queue_depth: self.queue.len(),
            payload_bytes: self.payloads.values().map(Bytes::len).sum(),
            ..Default::default()
        };
        for entry in self.jobs.values() {
            match entry.snapshot.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }
}
