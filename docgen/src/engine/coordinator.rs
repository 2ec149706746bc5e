//! Engine coordinator: the single owner of job state and the worker pool.
//!
//! Every registry mutation happens on this task. Worker units run in a
//! `JoinSet` of supervisor tasks and report back over the completion
//! channel; the coordinator frees the slot, records the outcome and pumps
//! the queue again.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::EngineStats;
use super::handle::EngineMessage;
use super::job::{JobEvent, JobStatus};
use super::registry::{Admission, JobRegistry};
use super::sweeper::ExpirySweeper;
use crate::config::EngineConfig;
use crate::worker::{WorkerLauncher, WorkerOutcome, WorkerRequest, panic_message, supervise};

/// Terminal outcome reported by a supervisor task.
#[derive(Debug)]
struct Completion {
    job_id: String,
    outcome: WorkerOutcome,
}

pub(super) struct Coordinator {
    config: EngineConfig,
    launcher: Arc<dyn WorkerLauncher>,
    registry: JobRegistry,
    mailbox: mpsc::Receiver<EngineMessage>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    workers: JoinSet<()>,
    /// Jobs holding a worker slot, with their dispatch time.
    in_flight: HashMap<String, Instant>,
    events: broadcast::Sender<JobEvent>,
    cancellation_token: CancellationToken,
}

impl Coordinator {
    pub(super) fn new(
        config: EngineConfig,
        launcher: Arc<dyn WorkerLauncher>,
        mailbox: mpsc::Receiver<EngineMessage>,
        events: broadcast::Sender<JobEvent>,
        cancellation_token: CancellationToken,
    ) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            registry: JobRegistry::new(config.retention),
            config,
            launcher,
            mailbox,
            completions_tx,
            completions_rx,
            workers: JoinSet::new(),
            in_flight: HashMap::new(),
            events,
            cancellation_token,
        }
    }

    pub(super) async fn run(mut self) {
        let mut sweeper = ExpirySweeper::new(self.config.sweep_interval);
        debug!(
            sweep_interval_ms = sweeper.period().as_millis() as u64,
            "Job engine coordinator started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.cancellation_token.cancelled() => {
                    info!("Job engine coordinator cancelled");
                    break;
                }

                // Completions first so freed slots are reused before new
                // admissions are queued behind them.
                Some(completion) = self.completions_rx.recv() => {
                    self.handle_completion(completion);
                }

                message = self.mailbox.recv() => match message {
                    Some(message) => self.handle_message(message),
                    None => {
                        debug!("All engine handles dropped, stopping coordinator");
                        break;
                    }
                },

                _ = sweeper.tick() => {
                    self.sweep("interval");
                }

                Some(joined) = self.workers.join_next() => {
                    if let Err(e) = joined {
                        warn!("Worker supervisor task ended abnormally: {}", e);
                    }
                }
            }
        }

        self.shutdown().await;
    }

    fn handle_message(&mut self, message: EngineMessage) {
        match message {
            EngineMessage::StartJob {
                key,
                record,
                meta,
                reply,
            } => {
                self.sweep("admission");
                match self.registry.admit(key, meta, record, Utc::now()) {
                    Admission::Created(snapshot) => {
                        info!(job_id = %snapshot.id, key = %snapshot.key, "Queued job");
                        let _ = self.events.send(JobEvent::Queued {
                            job_id: snapshot.id.clone(),
                            key: snapshot.key.clone(),
                        });
                        let _ = reply.send(snapshot);
                        self.pump();
                    }
                    Admission::Existing(snapshot) => {
                        debug!(
                            job_id = %snapshot.id,
                            status = %snapshot.status,
                            "Deduplicated job request"
                        );
                        let _ = reply.send(snapshot);
                    }
                }
            }
            EngineMessage::GetStatus { id, reply } => {
                self.sweep("lookup");
                let _ = reply.send(self.registry.get(&id, Utc::now()));
            }
            EngineMessage::GetResult { id, reply } => {
                self.sweep("lookup");
                let _ = reply.send(self.registry.result(&id, Utc::now()));
            }
            EngineMessage::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn stats(&self) -> EngineStats {
        EngineStats {
            max_workers: self.config.max_workers,
            active_workers: self.in_flight.len(),
            ..self.registry.stats()
        }
    }

    /// Dispatch queued jobs while worker slots are free.
    fn pump(&mut self) {
        while self.in_flight.len() < self.config.max_workers {
            let Some((job_id, record)) = self.registry.pop_queued() else {
                break;
            };
            self.dispatch(job_id, record);
        }
    }

    fn dispatch(&mut self, job_id: String, record: Value) {
        if let Err(e) = self
            .registry
            .transition(&job_id, JobStatus::Running, None, Utc::now())
        {
            warn!(job_id = %job_id, "Failed to start job: {}", e);
            return;
        }

        self.in_flight.insert(job_id.clone(), Instant::now());
        let _ = self.events.send(JobEvent::Started {
            job_id: job_id.clone(),
        });
        info!(
            job_id = %job_id,
            active_workers = self.in_flight.len(),
            max_workers = self.config.max_workers,
            "Dispatching job"
        );

        let unit = match self.launcher.launch(&job_id, WorkerRequest::new(record)) {
            Ok(unit) => unit,
            Err(e) => {
                // Reported like any other outcome so the slot is freed from
                // the main loop rather than re-entering pump() from here.
                let _ = self.completions_tx.send(Completion {
                    job_id,
                    outcome: WorkerOutcome::SpawnFailed(e.to_string()),
                });
                return;
            }
        };

        let timeout = self.config.render_timeout;
        let token = self.cancellation_token.child_token();
        let completions = self.completions_tx.clone();
        self.workers.spawn(async move {
            let outcome = AssertUnwindSafe(supervise(unit, timeout, token))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    WorkerOutcome::Crashed(format!(
                        "worker crashed: {}",
                        panic_message(payload.as_ref())
                    ))
                });
            let _ = completions.send(Completion { job_id, outcome });
        });
    }

    fn handle_completion(&mut self, completion: Completion) {
        let elapsed = self
            .in_flight
            .remove(&completion.job_id)
            .map(|started| started.elapsed())
            .unwrap_or_default();
        self.record_outcome(completion, elapsed);
        self.pump();
    }

    fn record_outcome(&mut self, completion: Completion, elapsed: Duration) {
        let Completion { job_id, outcome } = completion;
        let kind = outcome.kind();
        let now = Utc::now();

        match outcome.into_result() {
            Ok(bytes) => {
                let size = bytes.len();
                match self.registry.complete(&job_id, bytes, now) {
                    Ok(_) => {
                        info!(
                            job_id = %job_id,
                            bytes = size,
                            duration_ms = elapsed.as_millis() as u64,
                            "Job completed"
                        );
                        let _ = self.events.send(JobEvent::Completed {
                            job_id,
                            bytes: size,
                            duration_secs: elapsed.as_secs_f64(),
                        });
                    }
                    Err(e) => warn!(job_id = %job_id, "Dropping render result: {}", e),
                }
            }
            Err(message) => match self.registry.fail(&job_id, message.clone(), now) {
                Ok(_) => {
                    warn!(
                        job_id = %job_id,
                        outcome = kind,
                        duration_ms = elapsed.as_millis() as u64,
                        "Job failed: {}",
                        message
                    );
                    let _ = self.events.send(JobEvent::Failed {
                        job_id,
                        error: message,
                    });
                }
                Err(e) => warn!(job_id = %job_id, "Dropping worker failure: {}", e),
            },
        }
    }

    fn sweep(&mut self, trigger: &'static str) {
        let report = ExpirySweeper::sweep(&mut self.registry, Utc::now(), trigger);
        for job_id in report.evicted {
            let _ = self.events.send(JobEvent::Evicted { job_id });
        }
    }

    /// Terminate every unit, record their outcomes and stop accepting work.
    ///
    /// Queued jobs are left queued; nothing is dispatched after cancellation.
    async fn shutdown(mut self) {
        self.cancellation_token.cancel();
        self.mailbox.close();

        let in_flight = self.in_flight.len();
        while let Some(joined) = self.workers.join_next().await {
            if let Err(e) = joined {
                warn!("Worker supervisor task ended abnormally: {}", e);
            }
        }
        while let Ok(completion) = self.completions_rx.try_recv() {
            let elapsed = self
                .in_flight
                .remove(&completion.job_id)
                .map(|started| started.elapsed())
                .unwrap_or_default();
            self.record_outcome(completion, elapsed);
        }

        info!(
            terminated = in_flight,
            queued = self.registry.queue_depth(),
            live_units = self.launcher.live_units(),
            "Job engine coordinator stopped"
        );
    }
}
