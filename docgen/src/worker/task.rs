//! In-process worker units backed by tokio tasks.
//!
//! Each unit runs the renderer on its own task and replies over a oneshot
//! channel; it shares nothing with the coordinator. Termination aborts the
//! task, and a renderer panic surfaces as a crash.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{
    LiveUnitGuard, LiveUnits, WorkerLauncher, WorkerOutcome, WorkerReply, WorkerRequest,
    WorkerUnit, panic_message,
};
use crate::render::Renderer;

/// Launches units that render on tokio tasks.
pub struct TaskLauncher {
    renderer: Arc<dyn Renderer>,
    live: LiveUnits,
}

impl TaskLauncher {
    pub fn new(renderer: Arc<dyn Renderer>) -> Self {
        Self {
            renderer,
            live: LiveUnits::default(),
        }
    }
}

impl WorkerLauncher for TaskLauncher {
    fn launch(&self, job_id: &str, request: WorkerRequest) -> crate::Result<Box<dyn WorkerUnit>> {
        let renderer = self.renderer.clone();
        let (reply_tx, reply_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let reply = match renderer.render(&request.record).await {
                Ok(bytes) => WorkerReply::Success(bytes),
                Err(e) => WorkerReply::Failure(e.to_string()),
            };
            let _ = reply_tx.send(reply);
        });

        debug!(job_id, "Spawned task worker");

        Ok(Box::new(TaskUnit {
            handle: Some(handle),
            reply: reply_rx,
            guard: Some(self.live.acquire()),
        }))
    }

    fn live_units(&self) -> usize {
        self.live.count()
    }

    fn name(&self) -> &'static str {
        "task"
    }
}

struct TaskUnit {
    handle: Option<JoinHandle<()>>,
    reply: oneshot::Receiver<WorkerReply>,
    guard: Option<LiveUnitGuard>,
}

#[async_trait]
impl WorkerUnit for TaskUnit {
    async fn wait(&mut self) -> WorkerOutcome {
        match (&mut self.reply).await {
            Ok(reply) => reply.into(),
            // The sender only drops without a reply when the task died.
            Err(_) => match self.handle.as_mut() {
                Some(handle) => {
                    let joined = handle.await;
                    self.handle = None;
                    match joined {
                        Err(e) if e.is_panic() => {
                            let payload = e.into_panic();
                            WorkerOutcome::Crashed(format!(
                                "worker crashed: {}",
                                panic_message(payload.as_ref())
                            ))
                        }
                        Err(e) => WorkerOutcome::Crashed(format!("worker crashed: {}", e)),
                        Ok(()) => WorkerOutcome::Crashed("worker exited before responding".to_string()),
                    }
                }
                None => WorkerOutcome::Crashed("worker exited before responding".to_string()),
            },
        }
    }

    async fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            // Join so the task is really gone before the unit counts as released.
            let _ = handle.await;
        }
        self.guard.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::RenderError;
    use bytes::Bytes;
    use serde_json::{Value, json};

    struct EchoRenderer;

    #[async_trait]
    impl Renderer for EchoRenderer {
        async fn render(&self, record: &Value) -> Result<Bytes, RenderError> {
            match record["mode"].as_str() {
                Some("fail") => Err(RenderError::new("no template for record")),
                Some("panic") => panic!("renderer blew up"),
                Some("hang") => std::future::pending().await,
                _ => Ok(Bytes::from(record.to_string())),
            }
        }
    }

    fn launcher() -> TaskLauncher {
        TaskLauncher::new(Arc::new(EchoRenderer))
    }

    async fn run(launcher: &TaskLauncher, record: Value) -> WorkerOutcome {
        let mut unit = launcher.launch("job", WorkerRequest::new(record)).unwrap();
        let outcome = unit.wait().await;
        unit.release().await;
        outcome
    }

    #[tokio::test]
    async fn test_success_and_failure_replies() {
        let launcher = launcher();

        let outcome = run(&launcher, json!({"mode": "ok"})).await;
        assert_eq!(outcome, WorkerOutcome::Success(Bytes::from(r#"{"mode":"ok"}"#)));

        let outcome = run(&launcher, json!({"mode": "fail"})).await;
        assert_eq!(outcome, WorkerOutcome::Failure("no template for record".to_string()));

        assert_eq!(launcher.live_units(), 0);
    }

    #[tokio::test]
    async fn test_panic_is_a_crash() {
        let launcher = launcher();
        let outcome = run(&launcher, json!({"mode": "panic"})).await;
        assert_eq!(
            outcome,
            WorkerOutcome::Crashed("worker crashed: renderer blew up".to_string())
        );
        assert_eq!(launcher.live_units(), 0);
    }

    #[tokio::test]
    async fn test_release_aborts_hung_unit() {
        let launcher = launcher();
        let mut unit = launcher
            .launch("job", WorkerRequest::new(json!({"mode": "hang"})))
            .unwrap();
        assert_eq!(launcher.live_units(), 1);

        let waited = tokio::time::timeout(std::time::Duration::from_millis(20), unit.wait()).await;
        assert!(waited.is_err());

        unit.release().await;
        assert_eq!(launcher.live_units(), 0);
    }
}
