use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::TimeDelta;
use docgen::render::RenderError;
use docgen::{
    ArtifactMeta, EngineConfig, EngineHandle, Error, JobEngine, JobEvent, JobSnapshot, JobStatus,
    ProcessLauncher, Renderer, TaskLauncher, WorkerLauncher,
};
use serde_json::{Value, json};
use tokio::sync::{Semaphore, broadcast};

const PDF_MAGIC: [u8; 4] = [0x25, 0x50, 0x44, 0x46];

/// Renderer whose behaviour is picked by the record's `mode` field.
///
/// - `gated`: waits for a permit on `gate`, then succeeds
/// - `fail`: returns a render error
/// - `panic`: panics
/// - `hang`: never finishes
/// - anything else: succeeds immediately
struct ScriptedRenderer {
    gate: Semaphore,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl Default for ScriptedRenderer {
    fn default() -> Self {
        Self {
            gate: Semaphore::new(0),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Renderer for ScriptedRenderer {
    async fn render(&self, record: &Value) -> Result<Bytes, RenderError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = RunningGuard(&self.running);

        match record["mode"].as_str() {
            Some("gated") => {
                self.gate
                    .acquire()
                    .await
                    .map_err(|e| RenderError::new(e.to_string()))?
                    .forget();
            }
            Some("fail") => return Err(RenderError::new("no template for record")),
            Some("panic") => panic!("renderer blew up"),
            Some("hang") => std::future::pending::<()>().await,
            _ => {}
        }
        Ok(Bytes::from_static(&PDF_MAGIC))
    }
}

impl ScriptedRenderer {
    fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

fn config(max_workers: usize) -> EngineConfig {
    EngineConfig::default()
        .with_max_workers(max_workers)
        .with_render_timeout(Duration::from_secs(10))
        .with_retention(Duration::from_secs(60))
        .with_sweep_interval(Duration::from_secs(60))
}

fn task_engine(config: EngineConfig) -> (JobEngine, Arc<ScriptedRenderer>, Arc<TaskLauncher>) {
    let renderer = Arc::new(ScriptedRenderer::default());
    let launcher = Arc::new(TaskLauncher::new(renderer.clone()));
    let engine = JobEngine::start(config, launcher.clone());
    (engine, renderer, launcher)
}

fn pdf(name: &str) -> ArtifactMeta {
    ArtifactMeta::pdf(name)
}

async fn wait_for_status(handle: &EngineHandle, id: &str, status: JobStatus) -> JobSnapshot {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let snapshot = handle.job_status(id).await.unwrap();
        if snapshot.status == status {
            return snapshot;
        }
        assert!(
            !snapshot.is_terminal(),
            "job {} ended {} while waiting for {}: {:?}",
            id,
            snapshot.status,
            status,
            snapshot.error_message
        );
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {} stuck in {} waiting for {}",
            id,
            snapshot.status,
            status
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn next_event(events: &mut broadcast::Receiver<JobEvent>) -> JobEvent {
    tokio::time::timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("timed out waiting for job event")
        .expect("event channel closed")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_request_while_running_returns_existing_job() {
    let (engine, renderer, _launcher) = task_engine(config(1));
    let handle = engine.handle();
    let record = json!({"mode": "gated", "name": "h1"});

    let first = handle
        .start_job("x", record.clone(), pdf("a.pdf"))
        .await
        .unwrap();
    assert_eq!(first.status, JobStatus::Queued);
    assert!(first.expires_at.is_none());

    wait_for_status(&handle, &first.id, JobStatus::Running).await;

    let second = handle
        .start_job("x", record.clone(), pdf("a.pdf"))
        .await
        .unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.status, JobStatus::Running);

    renderer.gate.add_permits(1);
    let done = wait_for_status(&handle, &first.id, JobStatus::Completed).await;
    assert!(done.expires_at.is_some());

    let artifact = handle.job_result(&first.id).await.unwrap();
    assert_eq!(artifact.bytes.as_ref(), &PDF_MAGIC);
    assert_eq!(artifact.meta, pdf("a.pdf"));

    // Still deduplicated against the completed job.
    let third = handle.start_job("x", record, pdf("a.pdf")).await.unwrap();
    assert_eq!(third.id, first.id);
    assert_eq!(third.status, JobStatus::Completed);

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.payload_bytes, PDF_MAGIC.len());

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_different_target_or_record_is_a_new_job() {
    let (engine, _renderer, _launcher) = task_engine(config(2));
    let handle = engine.handle();

    let a = handle.start_job("x", json!({"v": 1}), pdf("a.pdf")).await.unwrap();
    let b = handle.start_job("y", json!({"v": 1}), pdf("a.pdf")).await.unwrap();
    let c = handle.start_job("x", json!({"v": 2}), pdf("a.pdf")).await.unwrap();

    assert_ne!(a.id, b.id);
    assert_ne!(a.id, c.id);
    assert_ne!(a.key, b.key);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_retry_after_failure_creates_new_job() {
    let (engine, _renderer, _launcher) = task_engine(config(1));
    let handle = engine.handle();
    let record = json!({"mode": "fail"});

    let first = handle.start_job("x", record.clone(), pdf("a.pdf")).await.unwrap();
    let failed = wait_for_status(&handle, &first.id, JobStatus::Failed).await;
    assert_eq!(failed.error_message.as_deref(), Some("no template for record"));

    match handle.job_result(&first.id).await {
        Err(Error::JobFailed { reason, .. }) => assert_eq!(reason, "no template for record"),
        other => panic!("unexpected result: {other:?}"),
    }

    let retry = handle.start_job("x", record, pdf("a.pdf")).await.unwrap();
    assert_ne!(retry.id, first.id);
    assert_eq!(retry.status, JobStatus::Queued);

    // The failed job stays observable until it is evicted.
    let old = handle.job_status(&first.id).await.unwrap();
    assert_eq!(old.status, JobStatus::Failed);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_job_and_not_ready() {
    let (engine, renderer, _launcher) = task_engine(config(1));
    let handle = engine.handle();

    assert!(matches!(
        handle.job_status("missing").await,
        Err(Error::NotFound { .. })
    ));
    assert!(matches!(
        handle.job_result("missing").await,
        Err(Error::NotFound { .. })
    ));

    let job = handle
        .start_job("x", json!({"mode": "gated"}), pdf("a.pdf"))
        .await
        .unwrap();
    wait_for_status(&handle, &job.id, JobStatus::Running).await;
    match handle.job_result(&job.id).await {
        Err(Error::NotReady { status, .. }) => assert_eq!(status, JobStatus::Running),
        other => panic!("unexpected result: {other:?}"),
    }

    renderer.gate.add_permits(1);
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_never_exceeds_max_workers() {
    let (engine, renderer, launcher) = task_engine(config(2));
    let handle = engine.handle();

    let mut ids = Vec::new();
    for i in 0..5 {
        let job = handle
            .start_job("x", json!({"mode": "gated", "n": i}), pdf("a.pdf"))
            .await
            .unwrap();
        ids.push(job.id);
    }

    wait_until(|| renderer.running() == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.max_workers, 2);
    assert_eq!(stats.active_workers, 2);
    assert_eq!(stats.running, 2);
    assert_eq!(stats.queued, 3);
    assert_eq!(launcher.live_units(), 2);

    renderer.gate.add_permits(5);
    for id in &ids {
        wait_for_status(&handle, id, JobStatus::Completed).await;
    }

    assert_eq!(renderer.peak(), 2);
    assert_eq!(launcher.live_units(), 0);
    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.active_workers, 0);
    assert_eq!(stats.completed, 5);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_saturated_jobs_dispatch_in_admission_order() {
    let (engine, renderer, _launcher) = task_engine(config(2));
    let handle = engine.handle();
    let mut events = handle.subscribe();

    let mut ids = Vec::new();
    for i in 0..7 {
        let job = handle
            .start_job("x", json!({"mode": "gated", "n": i}), pdf("a.pdf"))
            .await
            .unwrap();
        ids.push(job.id);
    }

    renderer.gate.add_permits(ids.len());

    let mut started = Vec::new();
    while started.len() < ids.len() {
        let event = next_event(&mut events).await;
        if matches!(event, JobEvent::Started { .. }) {
            started.push(event.job_id().to_string());
        }
    }

    assert_eq!(started, ids);

    for id in &ids {
        wait_for_status(&handle, id, JobStatus::Completed).await;
    }
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timeout_fails_job_and_releases_unit() {
    let config = config(1).with_render_timeout(Duration::from_millis(100));
    let (engine, _renderer, launcher) = task_engine(config);
    let handle = engine.handle();

    let hung = handle.start_job("x", json!({"mode": "hang"}), pdf("a.pdf")).await.unwrap();
    let next = handle.start_job("x", json!({"mode": "ok"}), pdf("b.pdf")).await.unwrap();

    let failed = wait_for_status(&handle, &hung.id, JobStatus::Failed).await;
    assert_eq!(
        failed.error_message.as_deref(),
        Some("render timed out after 100ms")
    );

    // The slot is reused by the next queued job.
    wait_for_status(&handle, &next.id, JobStatus::Completed).await;
    assert_eq!(launcher.live_units(), 0);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_terminal_jobs_are_evicted_after_retention() {
    let config = config(1)
        .with_retention(Duration::from_millis(300))
        .with_sweep_interval(Duration::from_millis(20));
    let (engine, _renderer, _launcher) = task_engine(config);
    let handle = engine.handle();
    let mut events = handle.subscribe();

    let job = handle.start_job("x", json!({"n": 1}), pdf("a.pdf")).await.unwrap();
    let done = wait_for_status(&handle, &job.id, JobStatus::Completed).await;
    assert_eq!(
        done.expires_at,
        Some(done.updated_at + TimeDelta::milliseconds(300))
    );

    // The interval sweep evicts without any lookup.
    loop {
        let event = next_event(&mut events).await;
        if matches!(event, JobEvent::Evicted { .. }) {
            assert_eq!(event.job_id(), job.id);
            break;
        }
    }

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.completed, 0);
    assert_eq!(stats.payload_bytes, 0);
    assert!(matches!(
        handle.job_status(&job.id).await,
        Err(Error::NotFound { .. })
    ));
    assert!(matches!(
        handle.job_result(&job.id).await,
        Err(Error::NotFound { .. })
    ));

    // The key is free again.
    let again = handle.start_job("x", json!({"n": 1}), pdf("a.pdf")).await.unwrap();
    assert_ne!(again.id, job.id);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panicking_renderer_fails_only_its_job() {
    let (engine, _renderer, launcher) = task_engine(config(2));
    let handle = engine.handle();

    let crashing = handle.start_job("x", json!({"mode": "panic"}), pdf("a.pdf")).await.unwrap();
    let sibling = handle.start_job("y", json!({"mode": "ok"}), pdf("b.pdf")).await.unwrap();

    let failed = wait_for_status(&handle, &crashing.id, JobStatus::Failed).await;
    assert_eq!(
        failed.error_message.as_deref(),
        Some("worker crashed: renderer blew up")
    );
    wait_for_status(&handle, &sibling.id, JobStatus::Completed).await;
    assert_eq!(launcher.live_units(), 0);

    // The engine keeps serving.
    let later = handle.start_job("z", json!({}), pdf("c.pdf")).await.unwrap();
    wait_for_status(&handle, &later.id, JobStatus::Completed).await;

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_spawn_failure_fails_job_and_frees_slot() {
    let launcher = Arc::new(ProcessLauncher::new("/nonexistent/docgen-worker"));
    let engine = JobEngine::start(config(1), launcher.clone());
    let handle = engine.handle();

    let a = handle.start_job("x", json!({"n": 1}), pdf("a.pdf")).await.unwrap();
    let b = handle.start_job("x", json!({"n": 2}), pdf("b.pdf")).await.unwrap();

    for id in [&a.id, &b.id] {
        let failed = wait_for_status(&handle, id, JobStatus::Failed).await;
        let message = failed.error_message.unwrap_or_default();
        assert!(
            message.starts_with("failed to start worker: "),
            "unexpected message: {message}"
        );
    }

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.active_workers, 0);
    assert_eq!(stats.failed, 2);
    assert_eq!(launcher.live_units(), 0);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_terminates_units_and_stops_handles() {
    let (engine, _renderer, launcher) = task_engine(config(1));
    let handle = engine.handle();
    let mut events = handle.subscribe();

    let job = handle.start_job("x", json!({"mode": "hang"}), pdf("a.pdf")).await.unwrap();
    wait_for_status(&handle, &job.id, JobStatus::Running).await;
    assert_eq!(launcher.live_units(), 1);

    engine.shutdown().await;
    assert_eq!(launcher.live_units(), 0);

    let mut failure = None;
    while let Ok(event) = events.try_recv() {
        if let JobEvent::Failed { job_id, error } = event {
            failure = Some((job_id, error));
        }
    }
    assert_eq!(
        failure,
        Some((job.id.clone(), "render cancelled: engine shutting down".to_string()))
    );

    assert!(handle.is_closed());
    assert!(matches!(
        handle.job_status(&job.id).await,
        Err(Error::EngineStopped)
    ));
    assert!(matches!(
        handle.start_job("x", json!({}), pdf("a.pdf")).await,
        Err(Error::EngineStopped)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_renders_with_worker_executable() {
    let launcher = Arc::new(ProcessLauncher::new(env!("CARGO_BIN_EXE_docgen-worker")));
    let engine = JobEngine::start(config(1), launcher.clone());
    let handle = engine.handle();

    let job = handle
        .start_job(
            "person-42",
            json!({"name": "Ada Lovelace", "role": "Analyst"}),
            pdf("ada.pdf"),
        )
        .await
        .unwrap();
    wait_for_status(&handle, &job.id, JobStatus::Completed).await;

    let artifact = handle.job_result(&job.id).await.unwrap();
    assert!(artifact.bytes.starts_with(b"%PDF-"));
    assert_eq!(artifact.meta.content_type, "application/pdf");
    assert_eq!(launcher.live_units(), 0);

    engine.shutdown().await;
}

#[cfg(unix)]
mod process_workers {
    use super::*;

    fn sh(script: &str) -> Arc<ProcessLauncher> {
        Arc::new(ProcessLauncher::new("sh").with_args(["-c", script]))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_crashing_process_fails_only_its_job() {
        let launcher = sh(r#"read -r line; case "$line" in *crash*) exit 3;; esac; printf '{"ok":true,"bytes":"JVBERg=="}\n'"#);
        let engine = JobEngine::start(config(2), launcher.clone());
        let handle = engine.handle();

        let crashing = handle.start_job("x", json!({"mode": "crash"}), pdf("a.pdf")).await.unwrap();
        let sibling = handle.start_job("y", json!({"mode": "ok"}), pdf("b.pdf")).await.unwrap();

        let failed = wait_for_status(&handle, &crashing.id, JobStatus::Failed).await;
        assert_eq!(
            failed.error_message.as_deref(),
            Some("worker exited with code 3 before responding")
        );

        wait_for_status(&handle, &sibling.id, JobStatus::Completed).await;
        let artifact = handle.job_result(&sibling.id).await.unwrap();
        assert_eq!(artifact.bytes.as_ref(), &PDF_MAGIC);
        assert_eq!(launcher.live_units(), 0);

        engine.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_malformed_reply_fails_job() {
        let launcher = sh("cat >/dev/null; echo 'all done'");
        let engine = JobEngine::start(config(1), launcher.clone());
        let handle = engine.handle();

        let job = handle.start_job("x", json!({}), pdf("a.pdf")).await.unwrap();
        let failed = wait_for_status(&handle, &job.id, JobStatus::Failed).await;
        assert_eq!(
            failed.error_message.as_deref(),
            Some("worker response malformed")
        );

        engine.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timed_out_process_is_killed() {
        let launcher = sh("exec sleep 30");
        let config = config(1).with_render_timeout(Duration::from_millis(200));
        let engine = JobEngine::start(config, launcher.clone());
        let handle = engine.handle();

        let job = handle.start_job("x", json!({}), pdf("a.pdf")).await.unwrap();
        let failed = wait_for_status(&handle, &job.id, JobStatus::Failed).await;
        assert_eq!(
            failed.error_message.as_deref(),
            Some("render timed out after 200ms")
        );
        assert_eq!(launcher.live_units(), 0);

        engine.shutdown().await;
    }
}
