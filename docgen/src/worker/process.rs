//! Out-of-process worker units.
//!
//! Each unit is a child process running the worker executable. The request is
//! written to its stdin, which is then closed; the first line of its stdout is
//! the reply. Stderr is forwarded to our logs.

use std::ffi::OsString;
use std::path::PathBuf;

use async_trait::async_trait;
use process_utils::{describe_exit, worker_command};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tracing::{debug, warn};

use super::{
    LiveUnitGuard, LiveUnits, WorkerLauncher, WorkerOutcome, WorkerReply, WorkerRequest,
    WorkerUnit,
};
use crate::config::worker_path_from_env;

/// Largest reply line accepted from a worker (64 MiB of base64).
const MAX_REPLY_BYTES: u64 = 64 * 1024 * 1024;

/// Launches units as child processes.
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
    live: LiveUnits,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            live: LiveUnits::default(),
        }
    }

    /// Launcher for the worker executable resolved from the environment.
    pub fn from_env() -> Self {
        Self::new(worker_path_from_env())
    }

    /// Extra arguments passed to every worker.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, job_id: &str, request: WorkerRequest) -> crate::Result<Box<dyn WorkerUnit>> {
        let request_line = request.to_line()?;

        let mut command = worker_command(&self.program);
        command.args(&self.args).env("DOCGEN_JOB_ID", job_id);

        let mut child = command.spawn().map_err(|e| {
            crate::Error::Other(format!("{}: {}", self.program.display(), e))
        })?;

        debug!(job_id, pid = ?child.id(), program = %self.program.display(), "Spawned worker process");

        if let Some(stderr) = child.stderr.take() {
            let job_id = job_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(job_id = %job_id, "worker stderr: {}", line);
                }
            });
        }

        Ok(Box::new(ProcessUnit {
            child,
            request: Some(request_line),
            guard: Some(self.live.acquire()),
        }))
    }

    fn live_units(&self) -> usize {
        self.live.count()
    }

    fn name(&self) -> &'static str {
        "process"
    }
}

struct ProcessUnit {
    child: Child,
    request: Option<Vec<u8>>,
    guard: Option<LiveUnitGuard>,
}

#[async_trait]
impl WorkerUnit for ProcessUnit {
    async fn wait(&mut self) -> WorkerOutcome {
        if let Some(mut stdin) = self.child.stdin.take()
            && let Some(request) = self.request.take()
        {
            // A worker that dies before reading fails the write; its exit
            // status below tells the real story.
            if let Err(e) = stdin.write_all(&request).await {
                debug!("Failed to write worker request: {}", e);
            }
            drop(stdin);
        }

        let mut line = Vec::new();
        if let Some(stdout) = self.child.stdout.take() {
            let mut reader = BufReader::new(stdout.take(MAX_REPLY_BYTES));
            if let Err(e) = reader.read_until(b'\n', &mut line).await {
                return WorkerOutcome::Crashed(format!("failed to read worker reply: {}", e));
            }
        }

        let has_reply = line.iter().any(|b| !b.is_ascii_whitespace());

        // Stdout ended mid-line: a failed exit outranks the partial reply.
        if has_reply
            && !line.ends_with(b"\n")
            && let Ok(status) = self.child.wait().await
            && !status.success()
        {
            return WorkerOutcome::Crashed(format!(
                "worker {} before responding",
                describe_exit(&status)
            ));
        }

        if has_reply {
            return match std::str::from_utf8(&line)
                .ok()
                .and_then(|text| WorkerReply::parse(text).ok())
            {
                Some(reply) => reply.into(),
                None => WorkerOutcome::Malformed,
            };
        }

        // Stdout closed without a reply.
        match self.child.wait().await {
            Ok(status) => {
                WorkerOutcome::Crashed(format!("worker {} before responding", describe_exit(&status)))
            }
            Err(e) => WorkerOutcome::Crashed(format!("failed to wait for worker: {}", e)),
        }
    }

    async fn release(&mut self) {
        match self.child.try_wait() {
            Ok(Some(_)) => {}
            _ => {
                // `kill` also reaps the child.
                if let Err(e) = self.child.kill().await {
                    warn!(pid = ?self.child.id(), "Failed to kill worker process: {}", e);
                }
            }
        }
        self.guard.take();
    }
}
