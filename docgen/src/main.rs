use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use docgen::logging::{LoggingOptions, init_logging};
use docgen::{ArtifactMeta, EngineConfig, JobEngine, JobStatus, ProcessLauncher};
use tracing::info;

/// Interval between status polls while waiting for a job.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Render one record through the worker pool and write the document
    Render {
        /// Identity the document is rendered for (part of the dedup key)
        #[arg(short, long)]
        target: String,

        /// Path to the JSON source record
        #[arg(short, long)]
        record: PathBuf,

        /// Where to write the rendered document
        #[arg(short, long)]
        output: PathBuf,

        /// Artifact file name (defaults to the output file name)
        #[arg(short, long)]
        name: Option<String>,

        /// Worker executable
        #[arg(long, env = "DOCGEN_WORKER_PATH")]
        worker: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let _guard = init_logging(&LoggingOptions::from_env())?;
    let args = Args::parse();

    match args.command {
        Commands::Render {
            target,
            record,
            output,
            name,
            worker,
        } => render(target, record, output, name, worker).await,
    }
}

async fn render(
    target: String,
    record_path: PathBuf,
    output: PathBuf,
    name: Option<String>,
    worker: Option<PathBuf>,
) -> anyhow::Result<()> {
    let raw = tokio::fs::read(&record_path)
        .await
        .with_context(|| format!("reading {}", record_path.display()))?;
    let record: serde_json::Value = serde_json::from_slice(&raw)
        .with_context(|| format!("parsing {}", record_path.display()))?;

    let name = name
        .or_else(|| output.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "document.pdf".to_string());

    let launcher = match worker {
        Some(path) => ProcessLauncher::new(path),
        None => ProcessLauncher::from_env(),
    };
    info!(worker = %launcher.program().display(), "Using worker executable");

    let engine = JobEngine::start(EngineConfig::from_env(), Arc::new(launcher));
    let handle = engine.handle();

    let result = async {
        let job = handle
            .start_job(&target, record, ArtifactMeta::pdf(name))
            .await?;
        info!(job_id = %job.id, "Submitted job");

        let snapshot = loop {
            let snapshot = handle.job_status(&job.id).await?;
            if snapshot.is_terminal() {
                break snapshot;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        };

        if snapshot.status == JobStatus::Failed {
            bail!(
                "job {} failed: {}",
                snapshot.id,
                snapshot.error_message.unwrap_or_default()
            );
        }

        let artifact = handle.job_result(&job.id).await?;
        tokio::fs::write(&output, &artifact.bytes)
            .await
            .with_context(|| format!("writing {}", output.display()))?;
        info!(
            path = %output.display(),
            bytes = artifact.bytes.len(),
            content_type = %artifact.meta.content_type,
            "Wrote document"
        );
        Ok::<(), anyhow::Error>(())
    }
    .await;

    engine.shutdown().await;
    result
}
