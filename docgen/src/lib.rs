//! docgen library crate.
//!
//! An in-memory job engine that renders per-person documents in a bounded
//! pool of isolated worker units, deduplicating identical requests and
//! evicting finished jobs after a retention window.

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod render;
pub mod worker;

pub use config::EngineConfig;
pub use engine::{
    ArtifactMeta, EngineHandle, EngineStats, JobArtifact, JobEngine, JobEvent, JobKey,
    JobSnapshot, JobStatus,
};
pub use error::{Error, Result};
pub use render::{RecordSheetRenderer, Renderer};
pub use worker::{ProcessLauncher, TaskLauncher, WorkerLauncher, WorkerOutcome, WorkerUnit};
