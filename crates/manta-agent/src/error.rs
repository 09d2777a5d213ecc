//! Error type for a sync run
//!
//! Each stage has its own error enum; [`AgentError`] wraps them so a run can
//! report the first fatal condition with `?`.

use std::path::PathBuf;
use thiserror::Error;

use crate::config::ConfigError;
use crate::delta::DeltaError;
use crate::extract::ExtractError;
use crate::snapshot::SnapshotError;
use crate::upload::UploadError;

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Delta failed: {0}")]
    Delta(#[from] DeltaError),

    #[error("Snapshot directory error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Extraction failed: {0}")]
    Extract(#[from] ExtractError),

    #[error("Upload failed: {0}")]
    Upload(#[from] UploadError),

    /// Extraction produced nothing to diff, or a baseline archive is empty
    #[error("No dumps found in {dir}")]
    NoDumps { dir: PathBuf },

    /// Snapshots still waiting for upload when the queue should be drained.
    /// They stay in UPLOADING and are resumed by the next run.
    #[error("{count} snapshot(s) still pending upload: {dirs:?}")]
    PendingUploads { count: usize, dirs: Vec<PathBuf> },

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
