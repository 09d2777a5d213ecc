//! Concurrent upload of one CSV file
//!
//! The file's records are cut into fixed-size chunks. A pool of workers
//! posts the chunks (each prefixed with the header) to the ingestion
//! endpoint, retrying failed chunks, while a monitor task reports progress
//! and fails the upload when it stops making progress. A stalled upload
//! drops its in-flight requests rather than waiting out their timeout.
//!
//! File contents are handled as bytes and never decoded.

mod bundle;
mod uploader;

pub use uploader::Uploader;

use std::time::Duration;
use thiserror::Error;

use crate::config::UploadConfig;

/// Header carrying the endpoint credential
pub const AUTH_TOKEN_HEADER: &str = "Auth-Token";

pub type Result<T> = std::result::Result<T, UploadError>;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    #[error("Upload task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Upload cancelled")]
    Cancelled,
}

/// Tuning for the worker pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSettings {
    pub auth_token: Option<String>,
    pub num_workers: usize,
    /// Records per request
    pub chunk_size: usize,
    /// Attempts per chunk, the first one included
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub request_timeout: Duration,
    /// Longest time without an acknowledged chunk before giving up
    pub max_idle: Duration,
    pub progress_interval: Duration,
}

impl Default for UploadSettings {
    fn default() -> Self {
        UploadConfig::default().settings()
    }
}

/// Outcome of one file upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    /// Every chunk acknowledged, with no stall or cancellation
    pub success: bool,
    pub total_lines: usize,
    pub uploaded_lines: usize,
    pub chunks: usize,
    /// Trimmed body of the latest response, or the latest failure
    pub last_status: String,
}
