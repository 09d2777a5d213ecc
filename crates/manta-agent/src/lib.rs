//! Manta Sync Agent
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Periodically exports tables from a source database, diffs each export
//! against the previous one and ships the changes to an ingestion endpoint.
//!
//! - **Delta**: keyed CSV diffing that tolerates column drift ([`delta`])
//! - **Snapshots**: timestamped directories with crash-safe stage markers ([`snapshot`])
//! - **Upload**: chunked, retried, stall-aware concurrent upload ([`upload`])
//! - **Extraction**: templated SQL client invocations ([`extract`])
//! - **Orchestration**: one groom/build/upload/archive cycle ([`agent`])

pub mod agent;
pub mod config;
pub mod delta;
pub mod error;
pub mod extract;
pub mod snapshot;
pub mod upload;

// Re-export commonly used types
pub use agent::{CycleReport, SyncAgent};
pub use config::{AgentConfig, KindFilter, RunOptions};
pub use error::{AgentError, Result};

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Manta - periodic database export and delta sync
#[derive(Parser, Debug)]
#[command(name = "manta-agent")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute; without one a full sync cycle runs
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Configuration file
    #[arg(
        short,
        long,
        env = "MANTA_CONFIG",
        default_value = config::DEFAULT_CONFIG_FILE,
        global = true
    )]
    pub config: PathBuf,

    /// Kinds to upload, comma separated, `*` for all
    #[arg(long, default_value = "*", global = true)]
    pub kinds: KindFilter,

    /// Keep the latest row when the existing dump has differing duplicate keys
    #[arg(long, global = true)]
    pub discard_duplicate_existing_rows: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

impl Cli {
    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            kinds: self.kinds.clone(),
            delta: delta::DeltaOptions {
                discard_duplicate_existing_rows: self.discard_duplicate_existing_rows,
            },
        }
    }
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run extraction only, outside the snapshot pipeline
    Sql {
        /// Command name, or `*` for every configured command
        kind: String,

        /// Directory the dumps are written to
        output_dir: PathBuf,
    },

    /// Diff two dumps of the same kind
    Delta {
        /// Earlier dump
        old: PathBuf,

        /// Later dump
        new: PathBuf,

        /// Write the delta here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Upload one CSV file
    Upload {
        /// Endpoint URL
        url: String,

        /// File to upload
        file: PathBuf,
    },

    /// List keys that occur more than once in a dump
    Duplicates {
        /// Dump to inspect
        file: PathBuf,
    },
}
