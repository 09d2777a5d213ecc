//! Snapshot directories and their stage markers
//!
//! Each run of the agent works inside one directory named after its UTC start
//! time. The directory's position in the pipeline is persisted as a single
//! marker file so an interrupted run can be recognised and recovered:
//!
//! | Stage       | Marker          | Meaning                                      |
//! |-------------|-----------------|----------------------------------------------|
//! | (none)      | -               | created, nothing trustworthy inside          |
//! | `Building`  | `building.txt`  | extraction and delta computation under way   |
//! | `Uploading` | `uploading.txt` | delta directory complete, uploads may resume |
//! | `Complete`  | `complete.txt`  | every delta accepted, ready to archive       |

mod directory;
mod marker;

pub use directory::{csv_files, list_directories, Dump, SnapshotDirectory, DELTA_DIR_PREFIX};
pub use marker::{FsMarkerStore, MarkerStore, MemoryMarkerStore};

use manta_common::CommonError;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SnapshotError>;

/// Pipeline position of a snapshot directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Building,
    Uploading,
    Complete,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Building, Stage::Uploading, Stage::Complete];

    pub fn marker_file(self) -> &'static str {
        match self {
            Stage::Building => "building.txt",
            Stage::Uploading => "uploading.txt",
            Stage::Complete => "complete.txt",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Building => write!(f, "BUILDING"),
            Stage::Uploading => write!(f, "UPLOADING"),
            Stage::Complete => write!(f, "COMPLETE"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Directory {dir} carries more than one stage marker: {stages:?}")]
    MultipleStages { dir: PathBuf, stages: Vec<Stage> },

    #[error("Directory {dir} contains {count} delta directories; at most one is allowed")]
    MultipleDeltaDirectories { dir: PathBuf, count: usize },

    #[error("Directory {dir} already has a delta directory")]
    DeltaDirectoryExists { dir: PathBuf },

    #[error("Directory {dir} is marked {stage} but has no delta directory")]
    MissingDeltaDirectory { dir: PathBuf, stage: Stage },

    #[error("Directory {dir} is in stage {found:?}, expected {expected}")]
    UnexpectedStage {
        dir: PathBuf,
        expected: &'static str,
        found: Option<Stage>,
    },

    #[error("Not a snapshot directory: {path}: {source}")]
    InvalidDirectoryName {
        path: PathBuf,
        #[source]
        source: CommonError,
    },

    #[error("Snapshot target {path} exists and clobbering was not requested")]
    TargetExists { path: PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
