//! Row delta engine
//!
//! Compares two keyed CSV dumps of the same kind and classifies every key as
//! inserted, updated, deleted or unchanged. The first header column is the
//! primary key. Column sets may drift between the two dumps; a column missing
//! on one side reads as null there, so rows stay comparable.
//!
//! # Example
//!
//! ```
//! use manta_agent::delta::{compute_delta, DeltaOptions};
//!
//! let old = "id,name\n1,Alice\n2,Bob\n";
//! let new = "id,name\n1,Alice\n3,Carol\n";
//! let delta = compute_delta(old.as_bytes(), new.as_bytes(), &DeltaOptions::default()).unwrap();
//!
//! assert!(delta.delete.contains("2"));
//! assert!(delta.insert.contains_key("3"));
//! assert!(delta.update.is_empty());
//! ```

mod duplicates;
mod encode;
mod engine;

pub use duplicates::{find_duplicates, DuplicateKey};
pub use encode::{write_delta, write_delta_file};
pub use engine::compute_delta;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

/// Field value that stands for an application-level null in dumps and deltas
pub const NULL_TOKEN: &str = "__null__";

/// Non-key columns of one record; `None` is null
pub type Row = BTreeMap<String, Option<String>>;

pub type Result<T> = std::result::Result<T, DeltaError>;

/// Which input a row came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Old,
    New,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Old => write!(f, "existing"),
            Side::New => write!(f, "new"),
        }
    }
}

#[derive(Debug, Error)]
pub enum DeltaError {
    #[error("{side} file has no header row")]
    MissingHeader { side: Side },

    #[error("Primary key column changed from '{old}' to '{new}'; the first column is the key and cannot change")]
    KeyColumnMismatch { old: String, new: String },

    #[error("Malformed row in {side} file at line {line}: expected {expected} fields, found {found}")]
    MalformedRow {
        side: Side,
        line: u64,
        expected: usize,
        found: usize,
    },

    #[error("Duplicate differing key '{key}' in {side} file at line {line}")]
    DuplicateKey { side: Side, key: String, line: u64 },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Switches for the engine's data-quality handling
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeltaOptions {
    /// Keep the most recent row when the existing dump holds differing rows
    /// for one key, instead of failing. Never applies to the new dump.
    pub discard_duplicate_existing_rows: bool,
}

/// Changeset between two dumps of one kind
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeltaResult {
    pub key_column: String,
    /// Output columns after the key: the existing header, then new columns
    pub columns: Vec<String>,
    pub added_columns: Vec<String>,
    pub removed_columns: Vec<String>,
    pub insert: BTreeMap<String, Row>,
    /// Old row, new row
    pub update: BTreeMap<String, (Row, Row)>,
    pub delete: BTreeSet<String>,
}

impl DeltaResult {
    pub fn is_empty(&self) -> bool {
        self.insert.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }

    pub fn stats(&self) -> DeltaStats {
        DeltaStats {
            inserted: self.insert.len(),
            updated: self.update.len(),
            deleted: self.delete.len(),
        }
    }
}

/// Row counts written for one kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeltaStats {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl DeltaStats {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}
