//! Persistence of stage markers
//!
//! The agent only ever sees a directory's stage through a [`MarkerStore`], so
//! the state machine can be exercised without touching disk.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use super::{Result, Stage};

pub trait MarkerStore: Send + Sync {
    /// Every marker present for `dir`; more than one is an inconsistency the
    /// caller reports
    fn markers(&self, dir: &Path) -> Result<Vec<Stage>>;

    /// Replace `current` with `next`, or write `next` when there is no marker
    fn transition(&self, dir: &Path, current: Option<Stage>, next: Stage) -> Result<()>;

    /// Called after `from` was renamed to `to`
    fn relocate(&self, _from: &Path, _to: &Path) -> Result<()> {
        Ok(())
    }

    /// Called after `dir` was removed
    fn forget(&self, _dir: &Path) -> Result<()> {
        Ok(())
    }
}

/// Marker files inside the snapshot directory itself
#[derive(Debug, Default, Clone, Copy)]
pub struct FsMarkerStore;

impl MarkerStore for FsMarkerStore {
    fn markers(&self, dir: &Path) -> Result<Vec<Stage>> {
        Ok(Stage::ALL
            .into_iter()
            .filter(|stage| dir.join(stage.marker_file()).exists())
            .collect())
    }

    fn transition(&self, dir: &Path, current: Option<Stage>, next: Stage) -> Result<()> {
        let next_path = dir.join(next.marker_file());
        match current {
            None => {
                File::create(&next_path)?;
            },
            // A rename keeps exactly one marker on disk at every instant
            Some(current) if current != next => {
                std::fs::rename(dir.join(current.marker_file()), &next_path)?;
            },
            Some(_) => {},
        }
        Ok(())
    }
}

/// In-memory markers keyed by directory path
#[derive(Debug, Default)]
pub struct MemoryMarkerStore {
    markers: Mutex<HashMap<PathBuf, Vec<Stage>>>,
}

impl MemoryMarkerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force the raw marker set for `dir`, including inconsistent ones
    pub fn set_raw(&self, dir: impl Into<PathBuf>, stages: Vec<Stage>) {
        self.lock().insert(dir.into(), stages);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Vec<Stage>>> {
        self.markers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MarkerStore for MemoryMarkerStore {
    fn markers(&self, dir: &Path) -> Result<Vec<Stage>> {
        Ok(self.lock().get(dir).cloned().unwrap_or_default())
    }

    fn transition(&self, dir: &Path, _current: Option<Stage>, next: Stage) -> Result<()> {
        self.lock().insert(dir.to_path_buf(), vec![next]);
        Ok(())
    }

    fn relocate(&self, from: &Path, to: &Path) -> Result<()> {
        let mut markers = self.lock();
        if let Some(stages) = markers.remove(from) {
            markers.insert(to.to_path_buf(), stages);
        }
        Ok(())
    }

    fn forget(&self, dir: &Path) -> Result<()> {
        self.lock().remove(dir);
        Ok(())
    }
}
