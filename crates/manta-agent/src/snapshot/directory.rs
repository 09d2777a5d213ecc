use chrono::{DateTime, Utc};
use manta_common::time::{format_timestamp, parse_timestamp};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use super::{MarkerStore, Result, SnapshotError, Stage};

/// Name prefix of the per-snapshot delta subdirectory
pub const DELTA_DIR_PREFIX: &str = "Delta-";

/// One `<kind>.csv` file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dump {
    pub kind: String,
    pub path: PathBuf,
}

/// A timestamped snapshot directory under either the in-progress or archive root
#[derive(Clone)]
pub struct SnapshotDirectory {
    root: PathBuf,
    timestamp: DateTime<Utc>,
    name: String,
    path: PathBuf,
    markers: Arc<dyn MarkerStore>,
}

impl fmt::Debug for SnapshotDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotDirectory")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SnapshotDirectory {
    /// Handle for `<root>/<timestamp>` without touching the filesystem
    pub fn new(
        root: impl Into<PathBuf>,
        timestamp: DateTime<Utc>,
        markers: Arc<dyn MarkerStore>,
    ) -> Self {
        let root = root.into();
        let name = format_timestamp(&timestamp);
        let path = root.join(&name);
        Self {
            root,
            timestamp,
            name,
            path,
            markers,
        }
    }

    /// Create `<root>/<timestamp>` on disk if it does not exist yet
    pub fn create(
        root: impl Into<PathBuf>,
        timestamp: DateTime<Utc>,
        markers: Arc<dyn MarkerStore>,
    ) -> Result<Self> {
        let directory = Self::new(root, timestamp, markers);
        std::fs::create_dir_all(&directory.path)?;
        Ok(directory)
    }

    /// Open an existing directory, taking the timestamp from its name
    pub fn from_path(path: &Path, markers: Arc<dyn MarkerStore>) -> Result<Self> {
        let invalid = |source| SnapshotError::InvalidDirectoryName {
            path: path.to_path_buf(),
            source,
        };
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let timestamp = parse_timestamp(&name).map_err(invalid)?;
        let root = path.parent().map(Path::to_path_buf).unwrap_or_default();

        Ok(Self::new(root, timestamp, markers))
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Current stage; more than one marker is an error
    pub fn stage(&self) -> Result<Option<Stage>> {
        let mut stages = self.markers.markers(&self.path)?;
        match stages.len() {
            0 => Ok(None),
            1 => Ok(stages.pop()),
            _ => Err(SnapshotError::MultipleStages {
                dir: self.path.clone(),
                stages,
            }),
        }
    }

    pub fn set_stage(&self, stage: Stage) -> Result<()> {
        let current = self.stage()?;
        self.markers.transition(&self.path, current, stage)?;
        debug!(dir = %self.name, from = ?current, to = %stage, "Stage changed");
        Ok(())
    }

    /// The `Delta-*` subdirectory, if one exists
    pub fn delta_directory(&self) -> Result<Option<PathBuf>> {
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            let is_delta = entry.file_name().to_string_lossy().starts_with(DELTA_DIR_PREFIX);
            if is_delta && entry.file_type()?.is_dir() {
                found.push(entry.path());
            }
        }

        match found.len() {
            0 => Ok(None),
            1 => Ok(found.pop()),
            count => Err(SnapshotError::MultipleDeltaDirectories {
                dir: self.path.clone(),
                count,
            }),
        }
    }

    /// Create `Delta-<baseline>`; a directory gets at most one
    pub fn create_delta_directory(&self, baseline: &DateTime<Utc>) -> Result<PathBuf> {
        if self.delta_directory()?.is_some() {
            return Err(SnapshotError::DeltaDirectoryExists {
                dir: self.path.clone(),
            });
        }
        let path = self
            .path
            .join(format!("{}{}", DELTA_DIR_PREFIX, format_timestamp(baseline)));
        std::fs::create_dir(&path)?;
        Ok(path)
    }

    /// Dumps directly inside this directory
    pub fn dumps(&self) -> Result<Vec<Dump>> {
        csv_files(&self.path)
    }

    pub fn delete(self) -> Result<()> {
        std::fs::remove_dir_all(&self.path)?;
        self.markers.forget(&self.path)?;
        Ok(())
    }

    /// Move under `new_root` with a single rename so the directory is never in
    /// both roots. An existing target is removed first when `clobber` is set.
    pub fn move_to(&mut self, new_root: &Path, clobber: bool) -> Result<()> {
        let target = new_root.join(&self.name);
        if target.exists() {
            if !clobber {
                return Err(SnapshotError::TargetExists { path: target });
            }
            std::fs::remove_dir_all(&target)?;
            self.markers.forget(&target)?;
        }

        std::fs::rename(&self.path, &target)?;
        self.markers.relocate(&self.path, &target)?;

        self.root = new_root.to_path_buf();
        self.path = target;
        Ok(())
    }
}

/// `<kind>.csv` files in `dir`, sorted by kind
pub fn csv_files(dir: &Path) -> Result<Vec<Dump>> {
    let mut dumps = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_file() || path.extension().is_none_or(|ext| ext != "csv") {
            continue;
        }
        if let Some(kind) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) {
            dumps.push(Dump { kind, path });
        }
    }
    dumps.sort_by(|a, b| a.kind.cmp(&b.kind));
    Ok(dumps)
}

/// Snapshot directories under `root`, oldest first. Plain files are skipped.
pub fn list_directories(
    root: &Path,
    markers: &Arc<dyn MarkerStore>,
) -> Result<Vec<SnapshotDirectory>> {
    let mut directories = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            directories.push(SnapshotDirectory::from_path(&entry.path(), markers.clone())?);
        }
    }
    directories.sort_by_key(SnapshotDirectory::timestamp);
    Ok(directories)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::snapshot::{FsMarkerStore, MemoryMarkerStore};
    use chrono::TimeZone;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
    }

    fn memory() -> Arc<dyn MarkerStore> {
        Arc::new(MemoryMarkerStore::new())
    }

    #[test]
    fn test_stage_lifecycle_without_disk() {
        let dir = SnapshotDirectory::new("/nowhere/inprogress", ts(1), memory());
        assert_eq!(dir.name(), "2024-03-01T01.00.00");
        assert_eq!(dir.stage().unwrap(), None);

        for stage in Stage::ALL {
            dir.set_stage(stage).unwrap();
            assert_eq!(dir.stage().unwrap(), Some(stage));
        }
    }

    #[test]
    fn test_two_markers_is_an_error() {
        let store = Arc::new(MemoryMarkerStore::new());
        let dir = SnapshotDirectory::new("/nowhere", ts(2), store.clone());
        store.set_raw(dir.path(), vec![Stage::Building, Stage::Uploading]);

        assert!(matches!(dir.stage(), Err(SnapshotError::MultipleStages { .. })));
        assert!(dir.set_stage(Stage::Complete).is_err());
    }

    #[test]
    fn test_delta_directory_created_once() {
        let root = tempfile::tempdir().unwrap();
        let dir = SnapshotDirectory::create(root.path(), ts(3), Arc::new(FsMarkerStore)).unwrap();

        assert_eq!(dir.delta_directory().unwrap(), None);
        let delta = dir.create_delta_directory(&ts(1)).unwrap();
        assert!(delta.ends_with("Delta-2024-03-01T01.00.00"));
        assert_eq!(dir.delta_directory().unwrap(), Some(delta));

        assert!(matches!(
            dir.create_delta_directory(&ts(2)),
            Err(SnapshotError::DeltaDirectoryExists { .. })
        ));
    }

    #[test]
    fn test_two_delta_directories_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let dir = SnapshotDirectory::create(root.path(), ts(3), Arc::new(FsMarkerStore)).unwrap();
        std::fs::create_dir(dir.path().join("Delta-a")).unwrap();
        std::fs::create_dir(dir.path().join("Delta-b")).unwrap();

        assert!(matches!(
            dir.delta_directory(),
            Err(SnapshotError::MultipleDeltaDirectories { count: 2, .. })
        ));
    }

    #[test]
    fn test_csv_files_ignores_other_entries() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("people.csv"), "id\n").unwrap();
        std::fs::write(root.path().join("orders.csv"), "id\n").unwrap();
        std::fs::write(root.path().join("orders.sql"), "SELECT").unwrap();
        std::fs::write(root.path().join("building.txt"), "").unwrap();
        std::fs::create_dir(root.path().join("Delta-x")).unwrap();

        let kinds: Vec<String> = csv_files(root.path())
            .unwrap()
            .into_iter()
            .map(|d| d.kind)
            .collect();
        assert_eq!(kinds, vec!["orders", "people"]);
    }

    #[test]
    fn test_move_with_and_without_clobber() {
        let base = tempfile::tempdir().unwrap();
        let inprogress = base.path().join("inprogress");
        let archive = base.path().join("archive");
        std::fs::create_dir_all(&archive).unwrap();

        let store: Arc<dyn MarkerStore> = Arc::new(FsMarkerStore);
        let mut dir = SnapshotDirectory::create(&inprogress, ts(4), store.clone()).unwrap();
        dir.set_stage(Stage::Complete).unwrap();
        std::fs::create_dir(archive.join(dir.name())).unwrap();

        let old_path = dir.path().to_path_buf();
        assert!(matches!(
            dir.move_to(&archive, false),
            Err(SnapshotError::TargetExists { .. })
        ));

        dir.move_to(&archive, true).unwrap();
        assert!(!old_path.exists());
        assert_eq!(dir.path(), archive.join("2024-03-01T04.00.00"));
        assert_eq!(dir.stage().unwrap(), Some(Stage::Complete));
    }

    #[test]
    fn test_list_directories_sorted_and_strict() {
        let root = tempfile::tempdir().unwrap();
        let store: Arc<dyn MarkerStore> = Arc::new(FsMarkerStore);
        for hour in [5, 1, 3] {
            SnapshotDirectory::create(root.path(), ts(hour), store.clone()).unwrap();
        }
        std::fs::write(root.path().join("notes.txt"), "").unwrap();

        let listed = list_directories(root.path(), &store).unwrap();
        let hours: Vec<_> = listed.iter().map(|d| d.timestamp()).collect();
        assert_eq!(hours, vec![ts(1), ts(3), ts(5)]);

        std::fs::create_dir(root.path().join("scratch")).unwrap();
        assert!(matches!(
            list_directories(root.path(), &store),
            Err(SnapshotError::InvalidDirectoryName { .. })
        ));
    }
}
