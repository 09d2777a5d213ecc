//! Orchestration of one sync cycle
//!
//! A cycle recovers whatever an earlier run left in the in-progress root,
//! resumes pending uploads, builds and uploads a new snapshot, then prunes
//! the archive. Delivery is at least once: a snapshot whose upload was
//! interrupted is re-sent from its first delta file, so the endpoint must
//! apply rows idempotently.

use chrono::{DateTime, Utc};
use manta_common::time::utc_now;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{AgentConfig, RunOptions};
use crate::delta::write_delta_file;
use crate::error::{AgentError, Result};
use crate::extract::Extractor;
use crate::snapshot::{
    csv_files, list_directories, Dump, FsMarkerStore, MarkerStore, SnapshotDirectory,
    SnapshotError, Stage,
};
use crate::upload::Uploader;

/// The two roots snapshot directories live in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotLayout {
    pub inprogress: PathBuf,
    pub archive: PathBuf,
}

impl SnapshotLayout {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            inprogress: config.inprogress_dir(),
            archive: config.archive_dir(),
        }
    }

    pub fn ensure_exists(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.inprogress)?;
        std::fs::create_dir_all(&self.archive)
    }
}

/// What a successful cycle did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Snapshots left UPLOADING by earlier runs and finished now
    pub resumed: usize,
    /// Name of the snapshot built and archived by this cycle
    pub snapshot: String,
    /// Archived snapshots removed by retention
    pub pruned: usize,
}

pub struct SyncAgent {
    config: Arc<AgentConfig>,
    options: RunOptions,
    layout: SnapshotLayout,
    markers: Arc<dyn MarkerStore>,
    extractor: Arc<dyn Extractor>,
    uploader: Uploader,
    cancel: CancellationToken,
    clock: Clock,
}

/// Source of snapshot timestamps
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

impl SyncAgent {
    pub fn new(
        config: Arc<AgentConfig>,
        options: RunOptions,
        extractor: Arc<dyn Extractor>,
    ) -> Result<Self> {
        let uploader = Uploader::new(config.upload.settings())?;
        Ok(Self {
            layout: SnapshotLayout::from_config(&config),
            config,
            options,
            markers: Arc::new(FsMarkerStore),
            extractor,
            uploader,
            cancel: CancellationToken::new(),
            clock: Arc::new(utc_now),
        })
    }

    pub fn with_markers(mut self, markers: Arc<dyn MarkerStore>) -> Self {
        self.markers = markers;
        self
    }

    /// Token that aborts an upload in progress when cancelled
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Replace the wall clock that names new snapshots
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn layout(&self) -> &SnapshotLayout {
        &self.layout
    }

    /// Groom, resume, build, upload, archive, prune
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        self.layout.ensure_exists()?;

        let queued = self.groom()?;
        let mut resumed = 0;
        for dir in queued {
            if !self.process(dir, true).await? {
                break;
            }
            resumed += 1;
        }
        self.ensure_drained()?;

        let dir = self.build().await?;
        let snapshot = dir.name().to_string();
        self.process(dir, false).await?;
        self.ensure_drained()?;

        let pruned = self.garbage_collect()?;
        info!(snapshot = %snapshot, resumed, pruned, "Sync cycle complete");
        Ok(CycleReport {
            resumed,
            snapshot,
            pruned,
        })
    }

    /// Recover the in-progress root, oldest first, and return the snapshots
    /// whose upload should be resumed.
    ///
    /// Unmarked and BUILDING directories are deleted, COMPLETE ones are
    /// archived (replacing an archived copy of the same name).
    pub fn groom(&self) -> Result<Vec<SnapshotDirectory>> {
        let mut queued = Vec::new();
        for dir in list_directories(&self.layout.inprogress, &self.markers)? {
            match dir.stage()? {
                None | Some(Stage::Building) => {
                    warn!(dir = %dir.path().display(), "Deleting incomplete snapshot");
                    dir.delete()?;
                },
                Some(Stage::Uploading) => {
                    info!(dir = %dir.path().display(), "Queueing snapshot to resume upload");
                    queued.push(dir);
                },
                Some(Stage::Complete) => self.archive(dir)?,
            }
        }
        Ok(queued)
    }

    fn ensure_drained(&self) -> Result<()> {
        let pending = self.groom()?;
        if pending.is_empty() {
            return Ok(());
        }
        Err(AgentError::PendingUploads {
            count: pending.len(),
            dirs: pending.iter().map(|d| d.path().to_path_buf()).collect(),
        })
    }

    fn archive(&self, mut dir: SnapshotDirectory) -> Result<()> {
        dir.move_to(&self.layout.archive, true)?;
        info!(dir = %dir.path().display(), "Snapshot archived");
        Ok(())
    }

    /// Most recent archived snapshot, the baseline for the next delta
    pub fn latest_archive(&self) -> Result<Option<SnapshotDirectory>> {
        Ok(list_directories(&self.layout.archive, &self.markers)?.pop())
    }

    /// Extract a new snapshot and compute its deltas. Leaves the directory
    /// in UPLOADING on success; any failure leaves it BUILDING for the next
    /// groom to discard.
    pub async fn build(&self) -> Result<SnapshotDirectory> {
        let timestamp = (self.clock)();
        let dir =
            SnapshotDirectory::create(&self.layout.inprogress, timestamp, self.markers.clone())?;
        if let Some(stage) = dir.stage()? {
            return Err(SnapshotError::UnexpectedStage {
                dir: dir.path().to_path_buf(),
                expected: "no stage",
                found: Some(stage),
            }
            .into());
        }
        dir.set_stage(Stage::Building)?;
        info!(dir = %dir.path().display(), "Building snapshot");

        self.extractor.extract(dir.path()).await?;
        let dumps = dir.dumps()?;
        if dumps.is_empty() {
            return Err(AgentError::NoDumps {
                dir: dir.path().to_path_buf(),
            });
        }

        let (baseline, previous) = match self.latest_archive()? {
            Some(previous) => {
                let previous_dumps = previous.dumps()?;
                if previous_dumps.is_empty() {
                    return Err(AgentError::NoDumps {
                        dir: previous.path().to_path_buf(),
                    });
                }
                info!(baseline = %previous.name(), "Diffing against archived snapshot");
                (previous.timestamp(), previous_dumps)
            },
            None => {
                info!("No archived snapshot, every row is an insert");
                (DateTime::<Utc>::UNIX_EPOCH, Vec::new())
            },
        };

        let delta_dir = dir.create_delta_directory(&baseline)?;
        self.write_deltas(&dumps, &previous, &delta_dir).await?;

        dir.set_stage(Stage::Uploading)?;
        Ok(dir)
    }

    async fn write_deltas(
        &self,
        dumps: &[Dump],
        previous: &[Dump],
        delta_dir: &Path,
    ) -> Result<()> {
        let previous_by_kind: HashMap<&str, &Path> = previous
            .iter()
            .map(|d| (d.kind.as_str(), d.path.as_path()))
            .collect();

        for dump in dumps {
            let out = delta_dir.join(format!("{}.csv", dump.kind));
            match previous_by_kind.get(dump.kind.as_str()) {
                None => {
                    info!(kind = %dump.kind, "Kind newly introduced, sending full dump");
                    tokio::fs::copy(&dump.path, &out).await?;
                },
                Some(old) => {
                    let old = old.to_path_buf();
                    let new = dump.path.clone();
                    let options = self.options.delta;
                    tokio::task::spawn_blocking(move || {
                        write_delta_file(&old, &new, &out, &options)
                    })
                    .await??;
                },
            }
        }

        for kind in previous_by_kind.keys() {
            if !dumps.iter().any(|d| d.kind == *kind) {
                warn!(kind = %kind, "Kind missing from current extraction, skipping");
            }
        }
        Ok(())
    }

    /// Upload every selected delta of an UPLOADING snapshot, then mark it
    /// COMPLETE and archive it. Returns false when an upload failed; the
    /// snapshot then stays UPLOADING and the remaining kinds are not sent.
    pub async fn process(&self, dir: SnapshotDirectory, resumed: bool) -> Result<bool> {
        let stage = dir.stage()?;
        if stage != Some(Stage::Uploading) {
            return Err(SnapshotError::UnexpectedStage {
                dir: dir.path().to_path_buf(),
                expected: "UPLOADING",
                found: stage,
            }
            .into());
        }

        let delta_dir = dir
            .delta_directory()?
            .ok_or_else(|| SnapshotError::MissingDeltaDirectory {
                dir: dir.path().to_path_buf(),
                stage: Stage::Uploading,
            })?;
        let deltas = csv_files(&delta_dir)?;
        if deltas.is_empty() {
            return Err(AgentError::NoDumps { dir: delta_dir });
        }

        if resumed {
            warn!(
                dir = %dir.path().display(),
                "Resuming upload, already delivered chunks are sent again"
            );
        }

        for delta in &deltas {
            if !self.options.kinds.includes(&delta.kind) {
                info!(kind = %delta.kind, "Kind not selected, skipping upload");
                continue;
            }

            let url = self.config.kind_url(&delta.kind);
            let report = self
                .uploader
                .upload_file_with_cancel(&url, &delta.path, self.cancel.clone())
                .await?;
            if !report.success {
                error!(
                    dir = %dir.path().display(),
                    kind = %delta.kind,
                    last_status = %report.last_status,
                    "Upload failed, snapshot stays UPLOADING"
                );
                return Ok(false);
            }
        }

        dir.set_stage(Stage::Complete)?;
        self.archive(dir)?;
        Ok(true)
    }

    /// Delete all but the `history_size` newest archived snapshots
    pub fn garbage_collect(&self) -> Result<usize> {
        let archived = list_directories(&self.layout.archive, &self.markers)?;
        let excess = archived.len().saturating_sub(self.config.history_size);

        for dir in archived.into_iter().take(excess) {
            info!(dir = %dir.path().display(), "Removing old archived snapshot");
            dir.delete()?;
        }
        Ok(excess)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::extract::ExtractError;
    use crate::snapshot::MemoryMarkerStore;
    use async_trait::async_trait;
    use chrono::TimeZone;

    struct EmptyExtractor;

    #[async_trait]
    impl Extractor for EmptyExtractor {
        async fn extract(
            &self,
            _output_dir: &Path,
        ) -> std::result::Result<Vec<PathBuf>, ExtractError> {
            Ok(Vec::new())
        }
    }

    fn agent(root: &Path, markers: Arc<dyn MarkerStore>, history_size: usize) -> SyncAgent {
        let config = AgentConfig {
            root_dir: root.to_path_buf(),
            endpoint: "http://127.0.0.1:9".to_string(),
            history_size,
            ..AgentConfig::default()
        };
        let agent = SyncAgent::new(
            Arc::new(config),
            RunOptions::default(),
            Arc::new(EmptyExtractor),
        )
        .unwrap()
        .with_markers(markers);
        agent.layout().ensure_exists().unwrap();
        agent
    }

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_groom_sorts_out_every_stage() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryMarkerStore::new());
        let agent = agent(root.path(), store.clone(), 5);
        let inprogress = agent.layout().inprogress.clone();

        let unmarked = SnapshotDirectory::create(&inprogress, ts(1), store.clone()).unwrap();
        let building = SnapshotDirectory::create(&inprogress, ts(2), store.clone()).unwrap();
        building.set_stage(Stage::Building).unwrap();
        let uploading = SnapshotDirectory::create(&inprogress, ts(3), store.clone()).unwrap();
        uploading.set_stage(Stage::Uploading).unwrap();
        let complete = SnapshotDirectory::create(&inprogress, ts(4), store.clone()).unwrap();
        complete.set_stage(Stage::Complete).unwrap();

        let queued = agent.groom().unwrap();

        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].timestamp(), ts(3));
        assert!(!unmarked.path().exists());
        assert!(!building.path().exists());
        assert!(uploading.path().exists());
        assert!(!complete.path().exists());

        let archived = agent.latest_archive().unwrap().unwrap();
        assert_eq!(archived.timestamp(), ts(4));
        assert_eq!(archived.stage().unwrap(), Some(Stage::Complete));
    }

    #[test]
    fn test_ensure_drained_reports_pending_uploads() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryMarkerStore::new());
        let agent = agent(root.path(), store.clone(), 5);

        let dir = SnapshotDirectory::create(&agent.layout().inprogress, ts(1), store).unwrap();
        dir.set_stage(Stage::Uploading).unwrap();

        match agent.ensure_drained() {
            Err(AgentError::PendingUploads { count, dirs }) => {
                assert_eq!(count, 1);
                assert_eq!(dirs, vec![dir.path().to_path_buf()]);
            },
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_garbage_collect_keeps_newest() {
        let root = tempfile::tempdir().unwrap();
        let store: Arc<dyn MarkerStore> = Arc::new(FsMarkerStore);
        let agent = agent(root.path(), store.clone(), 2);

        for hour in [3, 1, 4, 2, 5] {
            SnapshotDirectory::create(&agent.layout().archive, ts(hour), store.clone()).unwrap();
        }

        assert_eq!(agent.garbage_collect().unwrap(), 3);
        let left: Vec<_> = list_directories(&agent.layout().archive, &store)
            .unwrap()
            .iter()
            .map(SnapshotDirectory::timestamp)
            .collect();
        assert_eq!(left, vec![ts(4), ts(5)]);

        assert_eq!(agent.garbage_collect().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_build_without_dumps_fails_and_stays_building() {
        let root = tempfile::tempdir().unwrap();
        let store: Arc<dyn MarkerStore> = Arc::new(FsMarkerStore);
        let agent = agent(root.path(), store.clone(), 5).with_clock(Arc::new(|| ts(6)));

        assert!(matches!(agent.build().await, Err(AgentError::NoDumps { .. })));

        let dirs = list_directories(&agent.layout().inprogress, &store).unwrap();
        assert_eq!(dirs.len(), 1);
        assert_eq!(dirs[0].stage().unwrap(), Some(Stage::Building));

        assert!(agent.groom().unwrap().is_empty());
        assert!(list_directories(&agent.layout().inprogress, &store)
            .unwrap()
            .is_empty());
    }
}
