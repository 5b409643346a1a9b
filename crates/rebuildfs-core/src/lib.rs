use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub mod config;
pub mod error;
pub mod export;
pub mod fs;
pub mod recovery;
pub mod scanner;
pub mod session;

pub use config::{MirrorPolicy, RebuildConfig};
pub use error::{RebuildError, Warning, WarningKind, WarningSink};
pub use fs::common::{BlockDevice, ImageSource, MemoryImage, SECTOR_SIZE};
pub use recovery::{
    DirectoryTree, Engine, NodeId, NodeKind, RecordStats, RestoreReport, ScanProgress, ScanReport,
    ScanStage, TreeNode,
};
pub use scanner::{CancelToken, Coverage, ScanHits};
pub use session::{ImageFingerprint, SaveState, StateManager};

/// Identity of the synthetic Lost Files directory, shared by every kind
pub const LOST_FILES_ID: u64 = u64::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FsKind {
    Ntfs,
}

impl FsKind {
    /// Identity of the root directory record
    pub fn root_id(&self) -> u64 {
        match self {
            FsKind::Ntfs => fs::ntfs::ROOT_RECORD,
        }
    }
}

impl std::fmt::Display for FsKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FsKind::Ntfs => write!(f, "NTFS"),
        }
    }
}

/// Render an identity the way listings show it (`-1` for Lost Files)
pub fn display_id(id: u64) -> String {
    if id == LOST_FILES_ID {
        "-1".to_string()
    } else {
        id.to_string()
    }
}

/// Parse an identity typed by a user (`-1` or `lost` for Lost Files)
pub fn parse_id(text: &str) -> Option<u64> {
    match text.trim() {
        "-1" | "lost" | "Lost" | "LostFiles" => Some(LOST_FILES_ID),
        other => other.parse().ok(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamps {
    pub creation: Option<DateTime<Utc>>,
    pub modification: Option<DateTime<Utc>>,
    pub mft_modification: Option<DateTime<Utc>>,
    pub access: Option<DateTime<Utc>>,
}

impl Timestamps {
    pub fn is_empty(&self) -> bool {
        self.creation.is_none()
            && self.modification.is_none()
            && self.mft_modification.is_none()
            && self.access.is_none()
    }

    /// Take every timestamp missing here from `other`
    pub fn fill_from(&mut self, other: &Timestamps) {
        self.creation = self.creation.or(other.creation);
        self.modification = self.modification.or(other.modification);
        self.mft_modification = self.mft_modification.or(other.mft_modification);
        self.access = self.access.or(other.access);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunKind {
    /// Content stored inside the record
    Resident(Vec<u8>),
    /// Hole in the stream, reads as zeros
    Sparse,
    /// Clusters on disk
    Extent,
    /// Clusters whose byte position is unknown (no cluster size)
    Unmapped { lcn: Option<u64>, clusters: u64 },
}

/// A piece of a file's content. `offset` and `length` are in bytes relative
/// to the partition start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRun {
    pub kind: RunKind,
    pub offset: u64,
    pub length: u64,
}

impl DataRun {
    pub fn resident(data: Vec<u8>) -> Self {
        let length = data.len() as u64;
        Self {
            kind: RunKind::Resident(data),
            offset: 0,
            length,
        }
    }

    pub fn sparse(length: u64) -> Self {
        Self {
            kind: RunKind::Sparse,
            offset: 0,
            length,
        }
    }

    pub fn extent(offset: u64, length: u64) -> Self {
        Self {
            kind: RunKind::Extent,
            offset,
            length,
        }
    }

    pub fn unmapped(lcn: Option<u64>, clusters: u64) -> Self {
        Self {
            kind: RunKind::Unmapped { lcn, clusters },
            offset: 0,
            length: 0,
        }
    }

    /// Place an unmapped run once the cluster size is known
    pub fn placed(&self, cluster_size: u64) -> DataRun {
        match self.kind {
            RunKind::Unmapped { lcn: Some(lcn), clusters } => DataRun::extent(
                lcn.saturating_mul(cluster_size),
                clusters.saturating_mul(cluster_size),
            ),
            RunKind::Unmapped { lcn: None, clusters } => {
                DataRun::sparse(clusters.saturating_mul(cluster_size))
            }
            _ => self.clone(),
        }
    }
}

/// Where a record was read from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordSource {
    Primary,
    Mirror,
    Index,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordCondition {
    Valid,
    Damaged { reason: String },
}

/// A decoded MFT record, or the placeholder of a slot that failed to decode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: u64,
    pub name: String,
    pub parent: Option<u64>,
    pub is_directory: bool,
    pub is_deleted: bool,
    /// Known only through a directory index entry
    pub is_ghost: bool,
    pub compressed: bool,
    pub timestamps: Timestamps,
    pub size: u64,
    pub data_runs: Vec<DataRun>,
    pub source: RecordSource,
    pub offset_sector: Option<u64>,
    pub condition: RecordCondition,
    /// First cluster of every `$INDEX_ALLOCATION` run of a directory
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub index_clusters: Vec<u64>,
}

impl FileRecord {
    pub fn is_valid(&self) -> bool {
        self.condition == RecordCondition::Valid
    }

    pub fn is_damaged(&self) -> bool {
        !self.is_valid()
    }

    /// Name shown in listings; records without a `$FILE_NAME` get a synthetic one
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            format!("File_{}", self.id)
        } else {
            self.name.clone()
        }
    }

    /// Records never restored: `$BadClus` spans the whole volume
    pub fn is_ignored(&self) -> bool {
        self.id == fs::ntfs::BAD_CLUSTERS_RECORD && self.name.starts_with("$BadClus")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoverabilityStatus {
    Recoverable,
    PartiallyRecoverable,
    Unrecoverable,
}

impl std::fmt::Display for RecoverabilityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoverabilityStatus::Recoverable => write!(f, "Recoverable"),
            RecoverabilityStatus::PartiallyRecoverable => write!(f, "Partially Recoverable"),
            RecoverabilityStatus::Unrecoverable => write!(f, "Unrecoverable"),
        }
    }
}

/// A reconstructed partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    pub index: usize,
    pub kind: FsKind,
    /// `None` when inferred from orphaned records without a boot sector
    pub start_sector: Option<u64>,
    pub sector_size: u32,
    pub sectors_per_cluster: Option<u32>,
    pub record_size: u32,
    /// Absolute sector of the record table
    pub mft_sector: u64,
    pub mft_mirror_sector: Option<u64>,
    pub size_sectors: Option<u64>,
    pub status: RecoverabilityStatus,
    pub records: BTreeMap<u64, FileRecord>,
    pub tree: DirectoryTree,
}

impl Partition {
    /// Empty partition for a table found at `mft_sector`
    pub fn new(kind: FsKind, mft_sector: u64) -> Self {
        Self {
            index: 0,
            kind,
            start_sector: None,
            sector_size: SECTOR_SIZE as u32,
            sectors_per_cluster: None,
            record_size: fs::ntfs::DEFAULT_RECORD_SIZE,
            mft_sector,
            mft_mirror_sector: None,
            size_sectors: None,
            status: RecoverabilityStatus::Unrecoverable,
            records: BTreeMap::new(),
            tree: DirectoryTree::new(kind.root_id()),
        }
    }

    pub fn start_offset_bytes(&self) -> Option<u64> {
        self.start_sector.map(|s| s * SECTOR_SIZE)
    }

    pub fn has_geometry(&self) -> bool {
        self.start_sector.is_some() && self.sectors_per_cluster.is_some()
    }

    pub fn cluster_size(&self) -> Option<u64> {
        self.sectors_per_cluster
            .map(|spc| spc as u64 * self.sector_size as u64)
    }

    /// Sectors occupied by one record slot
    pub fn record_sectors(&self) -> u64 {
        (self.record_size as u64 / SECTOR_SIZE).max(1)
    }

    /// Count of valid, non-ghost records
    pub fn file_count(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.is_valid() && !r.is_ghost)
            .count()
    }

    pub fn get(&self, id: u64) -> Option<&FileRecord> {
        self.records.get(&id)
    }

    pub fn stats(&self) -> RecordStats {
        recovery::classify::record_stats(self)
    }

    /// Size in bytes, when known
    pub fn size_bytes(&self) -> Option<u64> {
        self.size_sectors.map(|s| s * SECTOR_SIZE)
    }

    /// Turn the cluster-numbered runs of every record into byte extents.
    /// Does nothing while the cluster size is unknown.
    pub fn place_runs(&mut self) {
        let Some(cluster_size) = self.cluster_size() else {
            return;
        };
        for record in self.records.values_mut() {
            if record
                .data_runs
                .iter()
                .any(|run| matches!(run.kind, RunKind::Unmapped { .. }))
            {
                record.data_runs = record.data_runs.iter().map(|run| run.placed(cluster_size)).collect();
            }
        }
    }
}

/// Scan an image file and reconstruct every partition found
pub fn scan_image(image_path: &Path, config: RebuildConfig) -> Result<ScanReport> {
    tracing::info!("🔍 Starting scan of {}", image_path.display());

    let device = BlockDevice::open(image_path)
        .with_context(|| format!("Failed to open image {}", image_path.display()))?;
    let engine = Engine::new(device, config);
    let report = engine.run(None)?;

    tracing::info!(
        "✅ Scan complete: {} partitions, {} warnings",
        report.state.partitions.len(),
        report.warnings.len()
    );

    Ok(report)
}

/// Open a recovery session: reuse the save-state at `save_path` when it
/// belongs to this image, scan what is missing, and persist the result.
pub fn open_session(
    engine: &Engine<BlockDevice>,
    save_path: Option<&Path>,
    overwrite: bool,
) -> Result<ScanReport> {
    let manager = save_path.map(StateManager::new);

    let prior = match &manager {
        Some(manager) if !overwrite => manager
            .load_for(&engine.fingerprint()?)
            .context("Failed to load save-state")?,
        _ => None,
    };

    if prior.is_some() {
        tracing::info!("📂 Resuming from saved state");
    }

    let report = engine.run(prior)?;

    if let Some(manager) = &manager {
        manager
            .write_atomic(&report.state)
            .context("Failed to write save-state")?;
        tracing::info!("💾 State saved to {}", manager.path().display());
    }

    Ok(report)
}

/// Restore a node of a partition into `output_dir/Partition<i>/`
pub fn restore_node(
    image: &dyn ImageSource,
    partition: &Partition,
    id: u64,
    output_dir: &Path,
    config: &RebuildConfig,
) -> Result<RestoreReport> {
    let target = output_dir.join(format!("Partition{}", partition.index));
    let report = recovery::restore::restore(image, partition, id, &target, config)
        .with_context(|| format!("Failed to restore {} from partition {}", display_id(id), partition.index))?;
    Ok(report)
}

/// One-line summary of a reconstruction
pub fn readable_summary(state: &SaveState) -> String {
    let recoverable = state
        .partitions
        .iter()
        .filter(|p| p.status == RecoverabilityStatus::Recoverable)
        .count();
    let records: usize = state.partitions.iter().map(|p| p.records.len()).sum();
    format!(
        "{} partitions ({} recoverable), {} records, {} of {} sectors scanned",
        state.partitions.len(),
        recoverable,
        records,
        state.scanned.covered_sectors(),
        state.fingerprint.size / SECTOR_SIZE
    )
}
