//! Versioned save-state of a reconstruction.
//!
//! A state records which sectors were scanned, the evidence found, and every
//! partition with its records and tree. Loading checks the format tag and
//! version before anything else so an incompatible file is refused whole.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::config::RebuildConfig;
use crate::error::{RebuildError, Result, WarningSink};
use crate::fs::common::ImageSource;
use crate::recovery::directory::merge::merge_known;
use crate::recovery::engine::rebuild_partition;
use crate::scanner::{Coverage, ScanHits};
use crate::{FsKind, Partition};

pub const STATE_FORMAT: &str = "rebuildfs-state";
pub const STATE_VERSION: u32 = 1;

/// Bytes hashed at each end of the image
const FINGERPRINT_SPAN: usize = 1024 * 1024;

/// Identifies the image a state was computed from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageFingerprint {
    pub path: Option<String>,
    pub size: u64,
    /// CRC32 of the first MiB
    pub head_crc: u32,
    /// CRC32 of the last MiB
    pub tail_crc: u32,
}

impl ImageFingerprint {
    pub fn compute(image: &dyn ImageSource) -> Result<Self> {
        let size = image.len();
        let head = image.read_clamped(0, FINGERPRINT_SPAN)?;
        let tail_start = size.saturating_sub(FINGERPRINT_SPAN as u64);
        let tail = image.read_clamped(tail_start, FINGERPRINT_SPAN)?;

        let path = image.path().map(|p| {
            std::fs::canonicalize(p)
                .unwrap_or_else(|_| p.to_path_buf())
                .display()
                .to_string()
        });

        Ok(Self {
            path,
            size,
            head_crc: crc32fast::hash(head),
            tail_crc: crc32fast::hash(tail),
        })
    }

    /// Content identity; the path is informational only
    pub fn same_image(&self, other: &ImageFingerprint) -> bool {
        self.size == other.size && self.head_crc == other.head_crc && self.tail_crc == other.tail_crc
    }
}

impl std::fmt::Display for ImageFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({} bytes, {:08x}/{:08x})",
            self.path.as_deref().unwrap_or("<memory>"),
            self.size,
            self.head_crc,
            self.tail_crc
        )
    }
}

#[derive(Deserialize)]
struct StateHeader {
    format: Option<String>,
    version: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveState {
    pub format: String,
    pub version: u32,
    pub fingerprint: ImageFingerprint,
    pub created_at: DateTime<Utc>,
    pub scanned: Coverage,
    pub hits: ScanHits,
    pub partitions: Vec<Partition>,
}

impl SaveState {
    pub fn new(fingerprint: ImageFingerprint) -> Self {
        Self {
            format: STATE_FORMAT.to_string(),
            version: STATE_VERSION,
            fingerprint,
            created_at: Utc::now(),
            scanned: Coverage::new(),
            hits: ScanHits::default(),
            partitions: Vec::new(),
        }
    }

    pub fn matches(&self, fingerprint: &ImageFingerprint) -> bool {
        self.fingerprint.same_image(fingerprint)
    }

    pub fn save(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn load(bytes: &[u8]) -> Result<Self> {
        let header: StateHeader = serde_json::from_slice(bytes)
            .map_err(|e| RebuildError::SaveStateCorrupt(e.to_string()))?;

        let found_format = header.format.unwrap_or_default();
        let found_version = header.version.unwrap_or(0);
        if found_format != STATE_FORMAT || found_version != STATE_VERSION {
            return Err(RebuildError::SaveStateVersionMismatch {
                found: format!("{} v{}", found_format, found_version),
                expected: format!("{} v{}", STATE_FORMAT, STATE_VERSION),
            });
        }

        serde_json::from_slice(bytes).map_err(|e| RebuildError::SaveStateCorrupt(e.to_string()))
    }

    pub fn partition(&self, index: usize) -> Result<&Partition> {
        self.partitions
            .get(index)
            .ok_or(RebuildError::UnknownPartition(index))
    }

    /// Loaded partition sharing the table at `mft_sector`
    pub fn find_partition(&self, kind: FsKind, mft_sector: u64) -> Option<&Partition> {
        self.partitions
            .iter()
            .find(|p| p.kind == kind && p.mft_sector == mft_sector)
    }

    /// Record positions already decoded for the table at `mft_sector`
    pub fn known_positions(&self, kind: FsKind, mft_sector: u64) -> BTreeSet<u64> {
        self.find_partition(kind, mft_sector)
            .map(|p| p.records.values().filter_map(|r| r.offset_sector).collect())
            .unwrap_or_default()
    }

    /// Union `other` into this state. Partitions are matched by table
    /// position and records by identity; merging data already present
    /// leaves the state unchanged.
    pub fn merge(&mut self, other: SaveState, config: &RebuildConfig, warnings: &WarningSink) {
        self.scanned.union(&other.scanned);
        self.hits.merge(&other.hits);
        self.absorb(other.partitions);
        self.refresh(config, warnings);
    }

    /// Fold the records of partition `from` into partition `into` and drop
    /// `from`. Used when one volume was found as two record clusters.
    pub fn merge_partitions(
        &mut self,
        into: usize,
        from: usize,
        config: &RebuildConfig,
        warnings: &WarningSink,
    ) -> Result<()> {
        self.partition(into)?;
        self.partition(from)?;
        if into == from {
            return Ok(());
        }

        let source = self.partitions.remove(from);
        let target = if from < into { into - 1 } else { into };
        merge_partition(&mut self.partitions[target], source);
        self.refresh(config, warnings);
        Ok(())
    }

    /// Merge partitions into this state without rebuilding their trees
    pub(crate) fn absorb(&mut self, partitions: Vec<Partition>) {
        for incoming in partitions {
            match self
                .partitions
                .iter_mut()
                .find(|p| p.kind == incoming.kind && p.mft_sector == incoming.mft_sector)
            {
                Some(existing) => merge_partition(existing, incoming),
                None => self.partitions.push(incoming),
            }
        }
    }

    /// Order partitions by table position, renumber them and rebuild every
    /// tree and status
    pub(crate) fn refresh(&mut self, config: &RebuildConfig, warnings: &WarningSink) {
        self.partitions.sort_by_key(|p| (p.mft_sector, p.kind));
        for (index, partition) in self.partitions.iter_mut().enumerate() {
            partition.index = index;
            rebuild_partition(partition, config, warnings);
        }
    }
}

fn merge_partition(existing: &mut Partition, incoming: Partition) {
    if !existing.has_geometry() && incoming.has_geometry() {
        existing.start_sector = incoming.start_sector;
        existing.sector_size = incoming.sector_size;
        existing.sectors_per_cluster = incoming.sectors_per_cluster;
        existing.record_size = incoming.record_size;
        existing.mft_mirror_sector = incoming.mft_mirror_sector;
        existing.size_sectors = incoming.size_sectors;
        existing.place_runs();
    }

    for (id, record) in incoming.records {
        let merged = match existing.records.remove(&id) {
            Some(current) => merge_known(current, record),
            None => record,
        };
        existing.records.insert(id, merged);
    }
}
