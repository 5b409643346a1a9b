/// Engine configuration
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;

/// How to combine the primary and mirror copies of the same MFT record
/// when both decode successfully but disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MirrorPolicy {
    /// Primary wins field by field; mirror only fills empty/zeroed fields
    #[default]
    FillGaps,
    /// Primary wins as a whole
    PreferPrimary,
    /// Mirror wins as a whole
    PreferMirror,
}

/// Tunables for scanning, parsing, classification and restore
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RebuildConfig {
    /// Number of 512-byte sectors read per scan window
    pub window_sectors: u64,
    /// Number of records read from the MFT mirror
    pub mirror_records: u64,
    /// Tie-break between primary and mirror copies
    pub mirror_policy: MirrorPolicy,
    /// Minimum valid/(valid+damaged) ratio for a Recoverable partition
    pub recoverable_ratio: f32,
    /// Minimum ratio for a Partially Recoverable partition
    pub partial_ratio: f32,
    /// Largest single read issued while restoring file content
    pub max_restore_chunk: u64,
    /// Parse INDX records for ghost entries
    pub parse_index_records: bool,
    /// Place partitions that have no boot sector from their index blocks
    pub infer_geometry: bool,
}

impl Default for RebuildConfig {
    fn default() -> Self {
        Self {
            window_sectors: 2048, // 1 MiB
            mirror_records: 4,
            mirror_policy: MirrorPolicy::FillGaps,
            recoverable_ratio: 0.9,
            partial_ratio: 0.25,
            max_restore_chunk: 16 * 1024 * 1024,
            parse_index_records: true,
            infer_geometry: true,
        }
    }
}

impl RebuildConfig {
    /// Load a configuration from a JSON file; missing fields take defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        let config = serde_json::from_str(&data)?;
        Ok(config)
    }

    pub fn with_window_sectors(mut self, sectors: u64) -> Self {
        self.window_sectors = sectors.max(1);
        self
    }

    pub fn with_mirror_policy(mut self, policy: MirrorPolicy) -> Self {
        self.mirror_policy = policy;
        self
    }

    pub fn with_mirror_records(mut self, records: u64) -> Self {
        self.mirror_records = records;
        self
    }

    pub fn with_ratios(mut self, recoverable: f32, partial: f32) -> Self {
        self.recoverable_ratio = recoverable;
        self.partial_ratio = partial;
        self
    }

    pub fn with_index_records(mut self, enabled: bool) -> Self {
        self.parse_index_records = enabled;
        self
    }

    pub fn with_geometry_inference(mut self, enabled: bool) -> Self {
        self.infer_geometry = enabled;
        self
    }
}
