//! Partition recoverability classification

use serde::{Deserialize, Serialize};

use crate::config::RebuildConfig;
use crate::{Partition, RecoverabilityStatus};

/// Record counts a classification is based on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordStats {
    pub valid: usize,
    pub damaged: usize,
    pub ghost: usize,
    /// Records under Lost Files
    pub lost: usize,
    /// Records under the primary root
    pub attached: usize,
}

impl RecordStats {
    /// Share of decoded slots that were valid; 0 when nothing was decoded
    pub fn valid_ratio(&self) -> f32 {
        let total = self.valid + self.damaged;
        if total == 0 {
            0.0
        } else {
            self.valid as f32 / total as f32
        }
    }
}

pub fn record_stats(partition: &Partition) -> RecordStats {
    let mut stats = RecordStats::default();
    for record in partition.records.values() {
        if record.is_damaged() {
            stats.damaged += 1;
        } else if record.is_ghost {
            stats.ghost += 1;
        } else {
            stats.valid += 1;
        }
    }
    let tree = &partition.tree;
    stats.attached = tree.descendant_count(tree.root());
    stats.lost = tree.descendant_count(tree.lost());
    stats
}

/// Label a partition from its geometry, tree shape and record counts
pub fn classify(partition: &Partition, config: &RebuildConfig) -> RecoverabilityStatus {
    let stats = record_stats(partition);
    let geometry = partition.has_geometry();
    let root_populated = stats.attached > 0;
    let ratio = stats.valid_ratio();

    if geometry && root_populated && ratio >= config.recoverable_ratio {
        RecoverabilityStatus::Recoverable
    } else if stats.valid > 0 && ((geometry && ratio >= config.partial_ratio) || root_populated) {
        RecoverabilityStatus::PartiallyRecoverable
    } else {
        RecoverabilityStatus::Unrecoverable
    }
}
