//! Reconstruction pipeline: scan, discover, parse, reconcile, classify.

use rayon::prelude::*;
use std::collections::BTreeSet;

use crate::config::RebuildConfig;
use crate::error::{RebuildError, Result, Warning, WarningSink};
use crate::fs::common::ImageSource;
use crate::fs::ntfs::geometry;
use crate::fs::ntfs::parser::{attach_index_blocks, read_index_blocks, MftParser, ParseOutcome};
use crate::fs::ntfs::partition::{discover_partitions, PartitionCandidate};
use crate::recovery::classify::classify;
use crate::recovery::directory::{DirectoryReconstructor, NtfsReconstructor};
use crate::scanner::{CancelToken, DiskScanner};
use crate::session::{ImageFingerprint, SaveState};
use crate::Partition;

/// Share of the progress bar given to the signature scan
const SCAN_SHARE: f32 = 70.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStage {
    Initialization,
    Scanning,
    PartitionDiscovery,
    RecordParsing,
    IndexRecovery,
    Reconciliation,
    Complete,
}

#[derive(Debug, Clone)]
pub struct ScanProgress {
    pub stage: ScanStage,
    pub progress_percent: f32,
    pub sectors_done: u64,
    pub sectors_total: u64,
    pub partitions_found: usize,
    pub current_operation: String,
}

/// Result of a run
#[derive(Debug, Clone)]
pub struct ScanReport {
    pub state: SaveState,
    pub warnings: Vec<Warning>,
    /// False when the scan was cancelled before covering the whole image
    pub completed: bool,
}

/// Reconstruction engine over one image
pub struct Engine<I: ImageSource> {
    image: I,
    config: RebuildConfig,
    warnings: WarningSink,
    cancel: CancelToken,
    progress_callback: Option<Box<dyn Fn(ScanProgress) + Send + Sync>>,
}

impl<I: ImageSource> Engine<I> {
    pub fn new(image: I, config: RebuildConfig) -> Self {
        Self {
            image,
            config,
            warnings: WarningSink::new(),
            cancel: CancelToken::new(),
            progress_callback: None,
        }
    }

    pub fn image(&self) -> &I {
        &self.image
    }

    pub fn config(&self) -> &RebuildConfig {
        &self.config
    }

    /// Token that stops a running scan between windows and slot batches
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn warnings(&self) -> &WarningSink {
        &self.warnings
    }

    pub fn set_progress_callback<F>(&mut self, callback: F)
    where
        F: Fn(ScanProgress) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
    }

    pub fn fingerprint(&self) -> Result<ImageFingerprint> {
        ImageFingerprint::compute(&self.image)
    }

    /// Run the whole pipeline. With a prior state, covered sectors are not
    /// rescanned, known record positions are not re-read and the new
    /// findings are merged into it.
    pub fn run(&self, prior: Option<SaveState>) -> Result<ScanReport> {
        if self.image.is_empty() {
            return Err(RebuildError::EmptyImage);
        }

        let fingerprint = self.fingerprint()?;
        let mut state = match prior {
            Some(state) if state.matches(&fingerprint) => state,
            Some(state) => {
                return Err(RebuildError::FingerprintMismatch(format!(
                    "saved for {}, current image is {}",
                    state.fingerprint, fingerprint
                )))
            }
            None => SaveState::new(fingerprint),
        };

        self.emit(ScanStage::Initialization, 0.0, "Initializing reconstruction...");

        // Phase 1: signature scan
        let report_scan = |done: u64, total: u64| {
            let percent = if total == 0 {
                SCAN_SHARE
            } else {
                done as f32 / total as f32 * SCAN_SHARE
            };
            self.emit_progress(ScanProgress {
                stage: ScanStage::Scanning,
                progress_percent: percent,
                sectors_done: done,
                sectors_total: total,
                partitions_found: 0,
                current_operation: "Scanning for boot sectors and records...".to_string(),
            });
        };
        let outcome = DiskScanner::new(&self.image, self.config.window_sectors)
            .with_warnings(self.warnings.clone())
            .with_cancel(self.cancel.clone())
            .with_progress(&report_scan)
            .scan(&state.scanned);
        state.scanned = outcome.covered;
        state.hits.merge(&outcome.hits);

        if !outcome.completed {
            tracing::warn!("⏹️ Scan interrupted, keeping partial coverage");
            return Ok(ScanReport {
                state,
                warnings: self.warnings.drain(),
                completed: false,
            });
        }

        // Phase 2: partitions from boot sectors and record clusters
        self.emit(ScanStage::PartitionDiscovery, SCAN_SHARE, "Placing partitions...");
        let candidates = discover_partitions(
            &self.image,
            &state.hits,
            self.config.mirror_records,
            &self.warnings,
        );
        tracing::info!("🧩 {} partition candidates", candidates.len());

        // Phase 3: record tables, one partition per task
        self.emit(ScanStage::RecordParsing, SCAN_SHARE + 5.0, "Reading record tables...");
        let parser = MftParser::new(&self.image, &self.config)
            .with_warnings(self.warnings.clone())
            .with_cancel(self.cancel.clone());
        let parsed: Vec<(PartitionCandidate, ParseOutcome)> = candidates
            .into_par_iter()
            .map(|candidate| {
                let known = state.known_positions(candidate.partition.kind, candidate.partition.mft_sector);
                parser.parse(&candidate, &known).map(|outcome| (candidate, outcome))
            })
            .collect::<Result<_>>()?;

        let mut partitions = drop_shadowed(parsed);

        // Phase 4: merge with what was known, then use the index blocks to
        // place boot-less partitions and to recover ghosts
        state.absorb(std::mem::take(&mut partitions));
        let unplaced = state.partitions.iter().any(|p| p.start_sector.is_none());
        let infer = self.config.infer_geometry && unplaced;
        if infer || self.config.parse_index_records {
            self.emit(ScanStage::IndexRecovery, SCAN_SHARE + 15.0, "Reading index blocks...");
            let blocks = read_index_blocks(&self.image, &state.hits.indx);
            if infer {
                let candidates =
                    geometry::likely_sectors_per_cluster(&geometry::boot_sectors_per_cluster(&self.image, &state.hits.boot));
                geometry::infer_missing(&mut state.partitions, &blocks, &candidates);
            }
            if self.config.parse_index_records {
                attach_index_blocks(&blocks, &mut state.partitions);
            }
        }

        // Phase 5: trees and labels
        self.emit(ScanStage::Reconciliation, SCAN_SHARE + 20.0, "Rebuilding directory trees...");
        state.refresh(&self.config, &self.warnings);

        self.emit_progress(ScanProgress {
            stage: ScanStage::Complete,
            progress_percent: 100.0,
            sectors_done: state.scanned.covered_sectors(),
            sectors_total: self.image.len() / crate::SECTOR_SIZE,
            partitions_found: state.partitions.len(),
            current_operation: "Reconstruction complete".to_string(),
        });
        tracing::info!(
            "✅ {} partitions reconstructed, {} records",
            state.partitions.len(),
            state.partitions.iter().map(|p| p.records.len()).sum::<usize>()
        );

        Ok(ScanReport {
            state,
            warnings: self.warnings.drain(),
            completed: true,
        })
    }

    fn emit(&self, stage: ScanStage, percent: f32, operation: &str) {
        self.emit_progress(ScanProgress {
            stage,
            progress_percent: percent,
            sectors_done: 0,
            sectors_total: 0,
            partitions_found: 0,
            current_operation: operation.to_string(),
        });
    }

    fn emit_progress(&self, progress: ScanProgress) {
        if let Some(ref callback) = self.progress_callback {
            callback(progress);
        }
    }
}

/// Drop partitions inferred from records alone when every one of their
/// records was read as part of a partition with known geometry. A
/// fragmented table shows up as several record clusters; only the one with
/// a boot sector is kept.
fn drop_shadowed(parsed: Vec<(PartitionCandidate, ParseOutcome)>) -> Vec<Partition> {
    let covered: BTreeSet<u64> = parsed
        .iter()
        .filter(|(candidate, _)| candidate.partition.has_geometry())
        .flat_map(|(_, outcome)| outcome.positions.iter().copied())
        .collect();

    parsed
        .into_iter()
        .filter_map(|(candidate, outcome)| {
            let hits = candidate.hit_sectors();
            if !candidate.partition.has_geometry() && !hits.is_empty() && hits.is_subset(&covered) {
                tracing::debug!(
                    "Record cluster at sector {} belongs to another table",
                    candidate.partition.mft_sector
                );
                return None;
            }
            let mut partition = candidate.partition;
            partition.records = outcome.records;
            Some(partition)
        })
        .collect()
}

/// Rebuild the tree of a partition from its records and label it
pub fn rebuild_partition(partition: &mut Partition, config: &RebuildConfig, warnings: &WarningSink) {
    let mut reconstructor = NtfsReconstructor::new(partition.kind.root_id(), warnings.clone());
    partition.tree = reconstructor.reconstruct(&partition.records);
    partition.status = classify(partition, config);

    let stats = reconstructor.stats();
    tracing::info!(
        "📁 Partition #{}: {} attached, {} lost, {} cycles cut, {} renamed -> {}",
        partition.index,
        stats.attached,
        stats.lost,
        stats.cycles_broken,
        stats.renamed,
        partition.status
    );
}
