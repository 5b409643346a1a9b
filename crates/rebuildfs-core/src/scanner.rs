//! Sector-level evidence scan.
//!
//! The image is cut into windows of `window_sectors` sectors which are read
//! and classified in parallel. Every 512-byte sector is checked for an NTFS
//! boot sector, a `FILE`/`BAAD` record header or an `INDX` header. Windows
//! already covered by an earlier scan are skipped, which is what makes
//! rescanning with a save-state incremental.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{RebuildError, WarningKind, WarningSink};
use crate::fs::common::{ImageSource, SECTOR_SIZE};
use crate::fs::ntfs::{self, record};

/// Cooperative cancellation flag shared between the caller and workers
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Half-open range of sectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SectorRange {
    pub start: u64,
    pub end: u64,
}

/// Set of sector ranges already scanned, kept sorted and coalesced
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coverage {
    ranges: Vec<SectorRange>,
}

impl Coverage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ranges(&self) -> &[SectorRange] {
        &self.ranges
    }

    pub fn insert(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        let mut merged = SectorRange { start, end };
        let mut kept = Vec::with_capacity(self.ranges.len() + 1);
        for range in self.ranges.drain(..) {
            if range.end < merged.start || range.start > merged.end {
                kept.push(range);
            } else {
                merged.start = merged.start.min(range.start);
                merged.end = merged.end.max(range.end);
            }
        }
        kept.push(merged);
        kept.sort();
        self.ranges = kept;
    }

    pub fn union(&mut self, other: &Coverage) {
        for range in &other.ranges {
            self.insert(range.start, range.end);
        }
    }

    pub fn contains(&self, start: u64, end: u64) -> bool {
        self.ranges
            .iter()
            .any(|range| range.start <= start && end <= range.end)
    }

    /// Ranges of `[0, total)` not yet covered
    pub fn gaps(&self, total: u64) -> Vec<SectorRange> {
        let mut gaps = Vec::new();
        let mut cursor = 0;
        for range in &self.ranges {
            if range.start >= total {
                break;
            }
            if range.start > cursor {
                gaps.push(SectorRange {
                    start: cursor,
                    end: range.start,
                });
            }
            cursor = cursor.max(range.end);
        }
        if cursor < total {
            gaps.push(SectorRange { start: cursor, end: total });
        }
        gaps
    }

    pub fn covered_sectors(&self) -> u64 {
        self.ranges.iter().map(|r| r.end - r.start).sum()
    }
}

/// Kind of evidence found in a sector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectorKind {
    NtfsBoot,
    FileRecord,
    IndexRecord,
}

/// Positions (absolute sectors) of interesting sectors
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanHits {
    pub boot: BTreeSet<u64>,
    pub file: BTreeSet<u64>,
    pub indx: BTreeSet<u64>,
}

impl ScanHits {
    pub fn record(&mut self, kind: SectorKind, sector: u64) {
        match kind {
            SectorKind::NtfsBoot => self.boot.insert(sector),
            SectorKind::FileRecord => self.file.insert(sector),
            SectorKind::IndexRecord => self.indx.insert(sector),
        };
    }

    pub fn merge(&mut self, other: &ScanHits) {
        self.boot.extend(other.boot.iter().copied());
        self.file.extend(other.file.iter().copied());
        self.indx.extend(other.indx.iter().copied());
    }

    pub fn len(&self) -> usize {
        self.boot.len() + self.file.len() + self.indx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Classify one sector by its signature
pub fn classify_sector(data: &[u8]) -> Option<SectorKind> {
    let magic = data.get(0..4)?;
    if magic == record::FILE_SIGNATURE || magic == record::BAAD_SIGNATURE {
        return Some(SectorKind::FileRecord);
    }
    if magic == record::INDX_SIGNATURE {
        return Some(SectorKind::IndexRecord);
    }
    if ntfs::is_ntfs_boot_sector(data) {
        return Some(SectorKind::NtfsBoot);
    }
    None
}

/// Result of one pass over the image
#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    pub hits: ScanHits,
    pub covered: Coverage,
    pub completed: bool,
}

type ProgressFn<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);

/// Parallel signature scanner over an image
pub struct DiskScanner<'a> {
    image: &'a dyn ImageSource,
    window_sectors: u64,
    warnings: WarningSink,
    cancel: CancelToken,
    progress: Option<ProgressFn<'a>>,
}

impl<'a> DiskScanner<'a> {
    pub fn new(image: &'a dyn ImageSource, window_sectors: u64) -> Self {
        Self {
            image,
            window_sectors: window_sectors.max(1),
            warnings: WarningSink::new(),
            cancel: CancelToken::new(),
            progress: None,
        }
    }

    pub fn with_warnings(mut self, warnings: WarningSink) -> Self {
        self.warnings = warnings;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Called with (sectors done, sectors to do) after every window
    pub fn with_progress(mut self, progress: ProgressFn<'a>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn total_sectors(&self) -> u64 {
        self.image.len() / SECTOR_SIZE
    }

    /// Scan every window not already in `skip`
    pub fn scan(&self, skip: &Coverage) -> ScanOutcome {
        let total = self.total_sectors();
        let windows: Vec<SectorRange> = skip
            .gaps(total)
            .into_iter()
            .flat_map(|gap| {
                let step = self.window_sectors;
                (gap.start..gap.end)
                    .step_by(step as usize)
                    .map(move |start| SectorRange {
                        start,
                        end: (start + step).min(gap.end),
                    })
            })
            .collect();

        let todo: u64 = windows.iter().map(|w| w.end - w.start).sum();
        tracing::info!(
            "🔍 Scanning {} sectors in {} windows ({} already covered)",
            todo,
            windows.len(),
            skip.covered_sectors()
        );

        let done = AtomicU64::new(0);
        let results: Vec<Option<ScanHits>> = windows
            .par_iter()
            .map(|window| {
                if self.cancel.is_cancelled() {
                    return None;
                }
                let hits = self.scan_window(*window);
                let finished = done.fetch_add(window.end - window.start, Ordering::Relaxed)
                    + (window.end - window.start);
                if let Some(progress) = self.progress {
                    progress(finished, todo);
                }
                Some(hits)
            })
            .collect();

        let mut outcome = ScanOutcome {
            hits: ScanHits::default(),
            covered: skip.clone(),
            completed: true,
        };
        for (window, result) in windows.iter().zip(results) {
            match result {
                Some(hits) => {
                    outcome.hits.merge(&hits);
                    outcome.covered.insert(window.start, window.end);
                }
                None => outcome.completed = false,
            }
        }

        if outcome.completed {
            tracing::info!(
                "✅ Found {} boot sectors, {} FILE records, {} INDX records",
                outcome.hits.boot.len(),
                outcome.hits.file.len(),
                outcome.hits.indx.len()
            );
        } else {
            tracing::warn!("⏹️ Scan cancelled after {} sectors", done.load(Ordering::Relaxed));
        }

        outcome
    }

    fn scan_window(&self, window: SectorRange) -> ScanHits {
        let mut hits = ScanHits::default();
        let count = window.end - window.start;

        match self.image.read_sectors(window.start, count) {
            Ok(data) => {
                for (i, sector) in data.chunks_exact(SECTOR_SIZE as usize).enumerate() {
                    self.classify_into(&mut hits, window.start + i as u64, sector);
                }
            }
            Err(err) => {
                // Fall back to single sectors to salvage what can be read
                let mut unreadable = 0u64;
                for sector in window.start..window.end {
                    match self.image.read_sectors(sector, 1) {
                        Ok(data) => self.classify_into(&mut hits, sector, data),
                        Err(_) => unreadable += 1,
                    }
                }
                self.warnings.warn(
                    WarningKind::ImageRead,
                    format!(
                        "{} of {} sectors unreadable in window at sector {} ({})",
                        unreadable, count, window.start, err
                    ),
                );
            }
        }

        hits
    }

    fn classify_into(&self, hits: &mut ScanHits, sector: u64, data: &[u8]) {
        let Some(kind) = classify_sector(data) else {
            return;
        };
        if kind == SectorKind::NtfsBoot {
            let consistent = ntfs::NtfsBootSector::parse(data)
                .map(|boot| boot.validate().is_ok())
                .unwrap_or(false);
            if !consistent {
                self.warnings.report(&RebuildError::InvalidSignature {
                    sector,
                    what: "NTFS boot sector",
                });
                return;
            }
            tracing::debug!("Boot sector candidate at sector {}", sector);
        }
        hits.record(kind, sector);
    }
}
