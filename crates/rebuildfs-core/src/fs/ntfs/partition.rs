//! Turning scan hits into partition candidates.
//!
//! Boot sectors give partitions with known geometry. `FILE` records carry
//! their own record number, so each one also implies where its table starts;
//! records that fit no boot sector are grouped by that implied start and become
//! partitions of unknown geometry.

use std::collections::{BTreeMap, BTreeSet};

use super::{record, NtfsBootSector, DEFAULT_RECORD_SIZE};
use crate::error::{RebuildError, WarningSink};
use crate::fs::common::{ImageSource, SECTOR_SIZE};
use crate::scanner::ScanHits;
use crate::{FsKind, Partition};

/// A partition before its records are parsed
#[derive(Debug, Clone)]
pub struct PartitionCandidate {
    pub partition: Partition,
    /// FILE hits attributed to this partition, as (sector, record number)
    pub hits: Vec<(u64, u64)>,
    pub serial_number: Option<u64>,
}

impl PartitionCandidate {
    pub fn highest_hit_record(&self) -> Option<u64> {
        self.hits.iter().map(|&(_, n)| n).max()
    }

    pub fn hit_sectors(&self) -> BTreeSet<u64> {
        self.hits.iter().map(|&(sector, _)| sector).collect()
    }
}

/// Partition for the boot sector found at `sector`, or `None` when it cannot
/// be placed consistently inside the image
fn place_boot_sector(
    image: &dyn ImageSource,
    sector: u64,
    file_hits: &BTreeSet<u64>,
    warnings: &WarningSink,
) -> Option<(PartitionCandidate, bool)> {
    let data = image.read_sectors(sector, 1).ok()?;
    let boot = NtfsBootSector::parse(data).ok()?;
    boot.validate().ok()?;

    let image_sectors = image.len() / SECTOR_SIZE;
    let volume = boot.volume_sectors();

    // A backup boot sector sits right after the declared volume
    let mut starts = Vec::with_capacity(2);
    if let Some(backup_start) = sector.checked_sub(volume) {
        starts.push(backup_start);
    }
    starts.push(sector);

    let confirmed = starts
        .iter()
        .copied()
        .find(|&start| file_hits.contains(&(start + boot.mft_relative_sector())));
    let (start, confirmed) = match confirmed {
        Some(start) => (start, true),
        None if sector + boot.mft_relative_sector() < image_sectors => (sector, false),
        None => {
            warnings.report(&RebuildError::InvalidSignature {
                sector,
                what: "NTFS boot sector (MFT outside image)",
            });
            return None;
        }
    };

    let mut partition = Partition::new(FsKind::Ntfs, start + boot.mft_relative_sector());
    partition.start_sector = Some(start);
    partition.sector_size = boot.bytes_per_sector as u32;
    partition.sectors_per_cluster = Some(boot.sectors_per_cluster());
    partition.record_size = boot.record_size() as u32;
    partition.mft_mirror_sector = Some(start + boot.mirror_relative_sector());
    partition.size_sectors = Some(volume);

    tracing::debug!(
        "Boot sector at {} places a partition at sector {} ({})",
        sector,
        start,
        if confirmed { "confirmed by MFT" } else { "unconfirmed" }
    );

    Some((
        PartitionCandidate {
            partition,
            hits: Vec::new(),
            serial_number: Some(boot.serial_number),
        },
        confirmed,
    ))
}

/// Build partition candidates from the hits of a scan
pub fn discover_partitions(
    image: &dyn ImageSource,
    hits: &ScanHits,
    mirror_records: u64,
    warnings: &WarningSink,
) -> Vec<PartitionCandidate> {
    // Boot sectors, deduplicated by start sector
    let mut placed: BTreeMap<u64, (PartitionCandidate, bool)> = BTreeMap::new();
    for &sector in &hits.boot {
        if let Some((candidate, confirmed)) = place_boot_sector(image, sector, &hits.file, warnings)
        {
            let start = candidate.partition.start_sector.unwrap_or(sector);
            placed.entry(start).or_insert((candidate, confirmed));
        }
    }

    // Unconfirmed copies of a volume that was placed elsewhere are stale
    let confirmed_serials: BTreeSet<u64> = placed
        .values()
        .filter(|(_, confirmed)| *confirmed)
        .filter_map(|(c, _)| c.serial_number)
        .collect();
    let mut candidates: Vec<PartitionCandidate> = placed
        .into_values()
        .filter(|(c, confirmed)| {
            *confirmed
                || c.serial_number
                    .map_or(true, |serial| !confirmed_serials.contains(&serial))
        })
        .map(|(c, _)| c)
        .collect();

    // Attribute FILE hits to boot partitions, group the rest by implied table
    let mut groups: BTreeMap<u64, Vec<(u64, u64)>> = BTreeMap::new();
    for &sector in &hits.file {
        let Ok(data) = image.read_sectors(sector, 1) else {
            continue;
        };
        let Some(number) = record::peek_record_number(data) else {
            continue;
        };

        let owner = candidates.iter_mut().find(|c| {
            let p = &c.partition;
            sector >= p.mft_sector && sector - p.mft_sector == number * p.record_sectors()
        });
        match owner {
            Some(candidate) => candidate.hits.push((sector, number)),
            None => {
                let record_sectors = DEFAULT_RECORD_SIZE as u64 / SECTOR_SIZE;
                if let Some(table) = sector.checked_sub(number * record_sectors) {
                    groups.entry(table).or_default().push((sector, number));
                }
            }
        }
    }

    let mirror_sectors: BTreeSet<u64> = candidates
        .iter()
        .filter_map(|c| c.partition.mft_mirror_sector)
        .collect();
    let has_larger_table = |table: u64| {
        groups
            .iter()
            .any(|(&other, hits)| other != table && hits.iter().any(|&(_, n)| n >= mirror_records))
            || !candidates.is_empty()
    };

    let mut inferred = Vec::new();
    for (&table, group) in &groups {
        let mirror_only = group.iter().all(|&(_, n)| n < mirror_records);
        if mirror_only && (mirror_sectors.contains(&table) || has_larger_table(table)) {
            tracing::debug!("Dropping MFT mirror copy at sector {}", table);
            continue;
        }
        inferred.push(PartitionCandidate {
            partition: Partition::new(FsKind::Ntfs, table),
            hits: group.clone(),
            serial_number: None,
        });
    }

    candidates.extend(inferred);
    candidates.sort_by_key(|c| c.partition.mft_sector);

    tracing::info!(
        "🗂️ {} partition candidates ({} with boot sector)",
        candidates.len(),
        candidates.iter().filter(|c| c.partition.has_geometry()).count()
    );

    candidates
}
