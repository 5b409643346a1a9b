//! Geometry of partitions found without a boot sector.
//!
//! A directory record names the clusters of its `$INDEX_ALLOCATION` and the
//! scanner finds the `INDX` blocks themselves. A block at sector `s` owned by
//! a directory whose index starts at cluster `lcn` puts the partition start
//! at `s - lcn * spc` for the right sectors-per-cluster `spc`. Every such
//! pair casts a vote; the start backed by the most blocks wins.

use std::collections::BTreeMap;

use super::parser::IndexBlock;
use super::{NtfsBootSector, MFT_MIRROR_RECORD};
use crate::fs::common::{ImageSource, SECTOR_SIZE};
use crate::{Partition, RunKind};

/// Blocks that must agree before a start is trusted
pub const MIN_SUPPORT: usize = 2;

/// Cluster sizes NTFS formats with, in 512-byte sectors
const SECTORS_PER_CLUSTER: [u32; 8] = [1, 2, 4, 8, 16, 32, 64, 128];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub start_sector: u64,
    pub sectors_per_cluster: u32,
    /// Index blocks that agree on this placement
    pub support: usize,
}

/// Sectors-per-cluster values of the valid boot sectors found by the scan
pub fn boot_sectors_per_cluster<'a>(
    image: &dyn ImageSource,
    boot_hits: impl IntoIterator<Item = &'a u64>,
) -> Vec<u32> {
    boot_hits
        .into_iter()
        .filter_map(|&sector| {
            let data = image.read_sectors(sector, 1).ok()?;
            let boot = NtfsBootSector::parse(data).ok()?;
            boot.validate().ok()?;
            Some(boot.sectors_per_cluster())
        })
        .collect()
}

/// Candidate sectors-per-cluster values, most likely first. Values seen in
/// boot sectors elsewhere on the image come before the usual sizes.
pub fn likely_sectors_per_cluster(seen: &[u32]) -> Vec<u32> {
    let mut counts: BTreeMap<u32, usize> = SECTORS_PER_CLUSTER.iter().map(|&spc| (spc, 1)).collect();
    for &spc in seen {
        if SECTORS_PER_CLUSTER.contains(&spc) {
            *counts.entry(spc).or_default() += 1;
        }
    }
    let mut ranked: Vec<(u32, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked.into_iter().map(|(spc, _)| spc).collect()
}

/// Infer start and cluster size of `partition` from index blocks whose owner
/// is one of its directories. Returns `None` when no placement is backed by
/// at least [`MIN_SUPPORT`] blocks or when the best placement is ambiguous.
pub fn infer_geometry(partition: &Partition, blocks: &[IndexBlock], candidates: &[u32]) -> Option<Geometry> {
    let mft_sector = partition.mft_sector;

    // (block sector, first cluster of an index run of its owner)
    let mut pairs: Vec<(u64, u64)> = Vec::new();
    for block in blocks {
        let Some(owner) = block.owner() else {
            continue;
        };
        let Some(directory) = partition.records.get(&owner) else {
            continue;
        };
        if !directory.is_valid() || !directory.is_directory || directory.is_ghost {
            continue;
        }
        pairs.extend(directory.index_clusters.iter().map(|&lcn| (block.sector, lcn)));
    }
    if pairs.is_empty() {
        return None;
    }

    let mut best: Option<Geometry> = None;
    for &spc in candidates {
        let mut votes: BTreeMap<u64, usize> = BTreeMap::new();
        for &(sector, lcn) in &pairs {
            let Some(start) = lcn
                .checked_mul(spc as u64)
                .and_then(|offset| sector.checked_sub(offset))
            else {
                continue;
            };
            if start <= mft_sector && (mft_sector - start) % spc as u64 == 0 {
                *votes.entry(start).or_default() += 1;
            }
        }

        let Some(top) = votes.values().copied().max().filter(|&top| top >= MIN_SUPPORT) else {
            continue;
        };
        let mut leaders = votes.iter().filter(|(_, count)| **count == top);
        let (Some((&start, _)), None) = (leaders.next(), leaders.next()) else {
            tracing::debug!("{} sectors per cluster: several starts with {} votes", spc, top);
            continue;
        };
        if best.map_or(true, |b| top > b.support) {
            best = Some(Geometry {
                start_sector: start,
                sectors_per_cluster: spc,
                support: top,
            });
        }
    }
    best
}

/// Record an inferred geometry on `partition` and place its runs
pub fn apply(partition: &mut Partition, geometry: Geometry) {
    partition.start_sector = Some(geometry.start_sector);
    partition.sector_size = SECTOR_SIZE as u32;
    partition.sectors_per_cluster = Some(geometry.sectors_per_cluster);
    partition.place_runs();

    if partition.mft_mirror_sector.is_none() {
        partition.mft_mirror_sector = partition
            .records
            .get(&MFT_MIRROR_RECORD)
            .filter(|record| record.is_valid())
            .and_then(|record| record.data_runs.iter().find(|run| run.kind == RunKind::Extent))
            .map(|run| geometry.start_sector + run.offset / SECTOR_SIZE);
    }
}

/// Infer the geometry of every partition that lacks a start. Returns the
/// number of partitions placed.
pub fn infer_missing(partitions: &mut [Partition], blocks: &[IndexBlock], candidates: &[u32]) -> usize {
    let mut placed = 0;
    for partition in partitions.iter_mut().filter(|p| p.start_sector.is_none()) {
        match infer_geometry(partition, blocks, candidates) {
            Some(geometry) => {
                tracing::info!(
                    "📐 Partition with table at sector {} placed at sector {} ({} sectors per cluster, {} index blocks agree)",
                    partition.mft_sector,
                    geometry.start_sector,
                    geometry.sectors_per_cluster,
                    geometry.support
                );
                apply(partition, geometry);
                placed += 1;
            }
            None => tracing::debug!(
                "No geometry for partition with table at sector {}",
                partition.mft_sector
            ),
        }
    }
    placed
}
