//! MFT table reader.
//!
//! Slots are read at the table offset (following the `$MFT` runlist when the
//! geometry allows it) and at the mirror offset, decoded in parallel and
//! merged per record number. How many slots are read is bounded by the image
//! and by the evidence found by the scanner, never by a declared count alone.
//! Extension records named by an `$ATTRIBUTE_LIST` are folded into their base
//! record.

use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

use super::index::{self, IndexEntry};
use super::partition::PartitionCandidate;
use super::record::{
    best_file_name, damaged_record, parse_attribute_list, parse_file_record, stream_runs, stream_size,
    AttributeList, AttributeListEntry, DataContent, FileNameAttribute, ParsedRecord, RawRun, ATTR_DATA,
    ATTR_FILE_NAME,
};
use super::{DEFAULT_INDEX_BLOCK_SIZE, MFT_RECORD};
use crate::config::RebuildConfig;
use crate::error::{RebuildError, Result, WarningSink};
use crate::fs::common::{ImageSource, SECTOR_SIZE};
use crate::recovery::directory::merge::{merge_copies, merge_known};
use crate::scanner::CancelToken;
use crate::{FileRecord, Partition, RecordSource, RunKind};

/// Slots decoded between two cancellation checks
const SLOT_BATCH: usize = 512;

/// Upper bound on a non-resident `$ATTRIBUTE_LIST`
const MAX_ATTRIBUTE_LIST: u64 = 256 * 1024;

/// Records read for one partition
#[derive(Debug, Clone, Default)]
pub struct ParseOutcome {
    pub records: BTreeMap<u64, FileRecord>,
    /// Sectors of every slot that was read
    pub positions: BTreeSet<u64>,
}

/// Contiguous piece of the record table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    first_slot: u64,
    byte_offset: u64,
    slots: u64,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    id: u64,
    byte_offset: u64,
    source: RecordSource,
}

impl Slot {
    fn sector(&self) -> u64 {
        self.byte_offset / SECTOR_SIZE
    }
}

struct Decoded {
    record: FileRecord,
    entries: Vec<IndexEntry>,
    link: Option<Link>,
}

/// How a record takes part in an attribute spread over several records
#[derive(Debug, Clone)]
enum Link {
    /// Extension record, attributes owned by `base`
    Extension {
        base: u64,
        data: Vec<DataContent>,
        file_names: Vec<FileNameAttribute>,
        compressed: bool,
    },
    /// Base record whose list names other records
    Listed {
        data: Vec<DataContent>,
        compressed: bool,
        holders: BTreeSet<u64>,
    },
}

/// Where a partition's clusters are, when known
#[derive(Debug, Clone, Copy)]
struct Placement {
    start: Option<u64>,
    cluster_size: Option<u64>,
}

pub struct MftParser<'a> {
    image: &'a dyn ImageSource,
    config: &'a RebuildConfig,
    warnings: WarningSink,
    cancel: CancelToken,
}

impl<'a> MftParser<'a> {
    pub fn new(image: &'a dyn ImageSource, config: &'a RebuildConfig) -> Self {
        Self {
            image,
            config,
            warnings: WarningSink::new(),
            cancel: CancelToken::new(),
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

    /// Read every slot of the candidate's table and mirror, skipping the
    /// sectors in `known`
    pub fn parse(&self, candidate: &PartitionCandidate, known: &BTreeSet<u64>) -> Result<ParseOutcome> {
        let partition = &candidate.partition;
        let record_size = partition.record_size as u64;

        let mut slots: Vec<Slot> = Vec::new();
        for segment in self.table_layout(candidate) {
            for i in 0..segment.slots {
                let Some(byte_offset) = i
                    .checked_mul(record_size)
                    .and_then(|delta| segment.byte_offset.checked_add(delta))
                else {
                    break;
                };
                slots.push(Slot {
                    id: segment.first_slot + i,
                    byte_offset,
                    source: RecordSource::Primary,
                });
            }
        }
        if let Some(mirror) = partition.mft_mirror_sector {
            let base = mirror * SECTOR_SIZE;
            let available = self.image.len().saturating_sub(base) / record_size;
            for i in 0..self.config.mirror_records.min(available) {
                slots.push(Slot {
                    id: i,
                    byte_offset: base + i * record_size,
                    source: RecordSource::Mirror,
                });
            }
        }

        let positions: BTreeSet<u64> = slots.iter().map(Slot::sector).collect();
        slots.retain(|slot| !known.contains(&slot.sector()));

        tracing::debug!(
            "Decoding {} slots of partition at sector {}",
            slots.len(),
            partition.mft_sector
        );

        let placement = Placement {
            start: partition.start_offset_bytes(),
            cluster_size: partition.cluster_size(),
        };
        let batches: Vec<Option<Vec<Decoded>>> = slots
            .par_chunks(SLOT_BATCH)
            .map(|batch| {
                if self.cancel.is_cancelled() {
                    return None;
                }
                Some(
                    batch
                        .iter()
                        .filter_map(|slot| self.decode_slot(slot, record_size, placement))
                        .collect(),
                )
            })
            .collect();

        let mut primary = BTreeMap::new();
        let mut mirror = BTreeMap::new();
        let mut entries = Vec::new();
        let mut links = BTreeMap::new();
        for batch in batches {
            let batch = batch.ok_or(RebuildError::Cancelled)?;
            for decoded in batch {
                entries.extend(decoded.entries);
                let record = decoded.record;
                if let Some(link) = decoded.link {
                    if record.source == RecordSource::Primary || !links.contains_key(&record.id) {
                        links.insert(record.id, link);
                    }
                }
                match record.source {
                    RecordSource::Mirror => mirror.insert(record.id, record),
                    _ => primary.insert(record.id, record),
                };
            }
        }

        let ids: BTreeSet<u64> = primary.keys().chain(mirror.keys()).copied().collect();
        let mut records = BTreeMap::new();
        for id in ids {
            if let Some(record) =
                merge_copies(primary.remove(&id), mirror.remove(&id), self.config.mirror_policy)
            {
                records.insert(id, record);
            }
        }

        let joined = join_extensions(&mut records, links, placement.cluster_size);
        if joined > 0 {
            tracing::debug!("{} records rebuilt from extension records", joined);
        }

        let mut ghosts = 0usize;
        for entry in entries {
            if !records.contains_key(&entry.record) {
                records.insert(entry.record, entry.to_ghost(None));
                ghosts += 1;
            }
        }

        tracing::info!(
            "📑 Partition at sector {}: {} records ({} damaged, {} from index entries)",
            partition.mft_sector,
            records.len(),
            records.values().filter(|r| r.is_damaged()).count(),
            ghosts
        );

        Ok(ParseOutcome { records, positions })
    }

    /// Pieces of the table to read, bounded by the image and the evidence
    fn table_layout(&self, candidate: &PartitionCandidate) -> Vec<Segment> {
        let partition = &candidate.partition;
        let record_size = partition.record_size as u64;
        let base = partition.mft_sector * SECTOR_SIZE;
        let image_len = self.image.len();
        let image_slots = |offset: u64| image_len.saturating_sub(offset) / record_size;

        let hinted = candidate
            .highest_hit_record()
            .map_or(0, |n| n + 1)
            .max(self.config.mirror_records);

        let mft = self
            .image
            .read_at(base, record_size as usize)
            .ok()
            .and_then(|raw| parse_file_record(raw).ok());
        let declared = mft.as_ref().map_or(0, |parsed| parsed.data_size() / record_size);
        let limit = hinted.max(declared);

        if let (Some(parsed), Some(start), Some(cluster_size)) =
            (&mft, partition.start_offset_bytes(), partition.cluster_size())
        {
            let runs = parsed.data_runs(Some(cluster_size));
            let mapped = !runs.is_empty()
                && runs
                    .iter()
                    .all(|run| matches!(run.kind, RunKind::Extent | RunKind::Sparse));
            if mapped {
                let mut segments = Vec::new();
                let mut cursor = 0u64;
                for run in runs {
                    if cursor >= limit {
                        break;
                    }
                    let slots = (run.length / record_size).min(limit - cursor);
                    if run.kind == RunKind::Extent {
                        match start.checked_add(run.offset).filter(|&offset| offset < image_len) {
                            Some(byte_offset) => segments.push(Segment {
                                first_slot: cursor,
                                byte_offset,
                                slots: slots.min(image_slots(byte_offset)),
                            }),
                            None => tracing::debug!(
                                "$MFT run at cluster offset {} lies outside the image",
                                run.offset
                            ),
                        }
                    }
                    cursor += slots;
                }
                if segments.first().map(|s| s.byte_offset) == Some(base) {
                    return segments;
                }
                tracing::debug!("$MFT runlist does not start at the table, ignoring it");
            }
        }

        vec![Segment {
            first_slot: MFT_RECORD,
            byte_offset: base,
            slots: limit.min(image_slots(base)),
        }]
    }

    fn decode_slot(&self, slot: &Slot, record_size: u64, placement: Placement) -> Option<Decoded> {
        let sector = Some(slot.sector());
        let raw = match self.image.read_at(slot.byte_offset, record_size as usize) {
            Ok(raw) => raw,
            Err(err) => {
                self.warnings.report(&err);
                return Some(Decoded {
                    record: damaged_record(slot.id, slot.source, sector, format!("unreadable: {}", err)),
                    entries: Vec::new(),
                    link: None,
                });
            }
        };

        if raw.iter().all(|&b| b == 0) {
            return None;
        }

        match parse_file_record(raw) {
            Ok(parsed) => {
                if let Some(number) = parsed.header.as_ref().and_then(|h| h.record_number) {
                    if number as u64 != slot.id {
                        tracing::debug!(
                            "Slot {} holds a record numbered {}, keeping slot number",
                            slot.id,
                            number
                        );
                    }
                }
                let record = parsed.to_file_record(slot.id, slot.source, sector, placement.cluster_size);
                let entries = parsed
                    .index_entries
                    .iter()
                    .filter(|entry| entry.file_name.parent == slot.id)
                    .cloned()
                    .collect();
                let link = self.link_of(slot.id, parsed, placement);
                Some(Decoded { record, entries, link })
            }
            Err(reason) => {
                self.warnings.report(&RebuildError::CorruptRecord {
                    id: slot.id,
                    reason: reason.clone(),
                });
                Some(Decoded {
                    record: damaged_record(slot.id, slot.source, sector, reason),
                    entries: Vec::new(),
                    link: None,
                })
            }
        }
    }

    fn link_of(&self, id: u64, parsed: ParsedRecord, placement: Placement) -> Option<Link> {
        if let Some(base) = parsed.base_record().filter(|&base| base != id) {
            return Some(Link::Extension {
                base,
                data: parsed.data,
                file_names: parsed.file_names,
                compressed: parsed.compressed,
            });
        }

        let entries = match parsed.attribute_list.as_ref()? {
            AttributeList::Resident(entries) => entries.clone(),
            AttributeList::NonResident { real_size, runs } => {
                self.read_attribute_list(id, *real_size, runs, placement)
            }
        };
        let holders: BTreeSet<u64> = entries
            .iter()
            .filter(|entry| matches!(entry.type_code, ATTR_DATA | ATTR_FILE_NAME))
            .map(|entry| entry.file_ref)
            .filter(|&holder| holder != id)
            .collect();
        if holders.is_empty() {
            return None;
        }
        Some(Link::Listed {
            data: parsed.data,
            compressed: parsed.compressed,
            holders,
        })
    }

    /// Read a list stored in clusters. Needs the partition placement.
    fn read_attribute_list(
        &self,
        id: u64,
        real_size: u64,
        runs: &[RawRun],
        placement: Placement,
    ) -> Vec<AttributeListEntry> {
        let (Some(start), Some(cluster_size)) = (placement.start, placement.cluster_size) else {
            tracing::debug!("Record #{} keeps its attribute list in clusters, geometry unknown", id);
            return Vec::new();
        };

        let wanted = real_size.min(MAX_ATTRIBUTE_LIST);
        let mut content = Vec::new();
        for run in runs {
            if content.len() as u64 >= wanted {
                break;
            }
            let Some(lcn) = run.lcn else {
                break;
            };
            let Some(offset) = lcn
                .checked_mul(cluster_size)
                .and_then(|bytes| bytes.checked_add(start))
            else {
                break;
            };
            let length = run
                .clusters
                .saturating_mul(cluster_size)
                .min(wanted - content.len() as u64);
            match self.image.read_at(offset, length as usize) {
                Ok(bytes) => content.extend_from_slice(bytes),
                Err(err) => {
                    tracing::debug!("Attribute list of record #{} unreadable: {}", id, err);
                    break;
                }
            }
        }
        parse_attribute_list(&content)
    }
}

/// Fold extension records into the base records whose attribute list names
/// them. Absorbed extension records are removed. Returns the number of base
/// records rebuilt.
fn join_extensions(
    records: &mut BTreeMap<u64, FileRecord>,
    mut links: BTreeMap<u64, Link>,
    cluster_size: Option<u64>,
) -> usize {
    let listed: Vec<u64> = links
        .iter()
        .filter(|(_, link)| matches!(link, Link::Listed { .. }))
        .map(|(&id, _)| id)
        .collect();

    let mut joined = 0;
    for base_id in listed {
        if !records.get(&base_id).is_some_and(|r| r.is_valid()) {
            continue;
        }
        let Some(Link::Listed {
            mut data,
            mut compressed,
            holders,
        }) = links.remove(&base_id)
        else {
            continue;
        };

        let mut file_names = Vec::new();
        let mut absorbed = Vec::new();
        for holder in holders {
            match links.get(&holder) {
                Some(Link::Extension {
                    base,
                    data: pieces,
                    file_names: names,
                    compressed: packed,
                }) if *base == base_id => {
                    data.extend(pieces.iter().cloned());
                    file_names.extend(names.iter().cloned());
                    compressed |= packed;
                    absorbed.push(holder);
                }
                _ => tracing::debug!("Extension record #{} of #{} not found", holder, base_id),
            }
        }
        if absorbed.is_empty() {
            continue;
        }

        if let Some(record) = records.get_mut(&base_id) {
            record.size = stream_size(&data);
            record.data_runs = stream_runs(&data, cluster_size);
            record.compressed = compressed;
            if record.name.is_empty() {
                if let Some(best) = best_file_name(&file_names) {
                    record.name = best.name.clone();
                    record.parent = Some(best.parent);
                    record.is_directory |= best.is_directory();
                }
            }
        }
        for holder in absorbed {
            links.remove(&holder);
            records.remove(&holder);
        }
        joined += 1;
    }
    joined
}

/// A decoded `INDX` block and where it was found
#[derive(Debug, Clone)]
pub struct IndexBlock {
    pub sector: u64,
    pub entries: Vec<IndexEntry>,
}

impl IndexBlock {
    /// Directory the block most likely belongs to
    pub fn owner(&self) -> Option<u64> {
        index::dominant_parent(&self.entries)
    }
}

/// Decode the `INDX` blocks found by the scanner; empty and malformed blocks
/// are dropped
pub fn read_index_blocks(image: &dyn ImageSource, indx_hits: &BTreeSet<u64>) -> Vec<IndexBlock> {
    indx_hits
        .par_iter()
        .filter_map(|&sector| {
            let raw = image
                .read_clamped(sector.checked_mul(SECTOR_SIZE)?, DEFAULT_INDEX_BLOCK_SIZE as usize)
                .ok()?;
            match index::parse_indx_record(raw) {
                Ok(entries) if !entries.is_empty() => Some(IndexBlock { sector, entries }),
                Ok(_) => None,
                Err(reason) => {
                    tracing::debug!("INDX block at sector {} skipped: {}", sector, reason);
                    None
                }
            }
        })
        .collect()
}

/// Add ghost records from `INDX` blocks found by the scanner. A block is
/// attributed to the single partition where its dominant parent is a real
/// directory; ambiguous blocks are skipped. Returns the number of ghosts added.
pub fn attach_index_blocks(blocks: &[IndexBlock], partitions: &mut [Partition]) -> usize {
    let mut added = 0;
    for block in blocks {
        let Some(parent) = block.owner() else {
            continue;
        };
        let owners: Vec<usize> = partitions
            .iter()
            .enumerate()
            .filter(|(_, p)| {
                p.records
                    .get(&parent)
                    .is_some_and(|r| r.is_valid() && r.is_directory && !r.is_ghost)
            })
            .map(|(i, _)| i)
            .collect();
        let [owner] = owners.as_slice() else {
            continue;
        };

        let records = &mut partitions[*owner].records;
        for entry in block.entries.iter().filter(|e| e.file_name.parent == parent) {
            let ghost = entry.to_ghost(Some(block.sector));
            match records.remove(&ghost.id) {
                Some(existing) => {
                    records.insert(ghost.id, merge_known(existing, ghost));
                }
                None => {
                    records.insert(ghost.id, ghost);
                    added += 1;
                }
            }
        }
    }

    if added > 0 {
        tracing::info!("👻 {} ghost records recovered from index blocks", added);
    }
    added
}
