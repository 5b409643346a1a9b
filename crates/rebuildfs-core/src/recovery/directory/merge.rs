//! Combining several copies of the same record.

use crate::config::MirrorPolicy;
use crate::FileRecord;

/// Merge the primary and mirror copies of one record
pub fn merge_copies(
    primary: Option<FileRecord>,
    mirror: Option<FileRecord>,
    policy: MirrorPolicy,
) -> Option<FileRecord> {
    match (primary, mirror) {
        (None, None) => None,
        (Some(record), None) | (None, Some(record)) => Some(record),
        (Some(primary), Some(mirror)) => Some(match (primary.is_valid(), mirror.is_valid()) {
            (true, false) | (false, false) => primary,
            (false, true) => mirror,
            (true, true) => match policy {
                MirrorPolicy::PreferPrimary => primary,
                MirrorPolicy::PreferMirror => mirror,
                MirrorPolicy::FillGaps => fill_gaps(primary, &mirror),
            },
        }),
    }
}

/// Primary wins field by field; the mirror only supplies what is missing
fn fill_gaps(mut primary: FileRecord, mirror: &FileRecord) -> FileRecord {
    if primary.name.is_empty() {
        primary.name = mirror.name.clone();
    }
    if primary.parent.is_none() {
        primary.parent = mirror.parent;
    }
    primary.timestamps.fill_from(&mirror.timestamps);
    if primary.size == 0 && mirror.size > 0 {
        primary.size = mirror.size;
    }
    if primary.data_runs.is_empty() {
        primary.data_runs = mirror.data_runs.clone();
    }
    if primary.index_clusters.is_empty() {
        primary.index_clusters = mirror.index_clusters.clone();
    }
    primary
}

fn evidence_rank(record: &FileRecord) -> u8 {
    match (record.is_valid(), record.is_ghost) {
        (true, false) => 2,
        (true, true) => 1,
        (false, _) => 0,
    }
}

/// Keep whichever copy carries stronger evidence: a real record beats a
/// ghost, a ghost beats a damaged placeholder. Ties keep `existing`, so
/// merging the same record twice changes nothing.
pub fn merge_known(existing: FileRecord, incoming: FileRecord) -> FileRecord {
    if evidence_rank(&incoming) > evidence_rank(&existing) {
        incoming
    } else {
        existing
    }
}
