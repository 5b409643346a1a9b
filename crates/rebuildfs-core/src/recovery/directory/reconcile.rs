//! NTFS tree reconciliation.
//!
//! Records are attached under their declared parent in passes until nothing
//! changes. Each pass decides in parallel from a read-only snapshot and the
//! decisions are applied afterwards, so the result does not depend on thread
//! scheduling. Whatever is left keeps its internal shape and is hung under
//! Lost Files; parent-pointer cycles are cut at their lowest identity.

use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;

use super::{DirectoryReconstructor, DirectoryTree, ReconstructionStats};
use crate::error::{RebuildError, WarningKind, WarningSink};
use crate::{FileRecord, LOST_FILES_ID};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    OnPath,
    Done,
}

/// Every parent-pointer cycle among `valid`, each listed from the record
/// where the walk entered it. Each record is stepped over once.
fn find_cycles(valid: &BTreeMap<u64, &FileRecord>, root_id: u64) -> Vec<Vec<u64>> {
    let mut marks: HashMap<u64, Mark> = HashMap::with_capacity(valid.len());
    let mut cycles = Vec::new();

    for &start in valid.keys() {
        if marks.contains_key(&start) {
            continue;
        }
        let mut path = Vec::new();
        let mut current = Some(start);
        while let Some(id) = current {
            match marks.get(&id) {
                Some(Mark::Done) => break,
                Some(Mark::OnPath) => {
                    if let Some(at) = path.iter().position(|&member| member == id) {
                        cycles.push(path[at..].to_vec());
                    }
                    break;
                }
                None => {}
            }
            let Some(record) = valid.get(&id).filter(|_| id != root_id) else {
                break;
            };
            marks.insert(id, Mark::OnPath);
            path.push(id);
            current = record.parent;
        }
        for id in path {
            marks.insert(id, Mark::Done);
        }
    }

    cycles
}

/// Build the directory tree of a record set
pub fn reconcile(
    records: &BTreeMap<u64, FileRecord>,
    root_id: u64,
    warnings: &WarningSink,
) -> (DirectoryTree, ReconstructionStats) {
    let mut stats = ReconstructionStats::default();

    let valid: BTreeMap<u64, &FileRecord> = records
        .iter()
        .filter(|(&id, r)| r.is_valid() && id != root_id && id != LOST_FILES_ID)
        .map(|(&id, r)| (id, r))
        .collect();
    stats.total_entries = valid.len();

    let mut cycles = find_cycles(&valid, root_id);
    let cyclic: HashSet<u64> = cycles.iter().flatten().copied().collect();

    // Fixpoint: attach every record whose parent is already placed
    let mut placed: HashSet<u64> = HashSet::from([root_id]);
    let mut parent_of: BTreeMap<u64, u64> = BTreeMap::new();
    let mut pending: Vec<u64> = valid.keys().copied().collect();
    let mut passes = 0usize;
    loop {
        let ready: Vec<(u64, u64)> = pending
            .par_iter()
            .filter(|&&id| !cyclic.contains(&id))
            .filter_map(|&id| {
                let parent = valid[&id].parent?;
                placed.contains(&parent).then_some((id, parent))
            })
            .collect();
        if ready.is_empty() {
            break;
        }
        passes += 1;
        for &(id, parent) in &ready {
            placed.insert(id);
            parent_of.insert(id, parent);
        }
        pending.retain(|id| !placed.contains(id));
    }
    tracing::debug!("Reconciled {} records in {} passes", parent_of.len(), passes);

    // Remaining records: cut every cycle at its lowest identity
    let remaining: BTreeSet<u64> = pending.into_iter().collect();
    cycles.sort_by_key(|members| members.iter().min().copied());
    let mut cuts = BTreeSet::new();
    for members in &cycles {
        if let Some(&lowest) = members.iter().min() {
            warnings.report(&RebuildError::CycleDetected { id: lowest });
            cuts.insert(lowest);
            stats.cycles_broken += 1;
        }
    }

    let mut lost_tops = BTreeSet::new();
    for &id in &remaining {
        match valid[&id].parent {
            Some(parent) if !cuts.contains(&id) && remaining.contains(&parent) => {
                parent_of.insert(id, parent);
            }
            _ => {
                lost_tops.insert(id);
            }
        }
    }

    // Shape is final: create nodes and attach in identity order
    let mut tree = DirectoryTree::new(root_id);
    if records.get(&root_id).is_some_and(|r| r.is_valid()) {
        tree.set_root_record();
        stats.root_id = Some(root_id);
    }

    for (&id, record) in &valid {
        tree.add_record(id, record.display_name());
    }

    for &id in valid.keys() {
        let parent_node = if lost_tops.contains(&id) {
            Some(tree.lost())
        } else {
            parent_of.get(&id).and_then(|&p| tree.get(p))
        };
        let (Some(child), Some(parent_node)) = (tree.get(id), parent_node) else {
            continue;
        };
        if let Some(previous) = tree.attach(child, parent_node) {
            stats.renamed += 1;
            warnings.warn(
                WarningKind::NameCollision,
                format!(
                    "Renamed #{} from {} to {}",
                    id,
                    previous,
                    tree.node(child).name
                ),
            );
        }
    }

    stats.attached = tree.descendant_count(tree.root());
    stats.lost = tree.descendant_count(tree.lost());

    tracing::info!(
        "🌳 Tree rebuilt: {} under root, {} in Lost Files, {} cycles broken",
        stats.attached,
        stats.lost,
        stats.cycles_broken
    );

    (tree, stats)
}

/// NTFS directory reconstructor
pub struct NtfsReconstructor {
    root_id: u64,
    warnings: WarningSink,
    tree: DirectoryTree,
    stats: ReconstructionStats,
}

impl NtfsReconstructor {
    pub fn new(root_id: u64, warnings: WarningSink) -> Self {
        Self {
            root_id,
            warnings,
            tree: DirectoryTree::new(root_id),
            stats: ReconstructionStats::default(),
        }
    }

    pub fn tree(&self) -> &DirectoryTree {
        &self.tree
    }
}

impl DirectoryReconstructor for NtfsReconstructor {
    fn reconstruct(&mut self, records: &BTreeMap<u64, FileRecord>) -> DirectoryTree {
        let (tree, stats) = reconcile(records, self.root_id, &self.warnings);
        self.tree = tree;
        self.stats = stats;
        self.tree.clone()
    }

    fn reconstruct_path(&self, id: u64) -> Option<PathBuf> {
        self.tree
            .get(id)
            .map(|node| PathBuf::from(self.tree.full_path(node)))
    }

    fn get_filename(&self, id: u64) -> Option<String> {
        self.tree.get(id).map(|node| self.tree.node(node).name.clone())
    }

    fn stats(&self) -> ReconstructionStats {
        self.stats.clone()
    }
}
