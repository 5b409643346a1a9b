//! Directory reconstruction: rebuilding the hierarchy from loose records
//!
//! The tree is an arena of nodes addressed by [`NodeId`]. Two nodes are
//! always present: the primary root and the synthetic Lost Files directory
//! that collects everything which cannot be attached under the root.

pub mod merge;
mod reconcile;

pub use reconcile::{reconcile, NtfsReconstructor};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::{FileRecord, LOST_FILES_ID};

/// Display name of the primary root
pub const ROOT_NAME: &str = "Root";
/// Display name of the Lost Files directory
pub const LOST_FILES_NAME: &str = "LostFiles";

/// Statistics from directory reconstruction
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconstructionStats {
    /// Valid records considered
    pub total_entries: usize,
    /// Records reachable from the root
    pub attached: usize,
    /// Records under Lost Files
    pub lost: usize,
    /// Parent-pointer cycles that had to be cut
    pub cycles_broken: usize,
    /// Records renamed to resolve sibling collisions
    pub renamed: usize,
    /// Root identity if a real root record was found
    pub root_id: Option<u64>,
}

/// Common trait for directory reconstruction
pub trait DirectoryReconstructor {
    /// Build the tree for a record set
    fn reconstruct(&mut self, records: &BTreeMap<u64, FileRecord>) -> DirectoryTree;

    /// Reconstruct the full path for a record of the last tree built
    fn reconstruct_path(&self, id: u64) -> Option<PathBuf>;

    /// Get just the displayed name for a record of the last tree built
    fn get_filename(&self, id: u64) -> Option<String>;

    /// Get reconstruction statistics
    fn stats(&self) -> ReconstructionStats;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    /// A record of the partition
    Record(u64),
    /// Stand-in for a root record that is missing or damaged
    GhostRoot(u64),
    LostFiles,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    pub kind: NodeKind,
    /// Displayed name, unique among siblings
    pub name: String,
    pub parent: Option<NodeId>,
    pub children: BTreeMap<String, NodeId>,
}

impl TreeNode {
    pub fn identity(&self) -> u64 {
        match self.kind {
            NodeKind::Record(id) | NodeKind::GhostRoot(id) => id,
            NodeKind::LostFiles => LOST_FILES_ID,
        }
    }

    /// Synthetic nodes have no record behind them
    pub fn is_synthetic(&self) -> bool {
        !matches!(self.kind, NodeKind::Record(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryTree {
    nodes: Vec<TreeNode>,
    root: NodeId,
    lost: NodeId,
    root_id: u64,
    index: BTreeMap<u64, NodeId>,
}

impl DirectoryTree {
    /// Empty tree: a ghost root and an empty Lost Files directory
    pub fn new(root_id: u64) -> Self {
        let nodes = vec![
            TreeNode {
                kind: NodeKind::GhostRoot(root_id),
                name: ROOT_NAME.to_string(),
                parent: None,
                children: BTreeMap::new(),
            },
            TreeNode {
                kind: NodeKind::LostFiles,
                name: LOST_FILES_NAME.to_string(),
                parent: None,
                children: BTreeMap::new(),
            },
        ];
        Self {
            nodes,
            root: NodeId(0),
            lost: NodeId(1),
            root_id,
            index: BTreeMap::new(),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn lost(&self) -> NodeId {
        self.lost
    }

    pub fn root_id(&self) -> u64 {
        self.root_id
    }

    /// Whether the root stands in for a missing record
    pub fn has_ghost_root(&self) -> bool {
        matches!(self.node(self.root).kind, NodeKind::GhostRoot(_))
    }

    pub fn node(&self, id: NodeId) -> &TreeNode {
        &self.nodes[id.0]
    }

    /// Number of nodes, synthetic ones included
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when neither root has any child
    pub fn is_empty(&self) -> bool {
        self.node(self.root).children.is_empty() && self.node(self.lost).children.is_empty()
    }

    /// Node for an identity; the root and Lost Files identities map to the
    /// two top-level nodes
    pub fn get(&self, identity: u64) -> Option<NodeId> {
        if identity == LOST_FILES_ID {
            Some(self.lost)
        } else if identity == self.root_id {
            Some(self.root)
        } else {
            self.index.get(&identity).copied()
        }
    }

    pub fn identity(&self, id: NodeId) -> u64 {
        self.node(id).identity()
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    /// Children in name order
    pub fn children(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.node(id).children.values().copied()
    }

    /// Ancestors from the direct parent up to the top-level node
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut chain = Vec::new();
        let mut current = self.parent(id);
        while let Some(node) = current {
            if chain.len() > self.nodes.len() {
                break;
            }
            chain.push(node);
            current = self.parent(node);
        }
        chain
    }

    /// Slash-separated path from the top-level node, e.g. `Root/docs/a.txt`
    pub fn full_path(&self, id: NodeId) -> String {
        let mut parts: Vec<&str> = self
            .ancestors(id)
            .iter()
            .map(|&n| self.node(n).name.as_str())
            .collect();
        parts.reverse();
        parts.push(&self.node(id).name);
        parts.join("/")
    }

    /// Pre-order walk of the subtree at `id`, siblings in name order
    pub fn walk(&self, id: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut stack = vec![id];
        while let Some(node) = stack.pop() {
            order.push(node);
            let children: Vec<NodeId> = self.children(node).collect();
            stack.extend(children.into_iter().rev());
        }
        order
    }

    /// Pre-order walk of both top-level subtrees
    pub fn walk_all(&self) -> Vec<NodeId> {
        let mut order = self.walk(self.root);
        order.extend(self.walk(self.lost));
        order
    }

    /// Nodes below `id`, excluding `id` itself
    pub fn descendant_count(&self, id: NodeId) -> usize {
        self.walk(id).len() - 1
    }

    pub(crate) fn set_root_record(&mut self) {
        self.nodes[self.root.0].kind = NodeKind::Record(self.root_id);
    }

    pub(crate) fn add_record(&mut self, identity: u64, name: String) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(TreeNode {
            kind: NodeKind::Record(identity),
            name,
            parent: None,
            children: BTreeMap::new(),
        });
        self.index.insert(identity, id);
        id
    }

    /// Attach `child` under `parent`, renaming it with `_000`, `_001`, ...
    /// when the name is taken. Returns the previous name on rename.
    pub(crate) fn attach(&mut self, child: NodeId, parent: NodeId) -> Option<String> {
        let original = self.nodes[child.0].name.clone();
        let siblings = &self.nodes[parent.0].children;

        let mut name = original.clone();
        let mut suffix = 0u32;
        while siblings.contains_key(&name) {
            name = format!("{}_{:03}", original, suffix);
            suffix += 1;
        }

        self.nodes[parent.0].children.insert(name.clone(), child);
        self.nodes[child.0].parent = Some(parent);
        if name != original {
            self.nodes[child.0].name = name;
            Some(original)
        } else {
            None
        }
    }

    /// Verify the structural invariants: every record node hangs under
    /// exactly one parent, no node is its own ancestor, and every record
    /// appears once.
    pub fn check_invariants(&self) -> Result<(), String> {
        for (i, node) in self.nodes.iter().enumerate() {
            let id = NodeId(i);
            match node.parent {
                None if id != self.root && id != self.lost => {
                    return Err(format!("node {} ({}) has no parent", i, node.name));
                }
                Some(parent) if self.node(parent).children.get(&node.name) != Some(&id) => {
                    return Err(format!("node {} ({}) missing from its parent", i, node.name));
                }
                _ => {}
            }
            if self.ancestors(id).contains(&id) {
                return Err(format!("node {} ({}) is its own ancestor", i, node.name));
            }
        }

        let mut seen = std::collections::BTreeSet::new();
        for node in &self.nodes {
            if let NodeKind::Record(identity) = node.kind {
                if !seen.insert(identity) {
                    return Err(format!("record {} appears twice", identity));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_tree() {
        let tree = DirectoryTree::new(5);
        assert!(tree.is_empty());
        assert!(tree.has_ghost_root());
        assert_eq!(tree.get(5), Some(tree.root()));
        assert_eq!(tree.get(LOST_FILES_ID), Some(tree.lost()));
        assert_eq!(tree.identity(tree.lost()), LOST_FILES_ID);
        assert!(tree.check_invariants().is_ok());
    }

    #[test]
    fn test_attach_renames_collisions() {
        let mut tree = DirectoryTree::new(5);
        let root = tree.root();
        let a = tree.add_record(10, "a.txt".to_string());
        let b = tree.add_record(11, "a.txt".to_string());
        let c = tree.add_record(12, "a.txt".to_string());
        assert_eq!(tree.attach(a, root), None);
        assert_eq!(tree.attach(b, root), Some("a.txt".to_string()));
        tree.attach(c, root);

        assert_eq!(tree.node(b).name, "a.txt_000");
        assert_eq!(tree.node(c).name, "a.txt_001");
        assert_eq!(tree.full_path(c), "Root/a.txt_001");
        assert_eq!(tree.descendant_count(root), 3);
        assert!(tree.check_invariants().is_ok());
    }

    #[test]
    fn test_walk_order_and_ancestors() {
        let mut tree = DirectoryTree::new(5);
        let root = tree.root();
        let docs = tree.add_record(20, "docs".to_string());
        let b = tree.add_record(21, "b".to_string());
        let a = tree.add_record(22, "a".to_string());
        tree.attach(docs, root);
        tree.attach(b, docs);
        tree.attach(a, docs);

        assert_eq!(tree.walk(root), vec![root, docs, a, b]);
        assert_eq!(tree.ancestors(a), vec![docs, root]);
        assert_eq!(tree.full_path(a), "Root/docs/a");
    }
}
