//! Reconstruction: directory trees, classification, the pipeline driver and
//! restore of recovered content
pub mod classify;
pub mod directory;
pub mod engine;
pub mod restore;

pub use classify::{classify, record_stats, RecordStats};

pub use directory::{DirectoryTree, NodeId, NodeKind, ReconstructionStats, TreeNode};

pub use engine::{Engine, ScanProgress, ScanReport, ScanStage};

pub use restore::{RestoreReport, RestoredFile};
