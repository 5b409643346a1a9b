//! Error and warning types shared by every stage of the reconstruction pipeline.
//!
//! Local failures (an unreadable sector, a damaged record, an extent pointing
//! past the end of the image) are never fatal. They are turned into
//! [`Warning`]s and pushed into a [`WarningSink`] so the caller can report them
//! once the operation completes. Only structurally fatal conditions are
//! returned as `Err`.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Errors produced by the reconstruction engine
#[derive(Debug, Error)]
pub enum RebuildError {
    #[error("cannot read {len} bytes at offset {offset}: {reason}")]
    ImageRead {
        offset: u64,
        len: u64,
        reason: String,
    },

    #[error("invalid {what} signature at sector {sector}")]
    InvalidSignature { sector: u64, what: &'static str },

    #[error("record #{id} is corrupt: {reason}")]
    CorruptRecord { id: u64, reason: String },

    #[error("attaching record #{id} would create a cycle")]
    CycleDetected { id: u64 },

    #[error("save-state version mismatch: found {found}, expected {expected}")]
    SaveStateVersionMismatch { found: String, expected: String },

    #[error("save-state is corrupt: {0}")]
    SaveStateCorrupt(String),

    #[error("save-state belongs to a different image ({0})")]
    FingerprintMismatch(String),

    #[error("extent of record #{id} at {offset}+{len} exceeds image length {image_len}")]
    OutOfBoundsExtent {
        id: u64,
        offset: u64,
        len: u64,
        image_len: u64,
    },

    #[error("image is empty")]
    EmptyImage,

    #[error("operation cancelled")]
    Cancelled,

    #[error("no partition with index {0}")]
    UnknownPartition(usize),

    #[error("no node with identity {0}")]
    UnknownNode(u64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RebuildError>;

/// Category of a non-fatal problem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarningKind {
    ImageRead,
    InvalidSignature,
    CorruptRecord,
    CycleDetected,
    OutOfBoundsExtent,
    NameCollision,
    Unsupported,
}

/// A non-fatal problem recorded during scanning, reconciliation or restore
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    pub kind: WarningKind,
    pub message: String,
}

impl Warning {
    pub fn new(kind: WarningKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&RebuildError> for Warning {
    fn from(err: &RebuildError) -> Self {
        let kind = match err {
            RebuildError::ImageRead { .. } => WarningKind::ImageRead,
            RebuildError::InvalidSignature { .. } => WarningKind::InvalidSignature,
            RebuildError::CorruptRecord { .. } => WarningKind::CorruptRecord,
            RebuildError::CycleDetected { .. } => WarningKind::CycleDetected,
            RebuildError::OutOfBoundsExtent { .. } => WarningKind::OutOfBoundsExtent,
            _ => WarningKind::Unsupported,
        };
        Warning::new(kind, err.to_string())
    }
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Thread-safe collector of warnings
///
/// Cloning the sink shares the underlying buffer, so parallel workers can
/// report into the same place.
#[derive(Debug, Clone, Default)]
pub struct WarningSink {
    inner: Arc<Mutex<Vec<Warning>>>,
}

impl WarningSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a warning and mirror it to the log
    pub fn push(&self, warning: Warning) {
        tracing::warn!("{}", warning);
        self.inner.lock().push(warning);
    }

    pub fn warn(&self, kind: WarningKind, message: impl Into<String>) {
        self.push(Warning::new(kind, message));
    }

    /// Record an error as a warning
    pub fn report(&self, err: &RebuildError) {
        self.push(Warning::from(err));
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Copy of the warnings recorded so far
    pub fn snapshot(&self) -> Vec<Warning> {
        self.inner.lock().clone()
    }

    /// Remove and return every recorded warning
    pub fn drain(&self) -> Vec<Warning> {
        std::mem::take(&mut *self.inner.lock())
    }

    pub fn count(&self, kind: WarningKind) -> usize {
        self.inner.lock().iter().filter(|w| w.kind == kind).count()
    }
}
