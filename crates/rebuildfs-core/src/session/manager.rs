//! Save-state file handling

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::state::{ImageFingerprint, SaveState};
use crate::error::{RebuildError, Result};

/// Reads and atomically replaces the save-state file of a session
pub struct StateManager {
    path: PathBuf,
}

impl StateManager {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn read(&self) -> Result<SaveState> {
        let bytes = fs::read(&self.path)?;
        SaveState::load(&bytes)
    }

    /// Write to a sibling temp file, sync it, then rename it over the target
    pub fn write_atomic(&self, state: &SaveState) -> Result<()> {
        let bytes = state.save()?;
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state".to_string());
        let tmp = self.path.with_file_name(format!(".{}.tmp", file_name));

        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        tracing::debug!("Wrote {} bytes of state to {}", bytes.len(), self.path.display());
        Ok(())
    }

    /// The saved state, if there is one for this image. A state computed from
    /// another image is refused.
    pub fn load_for(&self, fingerprint: &ImageFingerprint) -> Result<Option<SaveState>> {
        if !self.exists() {
            return Ok(None);
        }
        let state = self.read()?;
        if !state.matches(fingerprint) {
            return Err(RebuildError::FingerprintMismatch(format!(
                "saved for {}, current image is {}",
                state.fingerprint, fingerprint
            )));
        }
        Ok(Some(state))
    }

    pub fn remove(&self) -> Result<()> {
        if self.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}
