//! Session persistence module
//!
//! This module provides JSON save-states for reconstructions, allowing users
//! to resume recovery operations and rescan only what is new.

pub mod manager;
pub mod state;

// Re-export main types
pub use manager::StateManager;
pub use state::{ImageFingerprint, SaveState, STATE_FORMAT, STATE_VERSION};
