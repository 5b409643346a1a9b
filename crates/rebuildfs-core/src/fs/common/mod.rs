/// Shared image access primitives
mod types;

pub use types::*;
