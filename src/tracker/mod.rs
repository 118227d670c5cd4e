//! Version-control tracking: the git wrapper and the checkpoint chain built
//! on top of it.

pub mod checkpoint;
pub mod git;

pub use checkpoint::{CheckpointManager, Rollback};
pub use git::{GitTracker, METADATA_DIR, SECRETS_FILE};
