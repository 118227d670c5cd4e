//! The orchestrator: session state, its persistence, the watchdog and the
//! control loop that ties the roles, sandbox and checkpoints together.

pub mod runner;
pub mod state;
pub mod store;
pub mod watchdog;

pub use runner::{INITIAL_INSTRUCTIONS, LoopSettings, Orchestrator, RunReport};
pub use state::{Checkpoint, ScoreEntry, SessionState, Step};
pub use store::{StateStore, invalid_copy_path, read_state};
pub use watchdog::{Limits, Watchdog, WatchdogHandle};
