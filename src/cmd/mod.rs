//! CLI command implementations.
//!
//! | Module    | Commands handled            |
//! |-----------|-----------------------------|
//! | `project` | `Init`                      |
//! | `run`     | `Run`, `Resume`             |
//! | `status`  | `Status`, `Pause`           |
//! | `config`  | `Config`                    |

pub mod config;
pub mod project;
pub mod run;
pub mod status;

pub use config::cmd_config;
pub use project::cmd_init;
pub use run::{cmd_resume, cmd_run};
pub use status::{cmd_pause, cmd_status};
