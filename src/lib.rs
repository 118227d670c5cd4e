pub mod agents;
pub mod audit;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod init;
pub mod logging;
pub mod orchestrator;
pub mod phase;
pub mod sandbox;
pub mod tracker;
pub mod util;
