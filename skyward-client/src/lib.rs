//! # skyward Update Client
//!
//! Library side of the `skyward-updater` daemon. The [`update`] module holds
//! the orchestrator and everything it drives; [`config`] and [`daemon`] wire
//! it to a device.

pub mod cli;
pub mod config;
pub mod daemon;
pub mod update;

pub use config::Config;
pub use update::{Orchestrator, OrchestratorHandle, StatusEvent, UpdateStatus};
