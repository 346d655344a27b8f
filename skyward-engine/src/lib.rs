//! # skyward Update Engine
//!
//! Uniform adapter over the platform mechanisms that write a verified
//! payload onto the device.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              UpdateEngine Trait             │
//! │  prepare / apply / cancel / status / ...    │
//! └────────────────────┬────────────────────────┘
//!                      │
//!           ┌──────────┴──────────┐
//!           ▼                     ▼
//!    ┌─────────────┐       ┌─────────────┐
//!    │  AbEngine   │       │ AOnlyEngine │
//!    └──────┬──────┘       └──────┬──────┘
//!           │                     │
//!   ApplyMechanism          RecoveryControl
//!   + BootControl
//! ```
//!
//! The variant is picked once at startup (see [`probe`]); every collaborator
//! has a command/file backed implementation and a mock in [`mock`].

pub mod a_only;
pub mod ab;
pub mod client;
pub mod error;
pub mod mock;
pub mod probe;
pub mod recovery;
pub mod traits;
pub mod types;

pub use a_only::AOnlyEngine;
pub use ab::AbEngine;
pub use client::ClientMechanism;
pub use error::{EngineError, Result};
pub use mock::{MockBootControl, MockMechanism, MockRecovery};
pub use probe::{detect_kind, probe_kind};
pub use recovery::{BootctlControl, FileRecoveryControl, RecoveryPaths};
pub use traits::{ApplyMechanism, BootControl, RecoveryControl, UpdateEngine};
pub use types::*;
