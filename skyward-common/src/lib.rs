//! # skyward Common
//!
//! Shared utilities for the skyward update client crates.
//!
//! ## Logging
//!
//! ```rust,no_run
//! use skyward_common::{init_logging, TimedOperation};
//!
//! init_logging("info").unwrap();
//!
//! let op = TimedOperation::start("verify-payload");
//! // ... hash the payload ...
//! op.finish();
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json, TimedOperation};
