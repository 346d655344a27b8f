//! # skyward Power Gate
//!
//! Decides whether the device has enough charge to start or continue an
//! update, and publishes that decision as a subscribable boolean.
//!
//! ```text
//! BatterySource ──read──▶ PowerGate ──watch<bool>──▶ orchestrator
//!  (sysfs / manual)        + PowerPolicy
//! ```

pub mod error;
pub mod gate;
pub mod policy;
pub mod source;

pub use error::{PowerError, Result};
pub use gate::PowerGate;
pub use policy::PowerPolicy;
pub use source::{BatteryReading, BatterySource, ManualBattery, SysfsBattery};
