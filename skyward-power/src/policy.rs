//! Charge thresholds for starting and continuing an update.

use serde::{Deserialize, Serialize};

use crate::source::BatteryReading;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerPolicy {
    /// Minimum level to start while discharging.
    pub min_start_percent: u8,
    /// Minimum level to start while charging.
    pub min_start_percent_charging: u8,
    /// Below this level a discharging device must stop.
    pub min_continue_percent: u8,
}

impl Default for PowerPolicy {
    fn default() -> Self {
        Self {
            min_start_percent: 30,
            min_start_percent_charging: 10,
            min_continue_percent: 15,
        }
    }
}

impl PowerPolicy {
    pub fn can_start(&self, reading: BatteryReading) -> bool {
        let required = if reading.charging {
            self.min_start_percent_charging
        } else {
            self.min_start_percent
        };
        reading.level >= required
    }

    /// A charging device may always continue.
    pub fn can_continue(&self, reading: BatteryReading) -> bool {
        reading.charging || reading.level >= self.min_continue_percent
    }

    /// Thresholds must be percentages and the continue threshold must not
    /// exceed the start threshold.
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("min_start_percent", self.min_start_percent),
            ("min_start_percent_charging", self.min_start_percent_charging),
            ("min_continue_percent", self.min_continue_percent),
        ] {
            if value > 100 {
                return Err(format!("{} must be at most 100, got {}", name, value));
            }
        }
        if self.min_continue_percent > self.min_start_percent {
            return Err(format!(
                "min_continue_percent ({}) must not exceed min_start_percent ({})",
                self.min_continue_percent, self.min_start_percent
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_thresholds() {
        let policy = PowerPolicy::default();
        assert!(!policy.can_start(BatteryReading::new(29, false)));
        assert!(policy.can_start(BatteryReading::new(30, false)));
        assert!(policy.can_start(BatteryReading::new(10, true)));
        assert!(!policy.can_start(BatteryReading::new(9, true)));
    }

    #[test]
    fn test_continue_thresholds() {
        let policy = PowerPolicy::default();
        assert!(!policy.can_continue(BatteryReading::new(9, false)));
        assert!(policy.can_continue(BatteryReading::new(9, true)));
        assert!(policy.can_continue(BatteryReading::new(15, false)));
    }

    #[test]
    fn test_validate() {
        assert!(PowerPolicy::default().validate().is_ok());

        let inverted = PowerPolicy {
            min_start_percent: 10,
            min_continue_percent: 20,
            ..PowerPolicy::default()
        };
        assert!(inverted.validate().is_err());

        let overflow = PowerPolicy {
            min_start_percent: 120,
            ..PowerPolicy::default()
        };
        assert!(overflow.validate().is_err());
    }
}
