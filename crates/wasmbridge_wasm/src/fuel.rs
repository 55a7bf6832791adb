//! Per-invocation instruction budget.
//!
//! Every executed instruction costs one unit. A meter is created fresh for
//! each metered call and read back afterwards for reporting.

use crate::trap::TrapKind;

/// Instruction budget for one invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuelMeter {
    budget: u64,
    used: u64,
}

impl FuelMeter {
    /// Meter with `budget` instructions
    #[must_use]
    pub const fn new(budget: u64) -> Self {
        Self { budget, used: 0 }
    }

    /// Charge one instruction
    ///
    /// # Errors
    ///
    /// Returns `Exhausted` once the budget is spent
    #[inline]
    pub fn tick(&mut self) -> Result<(), FuelError> {
        self.charge(1)
    }

    /// Charge `units` at once; nothing is charged on failure
    ///
    /// # Errors
    ///
    /// Returns `Exhausted` if fewer than `units` remain
    pub fn charge(&mut self, units: u64) -> Result<(), FuelError> {
        if units > self.remaining() {
            return Err(FuelError::Exhausted {
                budget: self.budget,
            });
        }
        self.used += units;
        Ok(())
    }

    /// Initial budget
    #[must_use]
    pub const fn budget(&self) -> u64 {
        self.budget
    }

    /// Units charged so far
    #[must_use]
    pub const fn consumed(&self) -> u64 {
        self.used
    }

    /// Units left
    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.budget - self.used
    }
}

/// Fuel errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FuelError {
    /// Budget spent
    #[error("Fuel budget of {budget} instructions exhausted")]
    Exhausted {
        /// Units the meter started with
        budget: u64,
    },
}

impl From<FuelError> for TrapKind {
    fn from(_: FuelError) -> Self {
        Self::OutOfFuel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_until_exhausted() {
        let mut meter = FuelMeter::new(3);
        for _ in 0..3 {
            meter.tick().unwrap();
        }
        assert_eq!(meter.consumed(), 3);
        assert_eq!(meter.remaining(), 0);
        assert_eq!(meter.tick(), Err(FuelError::Exhausted { budget: 3 }));
        assert_eq!(meter.consumed(), 3);
    }

    #[test]
    fn test_charge_is_all_or_nothing() {
        let mut meter = FuelMeter::new(10);
        meter.charge(7).unwrap();
        assert!(meter.charge(4).is_err());
        assert_eq!(meter.remaining(), 3);
        meter.charge(3).unwrap();
        assert_eq!(meter.budget(), 10);
    }

    #[test]
    fn test_zero_budget() {
        let mut meter = FuelMeter::new(0);
        assert_eq!(TrapKind::from(meter.tick().unwrap_err()), TrapKind::OutOfFuel);
    }
}
