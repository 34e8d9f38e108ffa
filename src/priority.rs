//! Priority levels and the timeslices they buy.
//!
//! Priority never changes a thread's place in the run queue. It only sets how
//! long the thread may run before the preemption timer fires. Each level is
//! worth half a tick on average: odd levels map to a whole number of ticks,
//! even levels alternate between the two neighbouring whole numbers so that
//! consecutive turns average out to the fractional value.

use crate::error::{ThreadError, ThreadResult};
use core::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    value: u8,
    alternate: bool,
}

impl Priority {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 10;
    pub const DEFAULT: u8 = 5;

    pub fn new(value: u8) -> ThreadResult<Self> {
        if !(Self::MIN..=Self::MAX).contains(&value) {
            return Err(ThreadError::InvalidPriority(value));
        }
        Ok(Self {
            value,
            alternate: false,
        })
    }

    pub fn value(&self) -> u8 {
        self.value
    }

    /// Changes the level, keeping the alternation phase.
    pub fn set(&mut self, value: u8) -> ThreadResult<()> {
        let updated = Self::new(value)?;
        self.value = updated.value;
        Ok(())
    }

    /// Timeslice for the thread's next turn.
    ///
    /// Even levels flip the alternation bit on every call, so this must be
    /// called exactly once per scheduling turn.
    pub fn timeslice(&mut self, tick: Duration) -> Duration {
        let half = u32::from(self.value / 2);
        if self.value % 2 == 1 {
            return tick * (half + 1);
        }

        self.alternate = !self.alternate;
        if self.alternate {
            tick * half
        } else {
            tick * (half + 1)
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self {
            value: Self::DEFAULT,
            alternate: false,
        }
    }
}
