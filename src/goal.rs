//! Daily goal latch
//!
//! Crossing the daily target is reported once per day, no matter how many
//! later samples are also above it.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalLatch {
    target: Option<u32>,
    reached: bool,
}

impl GoalLatch {
    pub fn new(target: Option<u32>) -> Self {
        Self {
            target: target.filter(|t| *t > 0),
            reached: false,
        }
    }

    /// Returns `true` only on the false -> true transition
    pub fn check(&mut self, steps: u32) -> bool {
        match self.target {
            Some(target) if !self.reached && steps >= target => {
                self.reached = true;
                true
            }
            _ => false,
        }
    }

    pub fn reset(&mut self) {
        self.reached = false;
    }

    pub fn is_reached(&self) -> bool {
        self.reached
    }

    pub fn target(&self) -> Option<u32> {
        self.target
    }
}
