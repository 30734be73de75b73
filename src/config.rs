//! Engine configuration
//!
//! Every field has a default, so an empty JSON object is a valid config.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Default fast-persistence mirror interval
pub const DEFAULT_FAST_PERSIST_MS: u64 = 7_500;
/// Default durable-store flush interval
pub const DEFAULT_DURABLE_FLUSH_MS: u64 = 30_000;
/// Default notification/widget refresh interval
pub const DEFAULT_SURFACE_REFRESH_MS: u64 = 7_500;
/// Default quiet period before the trailing refresh
pub const DEFAULT_DEBOUNCE_MS: u64 = 10_000;
/// Default interval stretch while power saving is active
pub const DEFAULT_POWER_SAVING_FACTOR: u32 = 2;
/// Largest accepted power-saving stretch
pub const MAX_POWER_SAVING_FACTOR: u32 = 100;
/// Default upper bound on how long the service sleeps between checks
pub const DEFAULT_IDLE_CHECK_MS: u64 = 60_000;

/// Unit used for the notification distance estimate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceUnit {
    #[default]
    Metric,
    Imperial,
}

impl DistanceUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceUnit::Metric => "km",
            DistanceUnit::Imperial => "mi",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub fast_persist_interval_ms: u64,
    pub durable_flush_interval_ms: u64,
    pub surface_refresh_interval_ms: u64,
    pub debounce_ms: u64,
    pub power_saving_factor: u32,
    /// Daily step target; `None` disables the goal latch
    pub daily_goal: Option<u32>,
    /// Body height used for the stride estimate
    pub height_cm: u32,
    pub distance_unit: DistanceUnit,
    pub idle_check_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fast_persist_interval_ms: DEFAULT_FAST_PERSIST_MS,
            durable_flush_interval_ms: DEFAULT_DURABLE_FLUSH_MS,
            surface_refresh_interval_ms: DEFAULT_SURFACE_REFRESH_MS,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            power_saving_factor: DEFAULT_POWER_SAVING_FACTOR,
            daily_goal: None,
            height_cm: 180,
            distance_unit: DistanceUnit::Metric,
            idle_check_ms: DEFAULT_IDLE_CHECK_MS,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a JSON config
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, EngineError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Load a config file
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn with_daily_goal(mut self, goal: Option<u32>) -> Self {
        self.daily_goal = goal;
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let intervals = [
            ("fast_persist_interval_ms", self.fast_persist_interval_ms),
            ("durable_flush_interval_ms", self.durable_flush_interval_ms),
            ("surface_refresh_interval_ms", self.surface_refresh_interval_ms),
            ("debounce_ms", self.debounce_ms),
            ("idle_check_ms", self.idle_check_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(EngineError::InvalidConfig(format!("{name} must be positive")));
            }
        }

        if !(1..=MAX_POWER_SAVING_FACTOR).contains(&self.power_saving_factor) {
            return Err(EngineError::InvalidConfig(format!(
                "power_saving_factor must be between 1 and {MAX_POWER_SAVING_FACTOR}"
            )));
        }

        if self.height_cm == 0 {
            return Err(EngineError::InvalidConfig("height_cm must be positive".to_string()));
        }

        Ok(())
    }
}
