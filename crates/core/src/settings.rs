use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Minimum time between two geometry rebuilds of the same node. Zero
    /// disables throttling.
    pub throttle_ms: u64,
    pub max_passes: u32,
    pub round_epsilon: f32,
    pub tube_sides: u32,
    pub weld_tolerance: f32,
    pub fallback_color: [f32; 4],
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            throttle_ms: 0,
            max_passes: 4,
            round_epsilon: 1.0e-3,
            tube_sides: 6,
            weld_tolerance: 1.0e-5,
            fallback_color: [1.0, 1.0, 1.0, 1.0],
        }
    }
}

impl EngineSettings {
    pub fn throttle_window(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }
}
