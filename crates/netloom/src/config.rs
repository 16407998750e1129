//! Engine-level configuration. The declarative model description is
//! consumed as an already-parsed JSON tree; these are the top-level keys
//! the engine itself cares about.

use serde::{Deserialize, Serialize};

use crate::time::TickScale;
use crate::Error;

fn default_total_timeline() -> u32 {
    1
}

/// Top-level engine options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of timelines (logical processes / worker threads).
    #[serde(default = "default_total_timeline")]
    pub total_timeline: u32,

    /// Log base 10 of clock ticks per second (0 = second ticks, 6 =
    /// microsecond ticks).
    #[serde(default)]
    pub tick_per_second: u32,

    /// Simulated run time in seconds. Required, must be positive.
    pub run_time: f64,

    /// Model seed; 0 selects OS entropy, anything else is fully
    /// deterministic.
    #[serde(default)]
    pub seed: u32,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.total_timeline == 0 {
            return Err(Error::Config("total_timeline must be at least 1".into()));
        }
        if self.run_time <= 0.0 {
            return Err(Error::Config(format!(
                "run_time ({}) must be positive",
                self.run_time
            )));
        }
        Ok(())
    }

    pub fn scale(&self) -> TickScale {
        TickScale::new(self.tick_per_second)
    }

    /// The configured seed, `None` when 0 (OS entropy).
    pub fn seed(&self) -> Option<u64> {
        (self.seed != 0).then_some(self.seed as u64)
    }
}
