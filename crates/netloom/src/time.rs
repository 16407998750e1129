//! The simulation clock: an integer tick count with a configurable
//! log-base-10 scale of ticks per second.

/// Simulated time, in ticks. All delays, timeouts, and schedule times are
/// integer ticks; the tick-to-second ratio is carried by [`TickScale`].
pub type Ltime = i64;

/// The time scale of the simulation clock, as log base 10 of the number of
/// clock ticks per second. A scale of 0 means one tick per second; a scale
/// of 6 means microsecond ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickScale(u32);

impl TickScale {
    pub fn new(log_ticks_per_sec: u32) -> Self {
        TickScale(log_ticks_per_sec)
    }

    pub fn log_ticks_per_sec(&self) -> u32 {
        self.0
    }

    /// Convert real-valued seconds to ticks, rounding to the nearest tick.
    pub fn d2t(&self, seconds: f64) -> Ltime {
        (seconds * 10f64.powi(self.0 as i32)).round() as Ltime
    }

    /// Convert ticks back to real-valued seconds.
    pub fn t2d(&self, ticks: Ltime) -> f64 {
        ticks as f64 / 10f64.powi(self.0 as i32)
    }
}

impl Default for TickScale {
    fn default() -> Self {
        TickScale(0)
    }
}
