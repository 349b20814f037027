//! Supervisor tunables.

use std::time::Duration;

/// Configuration for the supervision loop.
///
/// Passed once into [`crate::spawn`]; the loop never reads configuration
/// from anywhere else.
#[derive(Clone, Debug)]
pub struct SupervisionConfig {
    /// Ticks per second of the control loop.
    pub frequency: f64,
    /// Seconds without an acknowledged heartbeat before BAD becomes FAILED.
    pub grace_period: f64,
    /// Seconds without an acknowledged heartbeat before GOOD becomes BAD.
    pub ok_threshold: f64,
    /// Path prefix all agency keys live under.
    pub agency_prefix: String,
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            frequency: 1.0,
            grace_period: 5.0,
            ok_threshold: 1.5,
            agency_prefix: "/strata".to_string(),
        }
    }
}

impl SupervisionConfig {
    /// Wall-clock period of one tick.
    pub fn tick_period(&self) -> Duration {
        if self.frequency > 0.0 {
            Duration::from_secs_f64(1.0 / self.frequency)
        } else {
            Duration::from_secs(1)
        }
    }

    /// Absolute agency path for a prefix-relative one.
    pub fn prefixed(&self, path: &str) -> String {
        format!("{}{}", self.agency_prefix, path)
    }
}
