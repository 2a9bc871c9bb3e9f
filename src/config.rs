//! Session settings, loadable from a [ron] file.
//!
//! Every field has a default, so a file only needs to name what it
//! changes:
//!
//! ```text
//! (
//!     ports: (Some("/dev/ttyUSB0"), Some("/dev/ttyUSB1"), None, None),
//!     strategy: FullScan,
//!     delay_seconds: 1.5,
//! )
//! ```

use crate::capture_source::DEFAULT_CYCLE_INTERVAL;
use crate::dispatch::DEFAULT_DISPATCH_DEPTH;
use crate::error::ConfigError;
use crate::frame_synchronizer::{DEFAULT_PRESSURE_DIVISOR, DEFAULT_QUEUE_DEPTH};
use crate::mode_controller::{DEFAULT_FPS, DEFAULT_SCRUB_STEP};
use crate::playback_buffer::DEFAULT_CAPACITY;
use crate::quadrant_aggregator::{CorrectionTable, PollStrategy, DEFAULT_JOIN_TIMEOUT, QUADRANTS};
use crate::scheduler::DEFAULT_TICK_PERIOD;

use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf, time::Duration};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub tick_period_ms: u64,
    /// Nominal frame rate for delay arithmetic.
    pub fps: f64,
    pub buffer_capacity: usize,
    pub sync_queue_depth: usize,
    /// The pad is read every n-th tick.
    pub pressure_divisor: u64,
    pub scrub_step: i64,
    pub delay_seconds: f64,
    /// Serial device per quadrant; `None` leaves the quadrant empty.
    pub ports: [Option<PathBuf>; QUADRANTS],
    pub strategy: PollStrategy,
    pub join_timeout_ms: u64,
    /// Minimum spacing between two polling cycles of the pad.
    pub cycle_interval_ms: u64,
    pub corrections: CorrectionTable,
    /// How many messages a sink may lag before frames are dropped for it.
    pub dispatch_depth: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_period_ms: DEFAULT_TICK_PERIOD.as_millis() as u64,
            fps: DEFAULT_FPS,
            buffer_capacity: DEFAULT_CAPACITY,
            sync_queue_depth: DEFAULT_QUEUE_DEPTH,
            pressure_divisor: DEFAULT_PRESSURE_DIVISOR,
            scrub_step: DEFAULT_SCRUB_STEP,
            delay_seconds: 0.0,
            ports: Default::default(),
            strategy: PollStrategy::RoundRobin,
            join_timeout_ms: DEFAULT_JOIN_TIMEOUT.as_millis() as u64,
            cycle_interval_ms: DEFAULT_CYCLE_INTERVAL.as_millis() as u64,
            corrections: CorrectionTable::default(),
            dispatch_depth: DEFAULT_DISPATCH_DEPTH,
        }
    }
}

impl SessionConfig {
    pub fn from_ron(text: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = ron::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_ron(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.tick_period_ms > 0, "tick_period_ms must be positive"),
            (self.fps.is_finite() && self.fps > 0.0, "fps must be positive"),
            (self.buffer_capacity > 0, "buffer_capacity must be positive"),
            (self.sync_queue_depth > 0, "sync_queue_depth must be positive"),
            (self.pressure_divisor > 0, "pressure_divisor must be positive"),
            (self.scrub_step > 0, "scrub_step must be positive"),
            (
                self.delay_seconds.is_finite() && self.delay_seconds >= 0.0,
                "delay_seconds must not be negative",
            ),
            (self.dispatch_depth > 0, "dispatch_depth must be positive"),
        ];
        match checks.iter().find(|(ok, _)| !ok) {
            Some((_, reason)) => Err(ConfigError::Invalid((*reason).to_owned())),
            None => Ok(()),
        }
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }

    pub fn has_ports(&self) -> bool {
        self.ports.iter().any(Option::is_some)
    }
}
