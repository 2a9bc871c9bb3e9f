//! TreadCast captures camera images and floor-pressure maps side by side
//! and plays them back with a constant broadcast delay, freeze-and-scrub,
//! and slow-motion instant replay.
//!
//! The pressure pad is made of four 48x48 tiles, each on its own serial
//! port. Readings flow through the pipeline like so:
//!
//! ```text
//! SensorLink x4 -> QuadrantAggregator -> PressureSource --+
//!                                                         +-> FrameSynchronizer -> ModeController -> sinks
//!                             CameraSource (A, B) --------+
//! ```
//!
//! A [`Scheduler`](scheduler::Scheduler) drives the synchronizer and the
//! [`ModeController`](mode_controller::ModeController) at a fixed tick, and
//! the controller pushes whatever should be on screen to a
//! [`DisplaySink`](dispatch::DisplaySink) and, while recording, to a
//! [`RecordingSink`](dispatch::RecordingSink).

pub mod bounded_queue;
pub mod capture_source;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod frame_synchronizer;
pub mod grid;
pub mod mode_controller;
pub mod playback_buffer;
pub mod quadrant_aggregator;
pub mod scheduler;
pub mod sensor_link;
pub mod sensor_protocol;
pub mod session;
pub mod simulated;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks `mutex`, carrying on with the inner value if another thread
/// panicked while holding it. Every structure guarded this way stays
/// consistent between statements, so a poisoned lock is still usable.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
