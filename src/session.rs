//! Puts a whole pipeline together from a [`SessionConfig`] and takes it
//! apart again in a safe order.

use crate::capture_source::{CameraSlot, CameraSource, FrameGrabber, PressureSource};
use crate::config::SessionConfig;
use crate::dispatch::{display_dispatcher, recording_dispatcher, DisplaySink, RecordingSink};
use crate::error::{CaptureError, ConfigError};
use crate::frame_synchronizer::FrameSynchronizer;
use crate::mode_controller::{CommandHandle, ModeController, TickReport};
use crate::playback_buffer::PlaybackBuffer;
use crate::quadrant_aggregator::QuadrantAggregator;
use crate::scheduler::{Scheduler, TickGate, TickStats};
use crate::sensor_link::SensorLink;
use crate::simulated::{SimulatedFloor, SimulatedPad, SyntheticCamera};

use log::{info, warn};
use std::sync::{Arc, Mutex};

/// Size of the synthetic camera images.
const SYNTHETIC_WIDTH: u32 = 160;
const SYNTHETIC_HEIGHT: u32 = 120;

/// Where the data comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hardware {
    /// The serial ports named in the config. Camera capture is left to
    /// grabbers passed in by the caller.
    Serial,
    /// A simulated pad and two synthetic cameras.
    Simulated,
}

pub struct Session {
    scheduler: Option<Scheduler>,
    synchronizer: Arc<Mutex<FrameSynchronizer>>,
    controller: Arc<Mutex<ModeController>>,
    commands: CommandHandle,
    last_report: Arc<Mutex<Option<TickReport>>>,
    stats: Arc<TickStats>,
    failed_sources: Vec<String>,
}

impl Session {
    /// Builds every component, starts the sources and starts ticking.
    /// Sources that fail to start are logged and left out.
    pub fn start(
        config: &SessionConfig,
        hardware: Hardware,
        cameras: Vec<(CameraSlot, Box<dyn FrameGrabber>)>,
        display: Box<dyn DisplaySink>,
        recorder: Option<Box<dyn RecordingSink>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut synchronizer =
            FrameSynchronizer::new(config.sync_queue_depth, config.pressure_divisor);
        match hardware {
            Hardware::Serial => {
                register_serial_pad(&mut synchronizer, config);
                register_cameras(&mut synchronizer, cameras);
            }
            Hardware::Simulated => {
                register_simulated_pad(&mut synchronizer, config);
                if cameras.is_empty() {
                    register_cameras(&mut synchronizer, synthetic_cameras(config.fps));
                } else {
                    register_cameras(&mut synchronizer, cameras);
                }
            }
        }
        let failed_sources = synchronizer
            .start()
            .into_iter()
            .map(|(name, _)| name)
            .collect();

        let buffer = PlaybackBuffer::new(config.buffer_capacity);
        let mut controller = ModeController::new(buffer, config.fps)
            .with_delay(config.delay_seconds)
            .with_display(display_dispatcher(display, config.dispatch_depth));
        if let Some(recorder) = recorder {
            let recorder = recording_dispatcher(recorder, config.dispatch_depth);
            controller = controller.with_recorder(recorder);
        }
        let commands = controller.commands();

        let synchronizer = Arc::new(Mutex::new(synchronizer));
        let controller = Arc::new(Mutex::new(controller));
        let last_report = Arc::new(Mutex::new(None));

        let th_sync = Arc::clone(&synchronizer);
        let th_controller = Arc::clone(&controller);
        let th_report = Arc::clone(&last_report);
        let scheduler = Scheduler::spawn(config.tick_period(), Arc::new(TickGate::new()), move || {
            let latest = {
                let mut sync = crate::lock(&th_sync);
                sync.tick();
                sync.take_latest()
            };
            let report = crate::lock(&th_controller).tick(latest);
            *crate::lock(&th_report) = Some(report);
        });
        let stats = scheduler.stats();
        info!("Session : started ({:?})", hardware);

        Ok(Self {
            scheduler: Some(scheduler),
            synchronizer,
            controller,
            commands,
            last_report,
            stats,
            failed_sources,
        })
    }

    pub fn commands(&self) -> CommandHandle {
        self.commands.clone()
    }

    /// The report of the most recent tick.
    pub fn last_report(&self) -> Option<TickReport> {
        crate::lock(&self.last_report).clone()
    }

    pub fn tick_stats(&self) -> Arc<TickStats> {
        Arc::clone(&self.stats)
    }

    /// Names of the sources that did not start.
    pub fn failed_sources(&self) -> &[String] {
        &self.failed_sources
    }

    /// Stops ticking, then stops every source, then flushes the sinks.
    pub fn shutdown(&mut self) {
        let Some(mut scheduler) = self.scheduler.take() else {
            return;
        };
        scheduler.stop();
        crate::lock(&self.synchronizer).stop();
        crate::lock(&self.controller).close_sinks();
        info!("Session : shut down");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn register_serial_pad(synchronizer: &mut FrameSynchronizer, config: &SessionConfig) {
    if !config.has_ports() {
        warn!("Session : no serial ports configured, running without pressure");
        return;
    }
    let ports = config.ports.clone();
    let strategy = config.strategy;
    let corrections = config.corrections.clone();
    let join_timeout = config.join_timeout();
    let source = PressureSource::new(
        "pressure",
        Box::new(move || -> Result<_, CaptureError> {
            let aggregator = QuadrantAggregator::open(&ports, strategy, corrections.clone())
                .with_join_timeout(join_timeout);
            Ok(aggregator)
        }),
    )
    .with_cycle_interval(config.cycle_interval());
    synchronizer.register(Box::new(source));
}

fn register_simulated_pad(synchronizer: &mut FrameSynchronizer, config: &SessionConfig) {
    let strategy = config.strategy;
    let corrections = config.corrections.clone();
    let join_timeout = config.join_timeout();
    let source = PressureSource::new(
        "pressure (simulated)",
        Box::new(move || -> Result<_, CaptureError> {
            let floor = Arc::new(SimulatedFloor::default());
            let links = std::array::from_fn(|q| {
                Some(SensorLink::new(q, SimulatedPad::new(q, Arc::clone(&floor))))
            });
            let aggregator = QuadrantAggregator::new(links, strategy, corrections.clone())
                .with_join_timeout(join_timeout);
            Ok(aggregator)
        }),
    )
    .with_cycle_interval(config.cycle_interval());
    synchronizer.register(Box::new(source));
}

fn synthetic_cameras(fps: f64) -> Vec<(CameraSlot, Box<dyn FrameGrabber>)> {
    [CameraSlot::A, CameraSlot::B]
        .into_iter()
        .map(|slot| {
            let grabber: Box<dyn FrameGrabber> =
                Box::new(SyntheticCamera::new(SYNTHETIC_WIDTH, SYNTHETIC_HEIGHT, fps));
            (slot, grabber)
        })
        .collect()
}

/// Each grabber is handed over on the first start only; a camera started
/// a second time reports itself unavailable.
fn register_cameras(
    synchronizer: &mut FrameSynchronizer,
    cameras: Vec<(CameraSlot, Box<dyn FrameGrabber>)>,
) {
    for (slot, grabber) in cameras {
        let name = format!("camera {:?}", slot);
        let mut grabber = Some(grabber);
        let th_name = name.clone();
        let source = CameraSource::new(
            &name,
            slot,
            Box::new(move || {
                grabber.take().ok_or_else(|| {
                    CaptureError::HardwareUnavailable(format!("{} already released", th_name))
                })
            }),
        );
        synchronizer.register(Box::new(source));
    }
}
