//! A uniform face over everything that produces data for a [`Frame`]:
//! cameras and the pressure pad.
//!
//! Every source acquires on its own worker thread and hands results over
//! through a small [`BoundedQueue`], so a slow device never holds up the
//! tick. Pulling from a source with [`CaptureSource::capture_frame`] never
//! blocks; "nothing new" is just `None`.
//!
//! [`Frame`]: crate::frame::Frame

use crate::bounded_queue::BoundedQueue;
use crate::error::CaptureError;
use crate::frame::Image;
use crate::grid::PressureMap;
use crate::quadrant_aggregator::QuadrantAggregator;
use crate::sensor_link::SensorPort;

use log::{debug, info, warn};
use serial2::SerialPort;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

/// Pressure maps waiting to be picked up. Older maps are dropped first.
pub const PRESSURE_HANDOFF_DEPTH: usize = 5;

/// Default minimum spacing between two polling cycles of the pad.
pub const DEFAULT_CYCLE_INTERVAL: Duration = Duration::from_millis(10);

/// Pause after a failed grab before trying the camera again.
const GRAB_RETRY_DELAY: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraSlot {
    A,
    B,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Camera(CameraSlot),
    Pressure,
}

/// One piece of a [`Frame`](crate::frame::Frame).
#[derive(Debug, Clone)]
pub enum Fragment {
    Image(Arc<Image>),
    Pressure(Arc<PressureMap>),
}

/// Something the [`FrameSynchronizer`](crate::frame_synchronizer::FrameSynchronizer)
/// can pull from once per tick.
pub trait CaptureSource: Send {
    fn name(&self) -> &str;

    fn kind(&self) -> SourceKind;

    /// Acquires the device and starts the acquisition loop. Starting a
    /// running source is a no-op.
    fn start(&mut self) -> Result<(), CaptureError>;

    /// Stops the acquisition loop. Returns only once the loop has exited
    /// and the device has been released.
    fn stop(&mut self);

    /// The next result, if one is ready. Never blocks.
    fn capture_frame(&mut self) -> Option<Fragment>;

    fn is_running(&self) -> bool;
}

/// Opens a device. Called on every [`CaptureSource::start`], so a stopped
/// source can be started again.
pub type Opener<T> = Box<dyn FnMut() -> Result<T, CaptureError> + Send>;

/// A background acquisition loop with a cooperative stop flag.
struct Worker {
    name: String,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn<F>(name: &str, body: F) -> Result<Self, CaptureError>
    where
        F: FnOnce(&AtomicBool) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let th_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || body(&th_stop))?;
        info!("{} : started.", name);

        Ok(Self {
            name: name.to_owned(),
            stop,
            handle: Some(handle),
        })
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("{} : worker panicked.", self.name);
            }
            info!("{} : terminated.", self.name);
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The pressure pad, polled through a [`QuadrantAggregator`].
///
/// The aggregator (and with it every serial port) is created on `start` and
/// dropped by the worker as it exits.
pub struct PressureSource<P: SensorPort + 'static = SerialPort> {
    name: String,
    open: Opener<QuadrantAggregator<P>>,
    handoff: Arc<BoundedQueue<Arc<PressureMap>>>,
    cycle_interval: Duration,
    worker: Option<Worker>,
}

impl<P: SensorPort + 'static> PressureSource<P> {
    pub fn new(name: &str, open: Opener<QuadrantAggregator<P>>) -> Self {
        Self {
            name: name.to_owned(),
            open,
            handoff: Arc::new(BoundedQueue::new(PRESSURE_HANDOFF_DEPTH)),
            cycle_interval: DEFAULT_CYCLE_INTERVAL,
            worker: None,
        }
    }

    /// Overrides [`DEFAULT_CYCLE_INTERVAL`].
    pub fn with_cycle_interval(mut self, cycle_interval: Duration) -> Self {
        self.cycle_interval = cycle_interval;
        self
    }
}

impl<P: SensorPort + 'static> fmt::Debug for PressureSource<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PressureSource")
            .field("name", &self.name)
            .field("queued", &self.handoff.len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl<P: SensorPort + 'static> CaptureSource for PressureSource<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Pressure
    }

    fn start(&mut self) -> Result<(), CaptureError> {
        if self.worker.is_some() {
            return Ok(());
        }
        let mut aggregator = (self.open)()?;
        let handoff = Arc::clone(&self.handoff);
        let interval = self.cycle_interval;
        let name = self.name.clone();

        self.worker = Some(Worker::spawn(&self.name, move |stop| {
            while !stop.load(Ordering::Acquire) {
                let started = Instant::now();
                if aggregator.poll_cycle().any_refreshed() {
                    let (map, _) = aggregator.combined_map();
                    if handoff.push(Arc::new(map)).is_some() {
                        debug!("{} : hand-off full, dropped oldest map", name);
                    }
                }
                if let Some(rest) = interval.checked_sub(started.elapsed()) {
                    thread::sleep(rest);
                }
            }
            drop(aggregator);
        })?);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
        self.handoff.clear();
    }

    fn capture_frame(&mut self) -> Option<Fragment> {
        self.handoff.pop().map(Fragment::Pressure)
    }

    fn is_running(&self) -> bool {
        self.worker.is_some()
    }
}

/// Anything that can produce camera images, one call at a time. A real
/// grabber blocks until the device has a new frame.
pub trait FrameGrabber: Send {
    fn grab(&mut self) -> Result<Image, CaptureError>;
}

/// A camera, keeping only the newest image it has grabbed.
pub struct CameraSource {
    name: String,
    slot: CameraSlot,
    open: Opener<Box<dyn FrameGrabber>>,
    latest: Arc<BoundedQueue<Arc<Image>>>,
    worker: Option<Worker>,
}

impl CameraSource {
    pub fn new(name: &str, slot: CameraSlot, open: Opener<Box<dyn FrameGrabber>>) -> Self {
        Self {
            name: name.to_owned(),
            slot,
            open,
            latest: Arc::new(BoundedQueue::new(1)),
            worker: None,
        }
    }
}

impl fmt::Debug for CameraSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CameraSource")
            .field("name", &self.name)
            .field("slot", &self.slot)
            .field("running", &self.is_running())
            .finish()
    }
}

impl CaptureSource for CameraSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Camera(self.slot)
    }

    fn start(&mut self) -> Result<(), CaptureError> {
        if self.worker.is_some() {
            return Ok(());
        }
        let mut grabber = (self.open)()?;
        let latest = Arc::clone(&self.latest);
        let name = self.name.clone();

        self.worker = Some(Worker::spawn(&self.name, move |stop| {
            while !stop.load(Ordering::Acquire) {
                match grabber.grab() {
                    Ok(image) => {
                        latest.push(Arc::new(image));
                    }
                    Err(e) => {
                        debug!("{} : {}", name, e);
                        thread::sleep(GRAB_RETRY_DELAY);
                    }
                }
            }
            drop(grabber);
        })?);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
        self.latest.clear();
    }

    fn capture_frame(&mut self) -> Option<Fragment> {
        self.latest.take_latest().map(Fragment::Image)
    }

    fn is_running(&self) -> bool {
        self.worker.is_some()
    }
}
