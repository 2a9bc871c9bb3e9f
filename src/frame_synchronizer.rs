//! Fans in every registered [`CaptureSource`] once per tick and emits one
//! [`Frame`].
//!
//! Cameras are pulled every tick. The pad refreshes much slower than the
//! cameras, so the pressure source is only pulled every
//! `pressure_divisor` ticks; on the ticks in between the frame simply has
//! no pressure map. Assembled frames go onto a short queue that drops its
//! oldest entry when full.

use crate::bounded_queue::BoundedQueue;
use crate::capture_source::{CameraSlot, CaptureSource, Fragment, SourceKind};
use crate::error::CaptureError;
use crate::frame::Frame;

use log::{debug, warn};
use std::fmt;

/// Frames waiting to be consumed.
pub const DEFAULT_QUEUE_DEPTH: usize = 5;

/// The pressure source is pulled on every n-th tick.
pub const DEFAULT_PRESSURE_DIVISOR: u64 = 5;

pub struct FrameSynchronizer {
    sources: Vec<Box<dyn CaptureSource>>,
    queue: BoundedQueue<Frame>,
    pressure_divisor: u64,
    tick: u64,
    dropped: u64,
}

impl fmt::Debug for FrameSynchronizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.sources.iter().map(|s| s.name()).collect();
        f.debug_struct("FrameSynchronizer")
            .field("sources", &names)
            .field("tick", &self.tick)
            .field("queued", &self.queue.len())
            .field("dropped", &self.dropped)
            .finish()
    }
}

impl Default for FrameSynchronizer {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_DEPTH, DEFAULT_PRESSURE_DIVISOR)
    }
}

impl FrameSynchronizer {
    pub fn new(queue_depth: usize, pressure_divisor: u64) -> Self {
        Self {
            sources: Vec::new(),
            queue: BoundedQueue::new(queue_depth),
            pressure_divisor: pressure_divisor.max(1),
            tick: 0,
            dropped: 0,
        }
    }

    pub fn register(&mut self, source: Box<dyn CaptureSource>) {
        self.sources.push(source);
    }

    /// Starts every source. A source that fails to start is logged and
    /// left out; the others keep going. Returns the failures.
    pub fn start(&mut self) -> Vec<(String, CaptureError)> {
        let mut failures = Vec::new();
        for source in self.sources.iter_mut() {
            if let Err(e) = source.start() {
                warn!("{} : failed to start: {}", source.name(), e);
                failures.push((source.name().to_owned(), e));
            }
        }
        failures
    }

    /// Stops every source. When this returns, no source is capturing.
    pub fn stop(&mut self) {
        for source in self.sources.iter_mut() {
            source.stop();
        }
    }

    /// Ticks seen so far.
    pub fn ticks(&self) -> u64 {
        self.tick
    }

    /// Frames evicted from a full queue so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Pulls from every source and queues the resulting frame.
    pub fn tick(&mut self) {
        let pressure_due = self.tick % self.pressure_divisor == 0;
        let mut frame = Frame::empty(self.tick);

        for source in self.sources.iter_mut() {
            let kind = source.kind();
            if kind == SourceKind::Pressure && !pressure_due {
                continue;
            }
            match (kind, source.capture_frame()) {
                (SourceKind::Camera(CameraSlot::A), Some(Fragment::Image(image))) => {
                    frame.camera_a = Some(image)
                }
                (SourceKind::Camera(CameraSlot::B), Some(Fragment::Image(image))) => {
                    frame.camera_b = Some(image)
                }
                (SourceKind::Pressure, Some(Fragment::Pressure(map))) => frame.pressure = Some(map),
                (_, None) => {}
                (kind, Some(_)) => warn!(
                    "{} : {:?} source produced a mismatched fragment",
                    source.name(),
                    kind
                ),
            }
        }

        self.tick += 1;
        if self.queue.push(frame).is_some() {
            self.dropped += 1;
            debug!("Synchronizer : queue full, dropped oldest frame");
        }
    }

    /// Oldest queued frame.
    pub fn dequeue(&self) -> Option<Frame> {
        self.queue.pop()
    }

    /// Newest queued frame; anything older is discarded.
    pub fn take_latest(&self) -> Option<Frame> {
        self.queue.take_latest()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

impl Drop for FrameSynchronizer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Image;
    use crate::grid::{Grid, MAP_SIZE};
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
        time::Instant,
    };

    #[derive(Default)]
    struct Log {
        pulls: usize,
        running: bool,
    }

    /// A source with canned fragments and a shared log of how it was used.
    struct FakeSource {
        kind: SourceKind,
        fragments: VecDeque<Fragment>,
        log: Arc<Mutex<Log>>,
    }

    impl FakeSource {
        fn boxed(
            kind: SourceKind,
            fragments: Vec<Fragment>,
        ) -> (Box<dyn CaptureSource>, Arc<Mutex<Log>>) {
            let log = Arc::new(Mutex::new(Log::default()));
            let source = FakeSource {
                kind,
                fragments: fragments.into(),
                log: Arc::clone(&log),
            };
            (Box::new(source), log)
        }
    }

    impl CaptureSource for FakeSource {
        fn name(&self) -> &str {
            "fake"
        }
        fn kind(&self) -> SourceKind {
            self.kind
        }
        fn start(&mut self) -> Result<(), CaptureError> {
            crate::lock(&self.log).running = true;
            Ok(())
        }
        fn stop(&mut self) {
            crate::lock(&self.log).running = false;
        }
        fn capture_frame(&mut self) -> Option<Fragment> {
            crate::lock(&self.log).pulls += 1;
            self.fragments.pop_front()
        }
        fn is_running(&self) -> bool {
            crate::lock(&self.log).running
        }
    }

    fn image() -> Fragment {
        Fragment::Image(Arc::new(Image {
            width: 2,
            height: 2,
            channels: 1,
            pixels: vec![0; 4],
            captured_at: Instant::now(),
        }))
    }

    fn map() -> Fragment {
        Fragment::Pressure(Arc::new(Grid::zeroed(MAP_SIZE)))
    }

    #[test]
    fn pressure_is_pulled_every_fifth_tick() {
        let mut sync = FrameSynchronizer::new(64, 5);
        let (camera, camera_log) = FakeSource::boxed(
            SourceKind::Camera(CameraSlot::A),
            (0..12).map(|_| image()).collect(),
        );
        let (pad, pad_log) =
            FakeSource::boxed(SourceKind::Pressure, (0..12).map(|_| map()).collect());
        sync.register(camera);
        sync.register(pad);

        for _ in 0..11 {
            sync.tick();
        }
        assert_eq!(crate::lock(&camera_log).pulls, 11);
        assert_eq!(crate::lock(&pad_log).pulls, 3);

        let with_pressure: Vec<u64> = std::iter::from_fn(|| sync.dequeue())
            .filter(|f| f.pressure.is_some())
            .map(|f| f.sequence)
            .collect();
        assert_eq!(with_pressure, vec![0, 5, 10]);
    }

    #[test]
    fn empty_sources_give_empty_frames() {
        let mut sync = FrameSynchronizer::default();
        let (camera, _) = FakeSource::boxed(SourceKind::Camera(CameraSlot::B), vec![image()]);
        sync.register(camera);

        sync.tick();
        sync.tick();
        let first = sync.dequeue().unwrap();
        let second = sync.dequeue().unwrap();
        assert!(first.camera_b.is_some());
        assert!(first.camera_a.is_none());
        assert!(second.is_empty());
    }

    #[test]
    fn queue_drops_oldest() {
        let mut sync = FrameSynchronizer::default();
        for _ in 0..8 {
            sync.tick();
        }
        assert_eq!(sync.queued(), DEFAULT_QUEUE_DEPTH);
        assert_eq!(sync.dropped(), 3);
        assert_eq!(sync.dequeue().unwrap().sequence, 3);
        assert_eq!(sync.take_latest().unwrap().sequence, 7);
        assert_eq!(sync.queued(), 0);
    }

    #[test]
    fn start_and_stop_fan_out() {
        let mut sync = FrameSynchronizer::default();
        let (a, a_log) = FakeSource::boxed(SourceKind::Camera(CameraSlot::A), vec![]);
        let (p, p_log) = FakeSource::boxed(SourceKind::Pressure, vec![]);
        sync.register(a);
        sync.register(p);

        assert!(sync.start().is_empty());
        assert!(crate::lock(&a_log).running && crate::lock(&p_log).running);
        sync.stop();
        assert!(!crate::lock(&a_log).running && !crate::lock(&p_log).running);
    }
}
