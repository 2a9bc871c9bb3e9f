//! Stand-ins for the pad and the cameras, so the whole pipeline runs on a
//! machine with no devices attached.
//!
//! A [`SimulatedFloor`] has one pressure blob walking in a circle across
//! the 96x96 floor. Each [`SimulatedPad`] answers the real request with a
//! well-formed reply holding its own 48x48 slice of that floor, plus a
//! little noise.

use crate::capture_source::FrameGrabber;
use crate::error::CaptureError;
use crate::frame::Image;
use crate::grid::{Grid, MAP_SIZE, TILE_SIZE};
use crate::quadrant_aggregator::quadrant_origin;
use crate::sensor_link::SensorPort;
use crate::sensor_protocol::{encode_frame, REQUEST};

use log::debug;
use rand::prelude::*;
use std::{
    collections::VecDeque,
    f64::consts::PI,
    io,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

/// Peak cell value under the centre of the blob.
const BLOB_PEAK: f64 = 3000.0;

/// Blob radius in cells.
const BLOB_RADIUS: f64 = 10.0;

#[derive(Debug)]
pub struct SimulatedFloor {
    started: Instant,
    /// Time for one lap of the circle.
    lap: Duration,
    noise: u16,
}

impl Default for SimulatedFloor {
    fn default() -> Self {
        Self::new(Duration::from_secs(6), 20)
    }
}

impl SimulatedFloor {
    pub fn new(lap: Duration, noise: u16) -> Self {
        Self {
            started: Instant::now(),
            lap: lap.max(Duration::from_millis(1)),
            noise,
        }
    }

    /// Where the blob is `elapsed` after start, in map coordinates.
    pub fn blob_centre(&self, elapsed: Duration) -> (f64, f64) {
        let phase = elapsed.as_secs_f64() / self.lap.as_secs_f64() * 2.0 * PI;
        let mid = MAP_SIZE as f64 / 2.0;
        let radius = MAP_SIZE as f64 / 4.0;
        (mid + radius * phase.sin(), mid + radius * phase.cos())
    }

    /// The slice of the floor quadrant `q` sees at `elapsed`, noise-free.
    pub fn tile_at(&self, q: usize, elapsed: Duration) -> Grid {
        let (centre_row, centre_col) = self.blob_centre(elapsed);
        let (row0, col0) = quadrant_origin(q);
        let mut tile = Grid::zeroed(TILE_SIZE);
        for i in 0..TILE_SIZE {
            for j in 0..TILE_SIZE {
                let dr = (row0 + i) as f64 - centre_row;
                let dc = (col0 + j) as f64 - centre_col;
                let falloff = 1.0 - (dr * dr + dc * dc).sqrt() / BLOB_RADIUS;
                if falloff > 0.0 {
                    tile.set(i, j, (BLOB_PEAK * falloff) as u16);
                }
            }
        }
        tile
    }

    fn tile_now<R: Rng>(&self, q: usize, rng: &mut R) -> Grid {
        let mut tile = self.tile_at(q, self.started.elapsed());
        if self.noise > 0 {
            for i in 0..TILE_SIZE {
                for j in 0..TILE_SIZE {
                    let value = tile.get(i, j).saturating_add(rng.gen_range(0..=self.noise));
                    tile.set(i, j, value);
                }
            }
        }
        tile
    }
}

/// One simulated quadrant of the pad.
pub struct SimulatedPad {
    quadrant: usize,
    floor: Arc<SimulatedFloor>,
    rng: StdRng,
    rx: VecDeque<u8>,
}

impl SimulatedPad {
    pub fn new(quadrant: usize, floor: Arc<SimulatedFloor>) -> Self {
        Self {
            quadrant,
            floor,
            rng: StdRng::from_entropy(),
            rx: VecDeque::new(),
        }
    }
}

impl SensorPort for SimulatedPad {
    fn pending_input(&mut self) -> io::Result<usize> {
        Ok(self.rx.len())
    }

    fn discard_buffers(&mut self) -> io::Result<()> {
        self.rx.clear();
        Ok(())
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<()> {
        if buf == &REQUEST[..] {
            let tile = self.floor.tile_now(self.quadrant, &mut self.rng);
            self.rx.extend(encode_frame(&tile));
        } else {
            debug!("SimulatedPad {} : ignoring {} unknown bytes", self.quadrant, buf.len());
        }
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        if self.rx.is_empty() {
            thread::sleep(timeout);
            return Err(io::ErrorKind::TimedOut.into());
        }
        let n = buf.len().min(self.rx.len());
        for (dst, src) in buf.iter_mut().zip(self.rx.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

/// A grey test card with a bar sweeping across it, at a fixed frame rate.
pub struct SyntheticCamera {
    width: u32,
    height: u32,
    interval: Duration,
    next_due: Instant,
    count: u64,
}

impl SyntheticCamera {
    pub fn new(width: u32, height: u32, fps: f64) -> Self {
        let fps = if fps > 0.0 { fps } else { 60.0 };
        Self {
            width: width.max(1),
            height: height.max(1),
            interval: Duration::from_secs_f64(1.0 / fps),
            next_due: Instant::now(),
            count: 0,
        }
    }
}

impl FrameGrabber for SyntheticCamera {
    fn grab(&mut self) -> Result<Image, CaptureError> {
        let now = Instant::now();
        if self.next_due > now {
            thread::sleep(self.next_due - now);
        }
        self.next_due = self.next_due.max(now) + self.interval;

        let bar = (self.count % self.width as u64) as u32;
        self.count += 1;
        let mut pixels = Vec::with_capacity((self.width * self.height) as usize);
        for _row in 0..self.height {
            for col in 0..self.width {
                let shade = if col.abs_diff(bar) < 2 {
                    255
                } else {
                    (col * 128 / self.width) as u8
                };
                pixels.push(shade);
            }
        }
        Ok(Image {
            width: self.width,
            height: self.height,
            channels: 1,
            pixels,
            captured_at: Instant::now(),
        })
    }
}
