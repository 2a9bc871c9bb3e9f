//! The unit of data that moves from the synchronizer to the playback
//! buffer and out to the sinks.

use crate::grid::PressureMap;

use std::{fmt, sync::Arc, time::Instant};

/// An 8-bit image as handed over by a camera grabber.
#[derive(Clone, PartialEq, Eq)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    /// Bytes per pixel (1 for grey, 3 for RGB).
    pub channels: u8,
    pub pixels: Vec<u8>,
    pub captured_at: Instant,
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Image({}x{}x{}, {} bytes)",
            self.width,
            self.height,
            self.channels,
            self.pixels.len()
        )
    }
}

/// Everything captured during one tick. Any part may be missing: the pad
/// is only read every few ticks, and cameras drop frames.
///
/// Images and maps are reference counted, so cloning a frame to hand it to
/// the display while also keeping it in the buffer is cheap.
#[derive(Debug, Clone)]
pub struct Frame {
    pub sequence: u64,
    pub timestamp: Instant,
    pub camera_a: Option<Arc<Image>>,
    pub camera_b: Option<Arc<Image>>,
    pub pressure: Option<Arc<PressureMap>>,
}

impl Frame {
    pub fn empty(sequence: u64) -> Self {
        Self {
            sequence,
            timestamp: Instant::now(),
            camera_a: None,
            camera_b: None,
            pressure: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.camera_a.is_none() && self.camera_b.is_none() && self.pressure.is_none()
    }
}
