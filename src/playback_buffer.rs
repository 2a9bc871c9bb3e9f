//! The rolling window of recent frames behind delayed playback, replay and
//! scrubbing.
//!
//! At most `capacity` frames are kept; adding to a full buffer evicts the
//! oldest one. The play position always points at a valid frame (or at 0
//! when the buffer is empty), and it moves with its frame when eviction
//! shifts the indices down.

use crate::frame::Frame;

use std::collections::VecDeque;

/// 90 seconds at 60 frames per second.
pub const DEFAULT_CAPACITY: usize = 5400;

#[derive(Debug, Clone)]
pub struct PlaybackBuffer {
    frames: VecDeque<Frame>,
    capacity: usize,
    play_position: usize,
}

impl Default for PlaybackBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl PlaybackBuffer {
    /// A buffer holding at most `capacity` frames (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
            play_position: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// The highest valid index, or 0 when empty.
    pub fn last_index(&self) -> usize {
        self.frames.len().saturating_sub(1)
    }

    /// Appends `frame`, evicting the oldest frame first if the buffer is
    /// full. Returns the evicted frame.
    pub fn add(&mut self, frame: Frame) -> Option<Frame> {
        let evicted = if self.frames.len() >= self.capacity {
            let oldest = self.frames.pop_front();
            if self.play_position > 0 {
                self.play_position -= 1;
            }
            oldest
        } else {
            None
        };
        self.frames.push_back(frame);
        self.clamp_position();
        evicted
    }

    /// The frame at `index`, or `None` if there is no such frame.
    pub fn frame(&self, index: usize) -> Option<&Frame> {
        self.frames.get(index)
    }

    /// The frame under the play position.
    pub fn current(&self) -> Option<&Frame> {
        self.frame(self.play_position)
    }

    pub fn clear(&mut self) {
        self.frames.clear();
        self.play_position = 0;
    }

    pub fn play_position(&self) -> usize {
        self.play_position
    }

    /// Moves the play position to `position`, clamped into the buffer.
    /// Returns where it actually landed.
    pub fn set_play_position(&mut self, position: usize) -> usize {
        self.play_position = position;
        self.clamp_position();
        self.play_position
    }

    /// Moves the play position by `delta` frames, clamped into the buffer.
    pub fn step_play_position(&mut self, delta: i64) -> usize {
        let target = if delta.is_negative() {
            self.play_position.saturating_sub(delta.unsigned_abs() as usize)
        } else {
            self.play_position.saturating_add(delta as usize)
        };
        self.set_play_position(target)
    }

    fn clamp_position(&mut self) {
        self.play_position = self.play_position.min(self.last_index());
    }
}
