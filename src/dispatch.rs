//! Push interfaces to the outside world, and the threads that drive them.
//!
//! The tick must never wait on a slow consumer, so each sink lives on its
//! own dispatcher thread and receives messages through a channel. Frame
//! updates are lossy: if a sink falls more than `depth` messages behind,
//! new frames are dropped for it. Recording start/stop messages are never
//! dropped. A sink that errors or panics only affects itself.

use crate::frame::Frame;

use log::{debug, info, warn};
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        mpsc::{self, Sender},
        Arc,
    },
    thread::{self, JoinHandle},
};
use thiserror::Error;

/// How far behind a sink may fall before frames are dropped for it.
pub const DEFAULT_DISPATCH_DEPTH: usize = 4;

/// Three free-text lines describing delay, position and slow-motion state.
pub type StatusLines = [String; 3];

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink failed: {0}")]
    Failed(String),

    #[error("sink io: {0}")]
    Io(#[from] std::io::Error),
}

/// Whatever puts frames on screen.
pub trait DisplaySink: Send {
    fn update_frames(&mut self, frame: &Frame, status: &StatusLines) -> Result<(), SinkError>;
}

/// Whatever turns frames into a recording. Only fed while playing live
/// with recording armed.
pub trait RecordingSink: Send {
    fn start(&mut self) -> Result<(), SinkError>;

    fn push_frame(&mut self, frame: &Frame) -> Result<(), SinkError>;

    fn stop(&mut self) -> Result<(), SinkError>;
}

#[derive(Debug, Clone)]
pub struct DisplayUpdate {
    pub frame: Frame,
    pub status: StatusLines,
}

#[derive(Debug, Clone)]
pub enum RecordingMessage {
    Start,
    Frame(Frame),
    Stop,
}

/// A thread that hands messages of type `M` to one sink.
pub struct Dispatcher<M: Send + 'static> {
    name: String,
    tx: Option<Sender<M>>,
    pending: Arc<AtomicUsize>,
    dropped: AtomicU64,
    depth: usize,
    handle: Option<JoinHandle<()>>,
}

impl<M: Send + 'static> fmt::Debug for Dispatcher<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.name)
            .field("pending", &self.pending.load(Ordering::Relaxed))
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .finish()
    }
}

impl<M: Send + 'static> Dispatcher<M> {
    /// Spawns the dispatcher thread. `deliver` is called for every message
    /// in order; errors it returns are logged and otherwise ignored.
    pub fn spawn<F>(name: &str, depth: usize, mut deliver: F) -> Self
    where
        F: FnMut(M) -> Result<(), SinkError> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<M>();
        let pending = Arc::new(AtomicUsize::new(0));
        let th_pending = Arc::clone(&pending);
        let th_name = name.to_owned();

        let handle = thread::spawn(move || {
            while let Ok(msg) = rx.recv() {
                if let Err(error) = deliver(msg) {
                    warn!("{} : received error {}.", th_name, error);
                }
                th_pending.fetch_sub(1, Ordering::AcqRel);
            }
            info!("{} : terminated.", th_name);
        });

        Self {
            name: name.to_owned(),
            tx: Some(tx),
            pending,
            dropped: AtomicU64::new(0),
            depth: depth.max(1),
            handle: Some(handle),
        }
    }

    /// Queues `msg` unconditionally.
    pub fn send(&self, msg: M) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        self.pending.fetch_add(1, Ordering::AcqRel);
        if tx.send(msg).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            debug!("{} : sink thread is gone", self.name);
            return false;
        }
        true
    }

    /// Queues `msg` unless the sink is already `depth` messages behind.
    pub fn send_lossy(&self, msg: M) -> bool {
        if self.pending.load(Ordering::Acquire) >= self.depth {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.send(msg)
    }

    /// Messages dropped by [`send_lossy`](Self::send_lossy) so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Delivers whatever is still queued, then joins the thread.
    pub fn shutdown(&mut self) {
        drop(self.tx.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("{} : sink panicked.", self.name);
            }
        }
    }
}

impl<M: Send + 'static> Drop for Dispatcher<M> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Drives a [`DisplaySink`] on its own thread.
pub fn display_dispatcher(
    mut sink: Box<dyn DisplaySink>,
    depth: usize,
) -> Dispatcher<DisplayUpdate> {
    Dispatcher::spawn("display", depth, move |update: DisplayUpdate| {
        sink.update_frames(&update.frame, &update.status)
    })
}

/// Drives a [`RecordingSink`] on its own thread.
pub fn recording_dispatcher(
    mut sink: Box<dyn RecordingSink>,
    depth: usize,
) -> Dispatcher<RecordingMessage> {
    Dispatcher::spawn("recording", depth, move |msg: RecordingMessage| match msg {
        RecordingMessage::Start => sink.start(),
        RecordingMessage::Frame(frame) => sink.push_frame(&frame),
        RecordingMessage::Stop => sink.stop(),
    })
}
