//! The acquisition/playback state machine.
//!
//! ```text
//!            TogglePlay                 TogglePause
//!   Idle ───────────────▶ Play ─────────────────────▶ Replay
//!    ▲                     │  \                        │  ▲
//!    │      TogglePlay     │   \ Scrub          Pause, │  │ TogglePause
//!    └─────────────────────┘    \          Scrub, end  ▼  │
//!    (from any other state)      └─────────────────▶  Stop
//! ```
//!
//! [`ModeController::tick`] runs once per scheduler tick. It first applies
//! every queued [`Command`], then does the work of whatever state it ended
//! up in, and finally pushes one frame to the display (and, while playing
//! live with recording on, to the recorder).

use crate::dispatch::{DisplayUpdate, Dispatcher, RecordingMessage, StatusLines};
use crate::frame::Frame;
use crate::playback_buffer::PlaybackBuffer;

use log::{debug, info};
use std::{
    fmt,
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc, Mutex,
    },
};

/// Nominal frame rate used for delay arithmetic.
pub const DEFAULT_FPS: f64 = 60.0;

/// Frames moved by one scrub key press.
pub const DEFAULT_SCRUB_STEP: i64 = 30;

/// Replay advances one frame every `level` ticks.
pub const SLOW_LEVELS: [u32; 4] = [1, 2, 4, 8];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeState {
    Idle,
    Play,
    Replay,
    Stop,
}

impl fmt::Display for ModeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModeState::Idle => "Idle",
            ModeState::Play => "Play",
            ModeState::Replay => "Replay",
            ModeState::Stop => "Stop",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    /// Idle → Play, anything else → Idle.
    TogglePlay,
    /// Play/Stop → Replay, Replay → Stop.
    TogglePause,
    /// Move the play position by this many frames and freeze there.
    Scrub(i64),
    /// Next slow-motion level. Only while frozen or replaying.
    CycleSlowLevel,
    /// Broadcast delay for the current play session. Negative values mean
    /// no delay. Starting play again goes back to the configured delay.
    SetDelaySeconds(f64),
    /// Whether playing live should also record.
    ArmRecording(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingEdge {
    Started,
    Stopped,
}

/// What one tick did.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub mode: ModeState,
    /// Play position after the tick. Always 0 while idle.
    pub position: usize,
    /// Frames in the playback buffer.
    pub count: usize,
    /// Whole seconds until the delayed view catches up. 0 once it has.
    pub countdown_secs: u64,
    pub slow_level: u32,
    /// Recording starts and stops caused by this tick's commands, in order.
    pub recording_edges: Vec<RecordingEdge>,
    pub recording: bool,
    /// The frame sent to the display, if there was one to send.
    pub displayed: Option<Frame>,
    pub status: StatusLines,
}

/// Queues commands for a [`ModeController`] from any thread.
#[derive(Debug, Clone)]
pub struct CommandHandle {
    tx: Sender<Command>,
}

impl CommandHandle {
    pub fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            debug!("ModeController : gone, dropped {:?}", command);
        }
    }

    pub fn toggle_play(&self) {
        self.send(Command::TogglePlay)
    }

    pub fn toggle_pause(&self) {
        self.send(Command::TogglePause)
    }

    pub fn scrub(&self, frames: i64) {
        self.send(Command::Scrub(frames))
    }

    pub fn cycle_slow_level(&self) {
        self.send(Command::CycleSlowLevel)
    }

    pub fn set_delay_seconds(&self, seconds: f64) {
        self.send(Command::SetDelaySeconds(seconds))
    }

    pub fn arm_recording(&self, armed: bool) {
        self.send(Command::ArmRecording(armed))
    }
}

pub struct ModeController {
    state: ModeState,
    buffer: Arc<Mutex<PlaybackBuffer>>,
    fps: f64,
    delay_seconds: f64,
    /// What `delay_seconds` goes back to whenever play starts.
    base_delay_seconds: f64,
    slow_level: u32,
    replay_ticks: u32,
    recording_armed: bool,
    recording_active: bool,
    commands_tx: Sender<Command>,
    commands_rx: Receiver<Command>,
    display: Option<Dispatcher<DisplayUpdate>>,
    recorder: Option<Dispatcher<RecordingMessage>>,
}

impl fmt::Debug for ModeController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModeController")
            .field("state", &self.state)
            .field("delay_seconds", &self.delay_seconds)
            .field("slow_level", &self.slow_level)
            .field("recording_armed", &self.recording_armed)
            .field("recording_active", &self.recording_active)
            .finish()
    }
}

impl ModeController {
    pub fn new(buffer: PlaybackBuffer, fps: f64) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel();
        Self {
            state: ModeState::Idle,
            buffer: Arc::new(Mutex::new(buffer)),
            fps: if fps > 0.0 { fps } else { DEFAULT_FPS },
            delay_seconds: 0.0,
            base_delay_seconds: 0.0,
            slow_level: SLOW_LEVELS[0],
            replay_ticks: 0,
            recording_armed: false,
            recording_active: false,
            commands_tx,
            commands_rx,
            display: None,
            recorder: None,
        }
    }

    /// The delay each play session starts with.
    pub fn with_delay(mut self, seconds: f64) -> Self {
        self.base_delay_seconds = clamp_delay(seconds);
        self.delay_seconds = self.base_delay_seconds;
        self
    }

    pub fn with_display(mut self, display: Dispatcher<DisplayUpdate>) -> Self {
        self.display = Some(display);
        self
    }

    pub fn with_recorder(mut self, recorder: Dispatcher<RecordingMessage>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn commands(&self) -> CommandHandle {
        CommandHandle {
            tx: self.commands_tx.clone(),
        }
    }

    /// Shared view of the buffer, for inspection outside the tick.
    pub fn buffer(&self) -> Arc<Mutex<PlaybackBuffer>> {
        Arc::clone(&self.buffer)
    }

    pub fn state(&self) -> ModeState {
        self.state
    }

    pub fn delay_seconds(&self) -> f64 {
        self.delay_seconds
    }

    pub fn slow_level(&self) -> u32 {
        self.slow_level
    }

    pub fn delay_frames(&self) -> usize {
        (self.delay_seconds * self.fps).round() as usize
    }

    /// Runs one tick with the newest frame from the synchronizer.
    pub fn tick(&mut self, latest: Option<Frame>) -> TickReport {
        let mut edges = Vec::new();
        let shared = Arc::clone(&self.buffer);
        let mut buffer = crate::lock(&shared);

        while let Ok(command) = self.commands_rx.try_recv() {
            self.apply(command, &mut buffer, &mut edges);
        }

        let mut countdown_secs = 0;
        let displayed = match self.state {
            ModeState::Idle => latest,
            ModeState::Play => {
                if let Some(frame) = latest {
                    buffer.add(frame);
                }
                countdown_secs = self.place_delayed(&mut buffer);
                buffer.current().cloned()
            }
            ModeState::Replay => {
                self.replay_ticks += 1;
                if self.replay_ticks >= self.slow_level {
                    self.replay_ticks = 0;
                    if buffer.play_position() >= buffer.last_index() {
                        info!("ModeController : replay reached the end");
                        self.state = ModeState::Stop;
                    } else {
                        buffer.step_play_position(1);
                    }
                }
                buffer.current().cloned()
            }
            ModeState::Stop => buffer.current().cloned(),
        };

        let position = match self.state {
            ModeState::Idle => 0,
            _ => buffer.play_position(),
        };
        let count = buffer.len();
        drop(buffer);

        let status = self.status_lines(position, count, countdown_secs);

        if let (Some(frame), Some(display)) = (&displayed, &self.display) {
            display.send_lossy(DisplayUpdate {
                frame: frame.clone(),
                status: status.clone(),
            });
        }
        let recording = self.state == ModeState::Play && self.recording_active;
        if recording {
            if let (Some(frame), Some(recorder)) = (&displayed, &self.recorder) {
                recorder.send_lossy(RecordingMessage::Frame(frame.clone()));
            }
        }

        TickReport {
            mode: self.state,
            position,
            count,
            countdown_secs,
            slow_level: self.slow_level,
            recording_edges: edges,
            recording,
            displayed,
            status,
        }
    }

    fn apply(
        &mut self,
        command: Command,
        buffer: &mut PlaybackBuffer,
        edges: &mut Vec<RecordingEdge>,
    ) {
        use ModeState::*;
        match (command, self.state) {
            (Command::TogglePlay, Idle) => {
                buffer.clear();
                self.delay_seconds = self.base_delay_seconds;
                self.slow_level = SLOW_LEVELS[0];
                self.replay_ticks = 0;
                self.enter(Play);
                if self.recording_armed {
                    self.start_recording(edges);
                }
            }
            (Command::TogglePlay, _) => {
                self.stop_recording(edges);
                buffer.clear();
                self.enter(Idle);
            }
            (Command::TogglePause, Play | Stop) => {
                self.stop_recording(edges);
                self.replay_ticks = 0;
                self.enter(Replay);
            }
            (Command::TogglePause, Replay) => self.enter(Stop),
            (Command::Scrub(frames), Play | Replay | Stop) => {
                self.stop_recording(edges);
                buffer.step_play_position(frames);
                self.enter(Stop);
            }
            (Command::CycleSlowLevel, Replay | Stop) => {
                let next = SLOW_LEVELS
                    .iter()
                    .position(|&level| level == self.slow_level)
                    .map_or(0, |i| (i + 1) % SLOW_LEVELS.len());
                self.slow_level = SLOW_LEVELS[next];
                debug!("ModeController : slow level {}", self.slow_level);
            }
            (Command::SetDelaySeconds(seconds), _) => {
                self.delay_seconds = clamp_delay(seconds);
                debug!("ModeController : delay {:.1} s", self.delay_seconds);
            }
            (Command::ArmRecording(armed), state) => {
                self.recording_armed = armed;
                if !armed {
                    self.stop_recording(edges);
                } else if state == Play {
                    self.start_recording(edges);
                }
            }
            (command, state) => debug!("ModeController : ignored {:?} in {}", command, state),
        }
    }

    fn enter(&mut self, next: ModeState) {
        if self.state != next {
            info!("ModeController : {} -> {}", self.state, next);
            self.state = next;
        }
    }

    /// Points the buffer at the frame `D` frames behind the newest one, or
    /// at the oldest frame while not enough history exists yet. Returns the
    /// countdown until the lag is reached. A delay the buffer cannot hold
    /// keeps counting down and never goes live.
    fn place_delayed(&self, buffer: &mut PlaybackBuffer) -> u64 {
        let delay = self.delay_frames();
        let count = buffer.len();
        if delay >= count {
            buffer.set_play_position(0);
            ((delay - count + 1) as f64 / self.fps).ceil() as u64
        } else {
            buffer.set_play_position(count - delay - 1);
            0
        }
    }

    fn start_recording(&mut self, edges: &mut Vec<RecordingEdge>) {
        if self.recording_active {
            return;
        }
        self.recording_active = true;
        edges.push(RecordingEdge::Started);
        info!("ModeController : recording started");
        if let Some(recorder) = &self.recorder {
            recorder.send(RecordingMessage::Start);
        }
    }

    fn stop_recording(&mut self, edges: &mut Vec<RecordingEdge>) {
        if !self.recording_active {
            return;
        }
        self.recording_active = false;
        edges.push(RecordingEdge::Stopped);
        info!("ModeController : recording stopped");
        if let Some(recorder) = &self.recorder {
            recorder.send(RecordingMessage::Stop);
        }
    }

    fn status_lines(&self, position: usize, count: usize, countdown_secs: u64) -> StatusLines {
        let delay = if countdown_secs > 0 {
            format!("Delay {:.1} s (live in {} s)", self.delay_seconds, countdown_secs)
        } else {
            format!("Delay {:.1} s", self.delay_seconds)
        };
        let frames = if count == 0 {
            "Frame - / 0".to_owned()
        } else {
            format!("Frame {} / {}", position + 1, count)
        };
        let mode = if self.recording_active {
            format!("Slow {}x, {}, recording", self.slow_level, self.state)
        } else {
            format!("Slow {}x, {}", self.slow_level, self.state)
        };
        [delay, frames, mode]
    }

    /// Ends any recording, then flushes and joins both sink threads.
    pub fn close_sinks(&mut self) {
        self.stop_recording(&mut Vec::new());
        if let Some(mut recorder) = self.recorder.take() {
            recorder.shutdown();
        }
        if let Some(mut display) = self.display.take() {
            display.shutdown();
        }
    }
}

fn clamp_delay(seconds: f64) -> f64 {
    if seconds.is_finite() {
        seconds.max(0.0)
    } else {
        0.0
    }
}

impl Drop for ModeController {
    fn drop(&mut self) {
        self.close_sinks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{recording_dispatcher, RecordingSink, SinkError};

    fn controller(capacity: usize) -> ModeController {
        ModeController::new(PlaybackBuffer::new(capacity), DEFAULT_FPS)
    }

    /// Starts playing with `delay` seconds and feeds `frames` ticks.
    fn playing(ctl: &mut ModeController, delay: f64, frames: u64) -> TickReport {
        let cmd = ctl.commands();
        cmd.toggle_play();
        cmd.set_delay_seconds(delay);
        let mut report = ctl.tick(None);
        for seq in 0..frames {
            report = ctl.tick(Some(Frame::empty(seq)));
        }
        report
    }

    #[test]
    fn idle_passes_frames_through_without_buffering() {
        let mut ctl = controller(100);
        let report = ctl.tick(Some(Frame::empty(3)));
        assert_eq!(report.mode, ModeState::Idle);
        assert_eq!(report.displayed.unwrap().sequence, 3);
        assert_eq!(report.count, 0);
        assert!(ctl.tick(None).displayed.is_none());
    }

    #[test]
    fn delay_longer_than_history_counts_down() {
        let mut ctl = controller(5400);
        let report = playing(&mut ctl, 1.5, 50);
        assert_eq!(report.mode, ModeState::Play);
        assert_eq!(report.count, 50);
        assert_eq!(report.position, 0);
        assert_eq!(report.countdown_secs, 1);
        assert_eq!(report.displayed.unwrap().sequence, 0);
        assert!(report.status[0].contains("live in 1 s"));
    }

    #[test]
    fn steady_state_lag() {
        let mut ctl = controller(5400);
        let report = playing(&mut ctl, 1.5, 200);
        assert_eq!(report.position, 109);
        assert_eq!(report.countdown_secs, 0);
        assert_eq!(report.displayed.unwrap().sequence, 109);
        assert_eq!(report.status[1], "Frame 110 / 200");
    }

    #[test]
    fn zero_delay_shows_newest() {
        let mut ctl = controller(5400);
        let report = playing(&mut ctl, 0.0, 10);
        assert_eq!(report.position, 9);
    }

    #[test]
    fn lag_holds_once_buffer_is_full() {
        let mut ctl = controller(100);
        let report = playing(&mut ctl, 0.5, 250);
        assert_eq!(report.count, 100);
        assert_eq!(report.position, 69);
        assert_eq!(report.displayed.unwrap().sequence, 219);
    }

    #[test]
    fn delay_beyond_capacity_never_goes_live() {
        let mut ctl = controller(100);
        let report = playing(&mut ctl, 10.0, 150);
        assert_eq!(ctl.delay_frames(), 600);
        assert_eq!(report.count, 100);
        assert_eq!(report.position, 0);
        // ceil((600 - 100 + 1) / 60)
        assert_eq!(report.countdown_secs, 9);
        assert!(report.status[0].contains("live in 9 s"));

        let report = ctl.tick(Some(Frame::empty(150)));
        assert_eq!(report.position, 0);
        assert_eq!(report.countdown_secs, 9);
    }

    #[test]
    fn delay_of_exactly_capacity_counts_down_one_second() {
        let mut ctl = controller(60);
        let report = playing(&mut ctl, 1.0, 200);
        assert_eq!(report.count, 60);
        assert_eq!(report.position, 0);
        assert_eq!(report.countdown_secs, 1);
    }

    #[test]
    fn replay_advances_then_stops_at_the_end() {
        let mut ctl = controller(5400);
        let report = playing(&mut ctl, 0.0, 40);
        assert_eq!(report.position, 39);

        let cmd = ctl.commands();
        cmd.scrub(-1);
        let report = ctl.tick(None);
        assert_eq!(report.mode, ModeState::Stop);
        assert_eq!(report.position, 38);

        cmd.toggle_pause();
        let report = ctl.tick(None);
        assert_eq!(report.mode, ModeState::Replay);
        assert_eq!(report.position, 39);

        let report = ctl.tick(None);
        assert_eq!(report.mode, ModeState::Stop);
        assert_eq!(report.position, 39);

        let report = ctl.tick(None);
        assert_eq!(report.position, 39);
    }

    #[test]
    fn slow_replay_steps_every_nth_tick() {
        let mut ctl = controller(5400);
        playing(&mut ctl, 0.0, 100);
        let cmd = ctl.commands();
        cmd.scrub(-60);
        cmd.cycle_slow_level();
        cmd.cycle_slow_level();
        ctl.tick(None);
        assert_eq!(ctl.slow_level(), 4);

        cmd.toggle_pause();
        let positions: Vec<usize> = (0..8).map(|_| ctl.tick(None).position).collect();
        assert_eq!(positions, vec![39, 39, 39, 40, 40, 40, 40, 41]);
    }

    #[test]
    fn slow_level_cycles_and_wraps() {
        let mut ctl = controller(10);
        playing(&mut ctl, 0.0, 5);
        let cmd = ctl.commands();
        cmd.scrub(0);
        ctl.tick(None);
        let mut levels = Vec::new();
        for _ in 0..5 {
            cmd.cycle_slow_level();
            levels.push(ctl.tick(None).slow_level);
        }
        assert_eq!(levels, vec![2, 4, 8, 1, 2]);
    }

    #[test]
    fn illegal_commands_are_ignored() {
        let mut ctl = controller(100);
        let cmd = ctl.commands();

        cmd.toggle_pause();
        cmd.scrub(30);
        cmd.cycle_slow_level();
        let report = ctl.tick(None);
        assert_eq!(report.mode, ModeState::Idle);
        assert_eq!(report.slow_level, 1);

        cmd.toggle_play();
        cmd.cycle_slow_level();
        let report = ctl.tick(Some(Frame::empty(0)));
        assert_eq!(report.mode, ModeState::Play);
        assert_eq!(report.slow_level, 1);
    }

    #[test]
    fn scrub_is_clamped() {
        let mut ctl = controller(100);
        playing(&mut ctl, 0.0, 20);
        let cmd = ctl.commands();
        cmd.scrub(-30);
        assert_eq!(ctl.tick(None).position, 0);
        cmd.scrub(30);
        assert_eq!(ctl.tick(None).position, 19);
    }

    #[test]
    fn restarting_play_clears_history_and_slow_level() {
        let mut ctl = controller(100);
        playing(&mut ctl, 1.0, 30);
        let cmd = ctl.commands();
        cmd.toggle_pause();
        cmd.cycle_slow_level();
        ctl.tick(None);
        assert_eq!(ctl.slow_level(), 2);

        cmd.toggle_play();
        let report = ctl.tick(None);
        assert_eq!(report.mode, ModeState::Idle);
        assert_eq!(report.count, 0);

        cmd.toggle_play();
        let report = ctl.tick(Some(Frame::empty(99)));
        assert_eq!(report.mode, ModeState::Play);
        assert_eq!(report.count, 1);
        assert_eq!(report.slow_level, 1);
        assert_eq!(ctl.delay_seconds(), 0.0);
    }

    #[test]
    fn starting_play_restores_configured_delay() {
        let mut ctl = ModeController::new(PlaybackBuffer::new(100), DEFAULT_FPS).with_delay(1.5);
        assert_eq!(ctl.delay_seconds(), 1.5);
        let cmd = ctl.commands();

        cmd.toggle_play();
        cmd.set_delay_seconds(4.0);
        ctl.tick(Some(Frame::empty(0)));
        assert_eq!(ctl.delay_frames(), 240);

        cmd.toggle_play();
        ctl.tick(None);
        assert_eq!(ctl.delay_seconds(), 4.0);

        cmd.toggle_play();
        let report = ctl.tick(Some(Frame::empty(1)));
        assert_eq!(report.mode, ModeState::Play);
        assert_eq!(ctl.delay_seconds(), 1.5);
        assert_eq!(ctl.delay_frames(), 90);
    }

    #[derive(Default)]
    struct Counts {
        starts: usize,
        frames: usize,
        stops: usize,
    }

    struct CountingRecorder(Arc<Mutex<Counts>>);

    impl RecordingSink for CountingRecorder {
        fn start(&mut self) -> Result<(), SinkError> {
            crate::lock(&self.0).starts += 1;
            Ok(())
        }
        fn push_frame(&mut self, _: &Frame) -> Result<(), SinkError> {
            crate::lock(&self.0).frames += 1;
            Ok(())
        }
        fn stop(&mut self) -> Result<(), SinkError> {
            crate::lock(&self.0).stops += 1;
            Ok(())
        }
    }

    #[test]
    fn recording_follows_play() {
        let counts = Arc::new(Mutex::new(Counts::default()));
        let recorder = recording_dispatcher(Box::new(CountingRecorder(counts.clone())), 64);
        let mut ctl = controller(100).with_recorder(recorder);
        let cmd = ctl.commands();

        cmd.arm_recording(true);
        assert!(ctl.tick(None).recording_edges.is_empty());

        cmd.toggle_play();
        let report = ctl.tick(Some(Frame::empty(0)));
        assert_eq!(report.recording_edges, vec![RecordingEdge::Started]);
        assert!(report.recording);
        for seq in 1..5 {
            let report = ctl.tick(Some(Frame::empty(seq)));
            assert!(report.recording_edges.is_empty());
            assert!(report.recording);
        }

        cmd.scrub(-2);
        let report = ctl.tick(None);
        assert_eq!(report.recording_edges, vec![RecordingEdge::Stopped]);
        assert!(!report.recording);

        cmd.toggle_pause();
        assert!(!ctl.tick(None).recording);

        drop(ctl);
        let counts = crate::lock(&counts);
        assert_eq!(counts.starts, 1);
        assert_eq!(counts.frames, 5);
        assert_eq!(counts.stops, 1);
    }

    #[test]
    fn arming_while_playing_starts_at_once() {
        let mut ctl = controller(100);
        playing(&mut ctl, 0.0, 3);
        let cmd = ctl.commands();
        cmd.arm_recording(true);
        assert_eq!(ctl.tick(None).recording_edges, vec![RecordingEdge::Started]);
        cmd.arm_recording(false);
        assert_eq!(ctl.tick(None).recording_edges, vec![RecordingEdge::Stopped]);
        cmd.toggle_play();
        assert!(ctl.tick(None).recording_edges.is_empty());
    }

    #[test]
    fn every_edge_of_a_tick_is_reported() {
        let counts = Arc::new(Mutex::new(Counts::default()));
        let recorder = recording_dispatcher(Box::new(CountingRecorder(counts.clone())), 64);
        let mut ctl = controller(100).with_recorder(recorder);
        let cmd = ctl.commands();

        cmd.arm_recording(true);
        cmd.toggle_play();
        cmd.toggle_play();
        let report = ctl.tick(Some(Frame::empty(0)));
        assert_eq!(report.mode, ModeState::Idle);
        assert_eq!(
            report.recording_edges,
            vec![RecordingEdge::Started, RecordingEdge::Stopped]
        );

        cmd.toggle_play();
        ctl.tick(Some(Frame::empty(1)));
        cmd.arm_recording(false);
        cmd.arm_recording(true);
        let report = ctl.tick(Some(Frame::empty(2)));
        assert_eq!(
            report.recording_edges,
            vec![RecordingEdge::Stopped, RecordingEdge::Started]
        );
        assert!(report.recording);

        drop(ctl);
        let counts = crate::lock(&counts);
        assert_eq!(counts.starts, 3);
        assert_eq!(counts.stops, 3);
    }
}
