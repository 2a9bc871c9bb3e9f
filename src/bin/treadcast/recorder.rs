use log::info;
use std::time::Instant;
use treadcast::{
    dispatch::{RecordingSink, SinkError},
    frame::Frame,
};

/// Counts what would have been encoded. Video encoding lives outside
/// this program.
#[derive(Debug, Default)]
pub struct FrameCounter {
    started: Option<Instant>,
    frames: u64,
    takes: u64,
}

impl RecordingSink for FrameCounter {
    fn start(&mut self) -> Result<(), SinkError> {
        self.takes += 1;
        self.frames = 0;
        self.started = Some(Instant::now());
        info!("Recorder : take {} started", self.takes);
        Ok(())
    }

    fn push_frame(&mut self, _frame: &Frame) -> Result<(), SinkError> {
        if self.started.is_none() {
            return Err(SinkError::Failed("frame pushed while not recording".to_owned()));
        }
        self.frames += 1;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), SinkError> {
        let Some(started) = self.started.take() else {
            return Ok(());
        };
        info!(
            "Recorder : take {} stopped, {} frames in {:.1} s",
            self.takes,
            self.frames,
            started.elapsed().as_secs_f64()
        );
        Ok(())
    }
}
