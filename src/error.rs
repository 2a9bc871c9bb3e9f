//! Error types for the serial link, the capture sources and the config.

use crate::sensor_protocol::ProtocolError;

use std::{fmt, io};
use thiserror::Error;

/// Which part of a reply we were waiting on when the deadline passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStage {
    Header,
    Payload,
}

impl fmt::Display for ReadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadStage::Header => write!(f, "header"),
            ReadStage::Payload => write!(f, "payload"),
        }
    }
}

/// Outcome of a failed exchange with one quadrant. Every variant is a
/// normal, per-cycle result: the caller keeps the previous reading and
/// tries again next cycle.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("timed out waiting for {0}")]
    Timeout(ReadStage),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("hardware unavailable: {0}")]
    HardwareUnavailable(String),

    #[error("an exchange is already in flight on this link")]
    Busy,

    #[error("serial io: {0}")]
    Io(#[from] io::Error),
}

impl LinkError {
    /// Timeouts and protocol errors are expected now and then on a busy
    /// bus; everything else deserves a louder log line.
    pub fn is_routine(&self) -> bool {
        matches!(
            self,
            LinkError::Timeout(_) | LinkError::Protocol(_) | LinkError::Busy
        )
    }
}

/// Why a [`CaptureSource`](crate::capture_source::CaptureSource) could not
/// start or produce data.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("hardware unavailable: {0}")]
    HardwareUnavailable(String),

    #[error("capture failed: {0}")]
    Failed(String),

    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised while loading a [`SessionConfig`](crate::config::SessionConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config: {0}")]
    Io(#[from] io::Error),

    #[error("could not parse config: {0}")]
    Ron(#[from] ron::de::SpannedError),

    #[error("invalid config: {0}")]
    Invalid(String),
}
