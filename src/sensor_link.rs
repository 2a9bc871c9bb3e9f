//! One serial link per pressure tile, speaking the request/response
//! protocol from [`sensor_protocol`](crate::sensor_protocol).

use crate::error::{LinkError, ReadStage};
use crate::grid::Grid;
use crate::sensor_protocol::{
    decode_frame, find_signature, frame_end, parse_length_field, signature_window_exhausted,
    HEADER_LEN, REQUEST, SIGNATURE, SIGNATURE_WINDOW,
};
use crate::lock;

use log::{debug, info};
use serial2::SerialPort;
use std::{
    io,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

/// Line rate of every tile. Framing is 8N1.
pub const BAUD_RATE: u32 = 3_000_000;

/// More than this many unread bytes before a request means the input is
/// stale and gets thrown away.
pub const BACKLOG_LIMIT: usize = 1000;

/// One deadline covers the whole reply, measured from when the request
/// was sent.
pub const RESPONSE_DEADLINE: Duration = Duration::from_millis(100);

/// The byte-level operations a [`SensorLink`] needs from its device.
///
/// Implemented for [`serial2::SerialPort`]; tests and the simulated pad
/// provide their own.
pub trait SensorPort: Send {
    /// Bytes received but not yet read.
    fn pending_input(&mut self) -> io::Result<usize>;

    /// Drops everything queued in both directions.
    fn discard_buffers(&mut self) -> io::Result<()>;

    fn send(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Reads at most `buf.len()` bytes, waiting no longer than `timeout`.
    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;
}

impl SensorPort for SerialPort {
    fn pending_input(&mut self) -> io::Result<usize> {
        queued_input(self)
    }

    fn discard_buffers(&mut self) -> io::Result<()> {
        SerialPort::discard_buffers(self)
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<()> {
        self.write_all(buf)
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.set_read_timeout(timeout)?;
        self.read(buf)
    }
}

#[cfg(unix)]
fn queued_input(port: &SerialPort) -> io::Result<usize> {
    use std::os::unix::io::AsRawFd;

    let mut pending: libc::c_int = 0;
    // SAFETY: FIONREAD stores a single c_int through the pointer, and the
    // descriptor stays open for as long as `port` is borrowed.
    let rc = unsafe { libc::ioctl(port.as_raw_fd(), libc::FIONREAD, &mut pending) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(pending.max(0) as usize)
}

#[cfg(not(unix))]
fn queued_input(_port: &SerialPort) -> io::Result<usize> {
    Ok(0)
}

/// The most recent good reading from one tile.
#[derive(Debug, Clone)]
pub struct SensorReading {
    pub quadrant: usize,
    pub grid: Grid,
    pub captured_at: Instant,
    pub valid: bool,
}

/// Resets the in-flight flag on every way out of an exchange.
struct ExchangeGuard<'a>(&'a AtomicBool);

impl<'a> ExchangeGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| ExchangeGuard(flag))
    }
}

impl Drop for ExchangeGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owns the device for one quadrant and the latest reading taken from it.
///
/// All methods take `&self`, so a link can be shared between the thread
/// that polls it and whoever wants to peek at the latest reading.
pub struct SensorLink<P: SensorPort = SerialPort> {
    quadrant: usize,
    port: Mutex<P>,
    in_flight: AtomicBool,
    latest: Mutex<Option<Arc<SensorReading>>>,
    deadline: Duration,
}

impl SensorLink<SerialPort> {
    /// Opens the tile on `path` at [`BAUD_RATE`], 8N1.
    pub fn open(quadrant: usize, path: impl AsRef<Path>) -> Result<Self, LinkError> {
        let path = path.as_ref();
        let port = SerialPort::open(path, BAUD_RATE).map_err(|e| {
            LinkError::HardwareUnavailable(format!("{}: {}", path.display(), e))
        })?;
        info!("Quadrant {} : opened {}", quadrant, path.display());
        Ok(Self::new(quadrant, port))
    }
}

impl<P: SensorPort> SensorLink<P> {
    pub fn new(quadrant: usize, port: P) -> Self {
        Self {
            quadrant,
            port: Mutex::new(port),
            in_flight: AtomicBool::new(false),
            latest: Mutex::new(None),
            deadline: RESPONSE_DEADLINE,
        }
    }

    /// Overrides [`RESPONSE_DEADLINE`].
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn quadrant(&self) -> usize {
        self.quadrant
    }

    /// The last successfully decoded reading, if there has been one.
    pub fn latest(&self) -> Option<Arc<SensorReading>> {
        lock(&self.latest).clone()
    }

    /// Performs one request/response exchange.
    ///
    /// On success the new reading replaces the previous one and is
    /// returned. On failure nothing about the link changes. A call made
    /// while another exchange is still running fails with
    /// [`LinkError::Busy`] without touching the device.
    pub fn request_reading(&self) -> Result<Arc<SensorReading>, LinkError> {
        let _guard = ExchangeGuard::try_acquire(&self.in_flight).ok_or(LinkError::Busy)?;

        let grid = {
            let mut port = lock(&self.port);
            self.exchange(&mut *port)?
        };

        let reading = Arc::new(SensorReading {
            quadrant: self.quadrant,
            grid,
            captured_at: Instant::now(),
            valid: true,
        });
        *lock(&self.latest) = Some(reading.clone());
        Ok(reading)
    }

    fn exchange(&self, port: &mut P) -> Result<Grid, LinkError> {
        let backlog = port.pending_input()?;
        if backlog > BACKLOG_LIMIT {
            debug!(
                "Quadrant {} : discarding {} stale bytes",
                self.quadrant, backlog
            );
            port.discard_buffers()?;
        }

        port.send(&REQUEST)?;
        let deadline = Instant::now() + self.deadline;

        let mut buf = Vec::with_capacity(frame_end(SIGNATURE_WINDOW));
        let header_offset = loop {
            if let Some(offset) = find_signature(&buf) {
                break offset;
            }
            if signature_window_exhausted(&buf) {
                return Err(LinkError::Timeout(ReadStage::Header));
            }
            let want = SIGNATURE_WINDOW - buf.len();
            read_once(port, &mut buf, want, deadline, ReadStage::Header)?;
        };

        read_until(
            port,
            &mut buf,
            header_offset + HEADER_LEN,
            deadline,
            ReadStage::Header,
        )?;
        parse_length_field(&buf[header_offset + SIGNATURE.len()..header_offset + HEADER_LEN])?;

        read_until(
            port,
            &mut buf,
            frame_end(header_offset),
            deadline,
            ReadStage::Payload,
        )?;
        let (grid, _consumed) = decode_frame(&buf, header_offset)?;
        Ok(grid)
    }
}

/// Performs a single read of at most `want` bytes onto the end of `buf`.
fn read_once<P: SensorPort>(
    port: &mut P,
    buf: &mut Vec<u8>,
    want: usize,
    deadline: Instant,
    stage: ReadStage,
) -> Result<(), LinkError> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Err(LinkError::Timeout(stage));
    }
    let mut chunk = [0u8; 1024];
    let want = want.clamp(1, chunk.len());
    match port.receive(&mut chunk[..want], remaining) {
        Ok(0) => Err(LinkError::Timeout(stage)),
        Ok(n) => {
            buf.extend_from_slice(&chunk[..n]);
            Ok(())
        }
        Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
            Err(LinkError::Timeout(stage))
        }
        Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Reads into `buf` until it is `target` bytes long, never past it.
fn read_until<P: SensorPort>(
    port: &mut P,
    buf: &mut Vec<u8>,
    target: usize,
    deadline: Instant,
    stage: ReadStage,
) -> Result<(), LinkError> {
    while buf.len() < target {
        read_once(port, buf, target - buf.len(), deadline, stage)?;
    }
    Ok(())
}

/// In-memory stand-ins for a serial device.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Debug, Default)]
    pub struct Script {
        /// Bytes sitting in the receive buffer.
        pub rx: VecDeque<u8>,
        /// One reply is moved into `rx` per request sent.
        pub replies: VecDeque<Vec<u8>>,
        pub sent: Vec<Vec<u8>>,
        pub discards: usize,
        /// Upper bound on bytes handed out per read.
        pub chunk: usize,
        /// The next read blocks this long first, like a hung device.
        pub stall: Option<Duration>,
    }

    /// A port whose replies are scripted up front.
    #[derive(Clone, Default)]
    pub struct ScriptedPort(pub Arc<Mutex<Script>>);

    impl ScriptedPort {
        pub fn new() -> Self {
            let port = Self::default();
            port.script().chunk = 512;
            port
        }

        pub fn script(&self) -> std::sync::MutexGuard<'_, Script> {
            lock(&self.0)
        }

        pub fn push_reply(&self, reply: Vec<u8>) {
            self.script().replies.push_back(reply);
        }
    }

    impl SensorPort for ScriptedPort {
        fn pending_input(&mut self) -> io::Result<usize> {
            Ok(self.script().rx.len())
        }

        fn discard_buffers(&mut self) -> io::Result<()> {
            let mut script = self.script();
            script.rx.clear();
            script.discards += 1;
            Ok(())
        }

        fn send(&mut self, buf: &[u8]) -> io::Result<()> {
            let mut script = self.script();
            script.sent.push(buf.to_vec());
            if let Some(reply) = script.replies.pop_front() {
                script.rx.extend(reply);
            }
            Ok(())
        }

        fn receive(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
            let stall = self.script().stall.take();
            if let Some(stall) = stall {
                std::thread::sleep(stall);
            }
            let mut script = self.script();
            if script.rx.is_empty() {
                return Err(io::ErrorKind::TimedOut.into());
            }
            let n = buf.len().min(script.chunk).min(script.rx.len());
            for slot in buf.iter_mut().take(n) {
                *slot = script.rx.pop_front().unwrap_or_default();
            }
            Ok(n)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedPort;
    use super::*;
    use crate::grid::TILE_SIZE;
    use crate::sensor_protocol::{encode_frame, PAYLOAD_LEN, TAIL};

    fn ramp() -> Grid {
        Grid::from_cells(TILE_SIZE, (0..(TILE_SIZE * TILE_SIZE) as u16).collect()).unwrap()
    }

    fn reply_with_length(length: &[u8]) -> Vec<u8> {
        let mut out = SIGNATURE.to_vec();
        out.extend_from_slice(length);
        out.extend(std::iter::repeat(0x11).take(PAYLOAD_LEN));
        out.extend_from_slice(&TAIL);
        out
    }

    #[test]
    fn decodes_a_good_reply() {
        let port = ScriptedPort::new();
        let mut reply = vec![0x00, 0x7F];
        reply.extend(encode_frame(&ramp()));
        port.push_reply(reply);

        let link = SensorLink::new(2, port.clone());
        let reading = link.request_reading().unwrap();

        assert_eq!(reading.quadrant, 2);
        assert!(reading.valid);
        assert_eq!(reading.grid, ramp());
        assert_eq!(port.script().sent, vec![REQUEST.to_vec()]);
        assert_eq!(link.latest().unwrap().grid, ramp());
    }

    #[test]
    fn consumes_exactly_one_frame() {
        let port = ScriptedPort::new();
        let mut reply = vec![0xEE; 5];
        reply.extend(encode_frame(&ramp()));
        reply.extend_from_slice(b"next");
        port.push_reply(reply);

        let link = SensorLink::new(0, port.clone());
        link.request_reading().unwrap();

        let leftover: Vec<u8> = port.script().rx.iter().copied().collect();
        assert_eq!(leftover, b"next");
    }

    #[test]
    fn wrong_length_leaves_state_alone() {
        let port = ScriptedPort::new();
        port.push_reply(encode_frame(&ramp()));
        port.push_reply(reply_with_length(b"1000"));
        port.push_reply(reply_with_length(b"zz00"));

        let link = SensorLink::new(1, port);
        let first = link.request_reading().unwrap();

        for _ in 0..2 {
            let err = link.request_reading().unwrap_err();
            assert!(matches!(err, LinkError::Protocol(_)), "{err:?}");
            let latest = link.latest().unwrap();
            assert!(Arc::ptr_eq(&latest, &first));
        }
    }

    #[test]
    fn bad_tail_is_a_protocol_error() {
        let port = ScriptedPort::new();
        let mut reply = encode_frame(&ramp());
        let n = reply.len();
        reply[n - 1] = b'X';
        port.push_reply(reply);

        let link = SensorLink::new(3, port);
        assert!(matches!(
            link.request_reading(),
            Err(LinkError::Protocol(_))
        ));
        assert!(link.latest().is_none());
    }

    #[test]
    fn silence_times_out_on_header() {
        let port = ScriptedPort::new();
        let link = SensorLink::new(0, port);
        assert!(matches!(
            link.request_reading(),
            Err(LinkError::Timeout(ReadStage::Header))
        ));
    }

    #[test]
    fn late_signature_times_out_on_header() {
        let port = ScriptedPort::new();
        let mut reply = vec![0u8; 21];
        reply.extend(encode_frame(&ramp()));
        port.push_reply(reply);

        let link = SensorLink::new(0, port);
        assert!(matches!(
            link.request_reading(),
            Err(LinkError::Timeout(ReadStage::Header))
        ));
    }

    #[test]
    fn truncated_payload_times_out() {
        let port = ScriptedPort::new();
        let mut reply = encode_frame(&ramp());
        reply.truncate(2000);
        port.push_reply(reply);

        let link = SensorLink::new(0, port);
        assert!(matches!(
            link.request_reading(),
            Err(LinkError::Timeout(ReadStage::Payload))
        ));
    }

    #[test]
    fn stale_backlog_is_flushed_before_request() {
        let port = ScriptedPort::new();
        port.script().rx.extend(std::iter::repeat(0xAB).take(BACKLOG_LIMIT + 1));
        port.push_reply(encode_frame(&ramp()));

        let link = SensorLink::new(0, port.clone());
        link.request_reading().unwrap();
        assert_eq!(port.script().discards, 1);
    }

    #[test]
    fn small_backlog_is_kept() {
        let port = ScriptedPort::new();
        port.script().rx.extend(std::iter::repeat(0xAB).take(BACKLOG_LIMIT));

        let link = SensorLink::new(0, port.clone());
        assert!(link.request_reading().is_err());
        assert_eq!(port.script().discards, 0);
    }

    #[test]
    fn reentrant_call_is_rejected() {
        let port = ScriptedPort::new();
        port.push_reply(encode_frame(&ramp()));
        let link = SensorLink::new(0, port.clone());

        let guard = ExchangeGuard::try_acquire(&link.in_flight).unwrap();
        assert!(matches!(link.request_reading(), Err(LinkError::Busy)));
        assert!(port.script().sent.is_empty());
        drop(guard);

        assert!(link.request_reading().is_ok());
    }
}
