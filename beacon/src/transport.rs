//! Byte sources feeding the acquisition thread
//!
//! The device driver is not part of this crate. Anything that can hand over
//! raw bytes with a bounded wait implements [`ByteSource`].

use crate::error::TransportError;
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// A blocking, timeout-bounded producer of raw bytes
pub trait ByteSource: Send {
    /// Wait at most `timeout` for bytes.
    ///
    /// `Ok(Some(bytes))` carries data, `Ok(None)` means the wait timed out and
    /// `Err` means the source is gone for good.
    fn read(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError>;

    /// Short label used in log lines
    fn describe(&self) -> String {
        "byte source".to_string()
    }
}

impl<S: ByteSource + ?Sized> ByteSource for Box<S> {
    fn read(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        (**self).read(timeout)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Bytes pushed in-process through a crossbeam channel.
/// Dropping every sender ends the source.
pub struct ChannelSource {
    rx: Receiver<Vec<u8>>,
}

impl ChannelSource {
    pub fn new(rx: Receiver<Vec<u8>>) -> Self {
        Self { rx }
    }

    /// Bounded sender/source pair
    pub fn pair(capacity: usize) -> (Sender<Vec<u8>>, Self) {
        let (tx, rx) = bounded(capacity);
        (tx, Self::new(rx))
    }
}

impl ByteSource for ChannelSource {
    fn read(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        match self.rx.recv_timeout(timeout) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected),
        }
    }

    fn describe(&self) -> String {
        "channel".to_string()
    }
}

/// Adapter over any `Read`.
///
/// The read timeout is whatever the reader is configured with (socket or
/// serial port timeouts); `TimedOut`/`WouldBlock` map to `Ok(None)` and
/// end-of-stream maps to [`TransportError::Disconnected`].
pub struct ReaderSource<R> {
    reader: R,
    chunk: Vec<u8>,
    label: String,
}

impl<R: Read + Send> ReaderSource<R> {
    pub fn new(reader: R, chunk_size: usize, label: impl Into<String>) -> Self {
        Self {
            reader,
            chunk: vec![0u8; chunk_size.max(1)],
            label: label.into(),
        }
    }
}

impl<R: Read + Send> ByteSource for ReaderSource<R> {
    fn read(&mut self, _timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        match self.reader.read(&mut self.chunk) {
            Ok(0) => Err(TransportError::Disconnected),
            Ok(n) => Ok(Some(self.chunk[..n].to_vec())),
            Err(e) => match e.kind() {
                ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted => Ok(None),
                _ => Err(e.into()),
            },
        }
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// Connect to a TCP serial bridge with the given read timeout
pub fn tcp_source<A: ToSocketAddrs>(
    addr: A,
    read_timeout: Duration,
) -> Result<ReaderSource<TcpStream>, TransportError> {
    let stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(read_timeout))?;
    stream.set_nodelay(true)?;
    let label = match stream.peer_addr() {
        Ok(peer) => format!("tcp://{}", peer),
        Err(_) => "tcp".to_string(),
    };
    Ok(ReaderSource::new(stream, 1024, label))
}

/// Exponential backoff between connection attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay after the first failed attempt (ms)
    pub initial_delay_ms: u64,
    /// Upper bound for a single delay (ms)
    pub max_delay_ms: u64,
    /// Growth factor applied after every failure
    pub multiplier: f64,
    /// Give up after this many attempts; `None` retries until stopped
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 200,
            max_delay_ms: 5_000,
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay to wait after failed attempt number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(32) as i32);
        let ms = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(ms as u64)
    }
}

/// Call `connect` until it succeeds, the attempt budget runs out, or `stop`
/// is raised. Sleeps in short slices so a stop request is honoured quickly.
pub fn connect_with_backoff<S, F>(
    mut connect: F,
    policy: &ReconnectPolicy,
    stop: &AtomicBool,
) -> Result<S, TransportError>
where
    F: FnMut() -> Result<S, TransportError>,
{
    let mut attempt = 0u32;
    loop {
        let reason = match connect() {
            Ok(source) => {
                if attempt > 0 {
                    log::info!("Transport connected after {} retries", attempt);
                }
                return Ok(source);
            }
            Err(e) => e.to_string(),
        };

        attempt += 1;
        if policy.max_attempts.is_some_and(|max| attempt >= max) || stop.load(Ordering::Relaxed) {
            log::error!("Giving up on transport after {} attempts: {}", attempt, reason);
            return Err(TransportError::ConnectFailed {
                attempts: attempt,
                reason,
            });
        }

        let delay = policy.delay_for(attempt - 1);
        log::warn!(
            "Transport connect attempt {} failed ({}), retrying in {:?}",
            attempt,
            reason,
            delay
        );

        let slice = Duration::from_millis(20);
        let mut waited = Duration::ZERO;
        while waited < delay {
            if stop.load(Ordering::Relaxed) {
                return Err(TransportError::ConnectFailed {
                    attempts: attempt,
                    reason,
                });
            }
            let step = slice.min(delay - waited);
            thread::sleep(step);
            waited += step;
        }
    }
}
