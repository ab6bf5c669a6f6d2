//! # Modbus Transport Layer
//!
//! A [`Transport`] pairs one byte channel with one [`FrameCodec`] and exposes
//! frame-level reads and writes to masters and slave handlers.
//!
//! ## Channel
//!
//! Anything implementing [`ByteChannel`] can carry frames: a `TcpStream`, a
//! serial port, or an in-memory duplex stream in tests. Serial channels also
//! drive the RS-485 direction lines.
//!
//! ## Timing and cancellation
//!
//! Every read has an explicit deadline. A slave waiting for the start of the
//! next request passes no deadline and blocks until data arrives or the
//! channel is closed. Closing goes through a [`CloseHandle`], which can be
//! handed to another task (the idle watchdog does this) and makes any
//! in-flight read or write fail promptly with `ChannelClosed`.
//!
//! ## Statistics
//!
//! ```rust,no_run
//! # use voltage_modbus_stack::transport::Transport;
//! # fn example(transport: &Transport) {
//! let stats = transport.stats();
//! println!("Requests sent: {}", stats.requests_sent);
//! println!("Responses received: {}", stats.responses_received);
//! println!("Errors: {}", stats.errors);
//! println!("Timeouts: {}", stats.timeouts);
//! # }
//! ```

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use futures::FutureExt;
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::info;

use crate::codec::FrameCodec;
use crate::error::{ModbusError, ModbusResult};
use crate::image::RequestListener;
use crate::protocol::Frame;
use crate::timing::Rs485Settings;
use crate::utils::format::bytes_to_hex;

/// Read scratch size; holds the largest ASCII frame in one read
const SCRATCH_SIZE: usize = 520;

/// Default read/write timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Pause after a short write before sending the rest
const SHORT_WRITE_BACKOFF: Duration = Duration::from_millis(1);

/// Log packet with direction and format
pub(crate) fn log_packet(direction: &str, data: &[u8], protocol: &str, unit_id: Option<u8>) {
    let hex_string = bytes_to_hex(data);
    match unit_id {
        Some(id) => info!("[MODBUS-{}] {} slave:{} {}", protocol, direction, id, hex_string),
        None => info!("[MODBUS-{}] {} {}", protocol, direction, hex_string),
    }
}

/// Byte stream a transport can carry frames over
///
/// The provided methods are no-ops for channels without direction lines or
/// liveness probing.
pub trait ByteChannel: AsyncRead + AsyncWrite + Send + Unpin {
    /// Drive the RS-485 direction lines (RTS and DTR) to `level`
    fn set_direction_lines(&mut self, _level: bool) -> ModbusResult<()> {
        Ok(())
    }

    /// Check that the channel is still usable without consuming input
    ///
    /// With `urgent` a one-byte out-of-band probe is sent where supported.
    fn probe(&self, _urgent: bool) -> io::Result<()> {
        Ok(())
    }

    /// Release the underlying device once the transport is done with it
    fn release(&mut self) -> ModbusResult<()> {
        Ok(())
    }
}

fn release(channel: &mut dyn ByteChannel) {
    if let Err(e) = channel.release() {
        warn!("Failed to release channel: {}", e);
    }
}

impl ByteChannel for TcpStream {
    fn probe(&self, urgent: bool) -> io::Result<()> {
        let socket = socket2::SockRef::from(self);
        if let Some(err) = socket.take_error()? {
            return Err(err);
        }

        let mut buf = [std::mem::MaybeUninit::<u8>::uninit(); 1];
        match socket.peek(&mut buf) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed the connection",
                ))
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }

        if urgent {
            socket.send_out_of_band(&[0])?;
        }
        Ok(())
    }
}

impl ByteChannel for tokio::io::DuplexStream {}

#[cfg(test)]
impl ByteChannel for tokio_test::io::Mock {}

/// Shared close signal for a transport's channel
///
/// Cloning is cheap; every clone closes the same channel.
#[derive(Debug, Clone)]
pub struct CloseHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl CloseHandle {
    fn new() -> (Self, watch::Receiver<bool>) {
        let (sender, receiver) = watch::channel(false);
        (
            Self {
                sender: Arc::new(sender),
            },
            receiver,
        )
    }

    /// Signal close; in-flight reads and writes fail with `ChannelClosed`
    pub fn close(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.sender.borrow()
    }
}

async fn closed_signal(receiver: &mut watch::Receiver<bool>) {
    // A dropped sender also counts as closed
    let _ = receiver.wait_for(|closed| *closed).await;
}

/// Timestamp of the last byte read or written, shareable across tasks
#[derive(Debug, Clone)]
pub struct ActivityClock {
    base: Instant,
    last: Arc<AtomicU64>,
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            last: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record activity now
    pub fn touch(&self) {
        let elapsed = self.base.elapsed().as_millis() as u64;
        self.last.store(elapsed, Ordering::Relaxed);
    }

    /// Time since the last recorded activity
    pub fn idle(&self) -> Duration {
        let now = self.base.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last.load(Ordering::Relaxed)))
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Transport layer statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// One byte channel plus the codec that frames it
pub struct Transport {
    codec: FrameCodec,
    channel: Option<Box<dyn ByteChannel>>,
    /// Bytes read from the channel but not yet consumed by the codec
    pending: BytesMut,
    scratch: [u8; SCRATCH_SIZE],
    timeout: Duration,
    echo: bool,
    rs485: Rs485Settings,
    closer: CloseHandle,
    closed: watch::Receiver<bool>,
    activity: ActivityClock,
    stats: TransportStats,
    /// Wire bytes of the last request sent, kept for diagnostics
    last_request: Option<Vec<u8>>,
    transaction_id: u16,
    /// Enable packet logging for debugging
    packet_logging: bool,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("codec", &self.codec)
            .field("open", &self.is_open())
            .field("timeout", &self.timeout)
            .field("echo", &self.echo)
            .field("stats", &self.stats)
            .finish()
    }
}

impl Transport {
    /// Create a transport over `channel` framed by `codec`
    pub fn new(channel: impl ByteChannel + 'static, codec: FrameCodec) -> Self {
        Self::from_boxed(Box::new(channel), codec)
    }

    pub fn from_boxed(channel: Box<dyn ByteChannel>, codec: FrameCodec) -> Self {
        let (closer, closed) = CloseHandle::new();
        Self {
            codec,
            channel: Some(channel),
            pending: BytesMut::with_capacity(SCRATCH_SIZE),
            scratch: [0u8; SCRATCH_SIZE],
            timeout: DEFAULT_TIMEOUT,
            echo: false,
            rs485: Rs485Settings::default(),
            closer,
            closed,
            activity: ActivityClock::new(),
            stats: TransportStats::default(),
            last_request: None,
            transaction_id: 0,
            packet_logging: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Half-duplex echo: every write reads back its own bytes before completing
    pub fn set_echo(&mut self, echo: bool) {
        self.echo = echo;
    }

    pub fn set_rs485(&mut self, rs485: Rs485Settings) {
        self.rs485 = rs485;
    }

    /// Enable or disable packet logging
    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    pub fn codec(&self) -> FrameCodec {
        self.codec
    }

    /// Replace the channel, keeping codec, settings and statistics
    ///
    /// Close handles obtained for the previous channel no longer apply.
    pub fn rebind(&mut self, channel: impl ByteChannel + 'static) {
        self.rebind_boxed(Box::new(channel));
    }

    pub fn rebind_boxed(&mut self, channel: Box<dyn ByteChannel>) {
        let (closer, closed) = CloseHandle::new();
        self.closer = closer;
        self.closed = closed;
        self.pending.clear();
        self.channel = Some(channel);
        self.activity.touch();
    }

    /// Detach the channel without shutting it down
    pub fn take_channel(&mut self) -> Option<Box<dyn ByteChannel>> {
        self.pending.clear();
        self.channel.take()
    }

    pub fn close_handle(&self) -> CloseHandle {
        self.closer.clone()
    }

    pub fn activity(&self) -> ActivityClock {
        self.activity.clone()
    }

    pub fn stats(&self) -> TransportStats {
        self.stats.clone()
    }

    /// Wire bytes of the last request written
    pub fn last_request(&self) -> Option<&[u8]> {
        self.last_request.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_some() && !*self.closed.borrow()
    }

    /// Probe channel liveness
    pub fn probe(&self, urgent: bool) -> ModbusResult<()> {
        if *self.closed.borrow() {
            return Err(ModbusError::channel_closed("transport closed"));
        }
        match &self.channel {
            Some(channel) => channel.probe(urgent).map_err(ModbusError::from),
            None => Err(ModbusError::connection("Transport has no channel")),
        }
    }

    /// Close the channel; repeated calls are harmless
    pub async fn close(&mut self) {
        self.closer.close();
        self.pending.clear();
        if let Some(mut channel) = self.channel.take() {
            let _ = channel.shutdown().await;
            release(channel.as_mut());
        }
    }

    /// Close without flushing; used where no async context is available
    pub fn discard(&mut self) {
        self.closer.close();
        self.pending.clear();
        if let Some(mut channel) = self.channel.take() {
            release(channel.as_mut());
        }
    }

    /// Read whatever the channel delivers next into the pending buffer
    ///
    /// `wait` bounds the wait; `None` blocks until data arrives or the
    /// channel closes. End of stream is reported as `ChannelClosed`.
    async fn fill(&mut self, wait: Option<Duration>) -> ModbusResult<usize> {
        let channel = self
            .channel
            .as_mut()
            .ok_or_else(|| ModbusError::connection("Transport has no channel"))?;
        let closed = &mut self.closed;
        let scratch = &mut self.scratch;

        let read = async {
            tokio::select! {
                result = channel.read(&mut scratch[..]) => result.map_err(ModbusError::from),
                _ = closed_signal(closed) => Err(ModbusError::channel_closed("transport closed")),
            }
        };
        let n = match wait {
            Some(window) => match timeout(window, read).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(ModbusError::timeout(
                        "read",
                        window.as_millis() as u64,
                    ))
                }
            },
            None => read.await?,
        };

        if n == 0 {
            return Err(ModbusError::channel_closed("end of stream"));
        }
        self.pending.extend_from_slice(&self.scratch[..n]);
        self.stats.bytes_received += n as u64;
        self.activity.touch();
        Ok(n)
    }

    /// Read one byte
    pub async fn read_byte(&mut self, wait: Option<Duration>) -> ModbusResult<u8> {
        if self.pending.is_empty() {
            self.fill(wait).await?;
        }
        Ok(self.pending.get_u8())
    }

    /// Read exactly `len` bytes, each fill bounded by `wait`
    pub async fn read_exact(&mut self, len: usize, wait: Option<Duration>) -> ModbusResult<Vec<u8>> {
        while self.pending.len() < len {
            self.fill(wait).await?;
        }
        Ok(self.pending.split_to(len).to_vec())
    }

    /// Copy up to `buf.len()` bytes, waiting at most `wait` for the first
    ///
    /// A short count, including zero after the window elapses, is not an
    /// error.
    pub async fn read_available(&mut self, buf: &mut [u8], wait: Duration) -> ModbusResult<usize> {
        if self.pending.is_empty() {
            match self.fill(Some(wait)).await {
                Ok(_) => {}
                Err(e) if e.is_timeout() => return Ok(0),
                Err(e) => return Err(e),
            }
        }
        let n = buf.len().min(self.pending.len());
        self.pending.copy_to_slice(&mut buf[..n]);
        Ok(n)
    }

    /// True when data is pending or arrives within `window`
    pub async fn wait_for_data(&mut self, window: Duration) -> ModbusResult<bool> {
        if !self.pending.is_empty() {
            return Ok(true);
        }
        match self.fill(Some(window)).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_timeout() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Drop buffered input and anything the channel has ready right now
    pub fn clear_input(&mut self) {
        self.pending.clear();
        let Some(channel) = self.channel.as_mut() else {
            return;
        };
        let mut dropped = 0usize;
        while let Some(Ok(n)) = channel.read(&mut self.scratch[..]).now_or_never() {
            if n == 0 {
                break;
            }
            dropped += n;
        }
        if dropped > 0 {
            debug!("Cleared {} bytes of pending input", dropped);
        }
    }

    /// Write all bytes, then flush
    ///
    /// Short writes are continued after a brief pause; a write that accepts
    /// nothing is fatal.
    async fn send_all(&mut self, bytes: &[u8]) -> ModbusResult<()> {
        let window = self.timeout;
        let channel = self
            .channel
            .as_mut()
            .ok_or_else(|| ModbusError::connection("Transport has no channel"))?;
        let closed = &mut self.closed;

        let send = async {
            let mut offset = 0;
            while offset < bytes.len() {
                let n = tokio::select! {
                    result = channel.write(&bytes[offset..]) => result?,
                    _ = closed_signal(closed) => {
                        return Err(ModbusError::channel_closed("transport closed"));
                    }
                };
                if n == 0 {
                    return Err(ModbusError::io("failed to write (returned 0)"));
                }
                offset += n;
                if offset < bytes.len() {
                    sleep(SHORT_WRITE_BACKOFF).await;
                }
            }
            channel.flush().await?;
            Ok::<(), ModbusError>(())
        };

        match timeout(window, send).await {
            Ok(result) => result,
            Err(_) => Err(ModbusError::timeout("write", window.as_millis() as u64)),
        }
    }

    /// Send raw bytes with RS-485 direction control and echo handling
    pub async fn write_raw(&mut self, bytes: &[u8]) -> ModbusResult<()> {
        let rs485 = self.rs485;
        if rs485.enabled {
            if let Some(channel) = self.channel.as_mut() {
                channel.set_direction_lines(rs485.transmit_level())?;
            }
            if !rs485.delay_before_tx().is_zero() {
                sleep(rs485.delay_before_tx()).await;
            }
        }

        let result = self.send_all(bytes).await;

        if rs485.enabled {
            if !rs485.delay_after_tx().is_zero() {
                sleep(rs485.delay_after_tx()).await;
            }
            if let Some(channel) = self.channel.as_mut() {
                channel.set_direction_lines(rs485.receive_level())?;
            }
        }
        result?;

        self.stats.bytes_sent += bytes.len() as u64;
        self.activity.touch();

        if self.echo {
            let wait = Some(self.timeout);
            let echoed = self.read_exact(bytes.len(), wait).await?;
            if echoed != bytes {
                return Err(ModbusError::frame(format!(
                    "Echo mismatch: sent [{}], read back [{}]",
                    bytes_to_hex(bytes),
                    bytes_to_hex(&echoed)
                )));
            }
        }
        Ok(())
    }

    /// Next MBAP transaction id; zero is skipped
    fn next_transaction_id(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        if self.transaction_id == 0 {
            self.transaction_id = 1;
        }
        self.transaction_id
    }

    /// Encode and send a request (master side)
    pub async fn write_request(&mut self, request: &Frame) -> ModbusResult<()> {
        let transaction_id = match self.codec {
            FrameCodec::Tcp => self.next_transaction_id(),
            _ => 0,
        };
        if let FrameCodec::Rtu(timing) = self.codec {
            sleep(timing.inter_frame()).await;
        }

        let wire = self.codec.encode(request, transaction_id);
        if self.packet_logging {
            log_packet("send", &wire, self.codec.name(), Some(request.unit_id));
        }
        self.last_request = Some(wire.clone());
        self.stats.requests_sent += 1;

        if let Err(e) = self.write_raw(&wire).await {
            self.record_error(&e);
            return Err(e);
        }
        Ok(())
    }

    /// Read the response to the last request (master side)
    ///
    /// For MBAP the transaction id must match the request.
    pub async fn read_response(&mut self) -> ModbusResult<Frame> {
        let codec = self.codec;
        let result = codec.read_response(self).await.and_then(|frame| {
            if codec == FrameCodec::Tcp && frame.transaction_id != Some(self.transaction_id) {
                return Err(ModbusError::protocol(format!(
                    "Transaction ID mismatch: expected {}, got {:?}",
                    self.transaction_id, frame.transaction_id
                )));
            }
            Ok(frame)
        });

        match result {
            Ok(frame) => {
                self.stats.responses_received += 1;
                if self.packet_logging {
                    let wire = codec.encode(&frame, frame.transaction_id.unwrap_or(0));
                    log_packet("receive", &wire, codec.name(), Some(frame.unit_id));
                }
                Ok(frame)
            }
            Err(e) => {
                self.record_error(&e);
                Err(e)
            }
        }
    }

    /// Write a request and read its response
    pub async fn exchange(&mut self, request: &Frame) -> ModbusResult<Frame> {
        self.write_request(request).await?;
        self.read_response().await
    }

    /// Read the next request addressed to `listener` (slave side)
    pub async fn read_request(&mut self, listener: &dyn RequestListener) -> ModbusResult<Frame> {
        let codec = self.codec;
        let frame = codec.read_request(self, listener).await?;
        if self.packet_logging {
            let wire = codec.encode(&frame, frame.transaction_id.unwrap_or(0));
            log_packet("receive", &wire, codec.name(), Some(frame.unit_id));
        }
        Ok(frame)
    }

    /// Encode and send a response (slave side)
    pub async fn write_response(&mut self, response: &Frame) -> ModbusResult<()> {
        let wire = self
            .codec
            .encode(response, response.transaction_id.unwrap_or(0));
        if self.packet_logging {
            log_packet("send", &wire, self.codec.name(), Some(response.unit_id));
        }
        self.write_raw(&wire).await
    }

    fn record_error(&mut self, error: &ModbusError) {
        self.stats.errors += 1;
        if error.is_timeout() {
            self.stats.timeouts += 1;
        }
    }
}
