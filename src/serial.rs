//! Serial port capability and parameters
//!
//! The stack talks to serial hardware through [`SerialPortIo`], a small
//! capability interface: open/close, line parameters, the two modem control
//! lines used for RS-485 direction switching, timeouts, and an async byte
//! stream. [`TokioSerialPort`] implements it over `tokio-serial`;
//! [`MemorySerialPort`] is an in-memory port for simulators and tests.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio_serial::{SerialPort, SerialStream};

use crate::codec::FrameCodec;
use crate::error::{ModbusError, ModbusResult};
use crate::timing::{Rs485Settings, SerialTiming};
use crate::transport::ByteChannel;

/// Parity bit setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }
}

/// Serial framing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SerialEncoding {
    Ascii,
    #[default]
    Rtu,
}

/// Serial line settings for a slave or master
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialParameters {
    pub port_name: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
    pub encoding: SerialEncoding,
    /// Half-duplex: the port reads back everything it transmits
    pub echo: bool,
    pub rs485: Rs485Settings,
    pub timeout_ms: u64,
}

impl Default for SerialParameters {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            encoding: SerialEncoding::Rtu,
            echo: false,
            rs485: Rs485Settings::default(),
            timeout_ms: 1000,
        }
    }
}

impl SerialParameters {
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> ModbusResult<()> {
        if self.port_name.trim().is_empty() {
            return Err(ModbusError::configuration("Serial port name is empty"));
        }
        if self.baud_rate == 0 {
            return Err(ModbusError::configuration("Baud rate must be positive"));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(ModbusError::configuration(format!(
                "Invalid data bits: {} (must be 5-8)",
                self.data_bits
            )));
        }
        if !matches!(self.stop_bits, 1 | 2) {
            return Err(ModbusError::configuration(format!(
                "Invalid stop bits: {} (must be 1 or 2)",
                self.stop_bits
            )));
        }
        Ok(())
    }

    pub fn timing(&self) -> SerialTiming {
        SerialTiming::from_baud(self.baud_rate)
    }

    pub fn codec(&self) -> FrameCodec {
        match self.encoding {
            SerialEncoding::Ascii => FrameCodec::Ascii,
            SerialEncoding::Rtu => FrameCodec::Rtu(self.timing()),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Capabilities the stack needs from a serial port driver
pub trait SerialPortIo: AsyncRead + AsyncWrite + Send + Unpin {
    fn open(&mut self) -> ModbusResult<()>;

    fn close(&mut self) -> ModbusResult<()>;

    fn is_open(&self) -> bool;

    fn set_parameters(&mut self, baud_rate: u32, data_bits: u8, stop_bits: u8, parity: Parity) -> ModbusResult<()>;

    /// Drive Data Terminal Ready
    fn set_dtr(&mut self, level: bool) -> ModbusResult<()>;

    /// Drive Request To Send
    fn set_rts(&mut self, level: bool) -> ModbusResult<()>;

    fn set_timeouts(&mut self, read: Duration, write: Duration) -> ModbusResult<()>;

    /// Identifier of the underlying device, e.g. `/dev/ttyUSB0`
    fn port_id(&self) -> String;
}

impl ByteChannel for Box<dyn SerialPortIo> {
    fn set_direction_lines(&mut self, level: bool) -> ModbusResult<()> {
        self.set_rts(level)?;
        self.set_dtr(level)
    }

    fn release(&mut self) -> ModbusResult<()> {
        SerialPortIo::close(&mut **self)
    }
}

fn data_bits(bits: u8) -> tokio_serial::DataBits {
    match bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    }
}

fn stop_bits(bits: u8) -> tokio_serial::StopBits {
    match bits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    }
}

fn not_open() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "serial port not open")
}

/// Serial port backed by `tokio-serial`
pub struct TokioSerialPort {
    port_name: String,
    baud_rate: u32,
    data_bits: u8,
    stop_bits: u8,
    parity: Parity,
    timeout: Duration,
    stream: Option<SerialStream>,
}

impl TokioSerialPort {
    pub fn new(params: &SerialParameters) -> Self {
        Self {
            port_name: params.port_name.clone(),
            baud_rate: params.baud_rate,
            data_bits: params.data_bits,
            stop_bits: params.stop_bits,
            parity: params.parity,
            timeout: params.timeout(),
            stream: None,
        }
    }

    fn stream_mut(&mut self) -> ModbusResult<&mut SerialStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| ModbusError::connection(format!("Serial port {} not open", self.port_name)))
    }
}

impl SerialPortIo for TokioSerialPort {
    fn open(&mut self) -> ModbusResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let builder = tokio_serial::new(&self.port_name, self.baud_rate)
            .data_bits(data_bits(self.data_bits))
            .stop_bits(stop_bits(self.stop_bits))
            .parity(self.parity.into())
            .timeout(self.timeout);
        let stream = SerialStream::open(&builder).map_err(|e| {
            ModbusError::connection(format!("Failed to open serial port {}: {}", self.port_name, e))
        })?;
        info!("Opened serial port {} at {} baud", self.port_name, self.baud_rate);
        self.stream = Some(stream);
        Ok(())
    }

    fn close(&mut self) -> ModbusResult<()> {
        if self.stream.take().is_some() {
            debug!("Closed serial port {}", self.port_name);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn set_parameters(&mut self, baud_rate: u32, data_bit_count: u8, stop_bit_count: u8, parity: Parity) -> ModbusResult<()> {
        self.baud_rate = baud_rate;
        self.data_bits = data_bit_count;
        self.stop_bits = stop_bit_count;
        self.parity = parity;
        if let Some(stream) = self.stream.as_mut() {
            stream.set_baud_rate(baud_rate)?;
            stream.set_data_bits(data_bits(data_bit_count))?;
            stream.set_stop_bits(stop_bits(stop_bit_count))?;
            stream.set_parity(parity.into())?;
        }
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> ModbusResult<()> {
        self.stream_mut()?.write_data_terminal_ready(level)?;
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> ModbusResult<()> {
        self.stream_mut()?.write_request_to_send(level)?;
        Ok(())
    }

    fn set_timeouts(&mut self, read: Duration, _write: Duration) -> ModbusResult<()> {
        // tokio-serial has a single timeout; reads are bounded by the transport
        self.timeout = read;
        if let Some(stream) = self.stream.as_mut() {
            stream.set_timeout(read)?;
        }
        Ok(())
    }

    fn port_id(&self) -> String {
        self.port_name.clone()
    }
}

impl AsyncRead for TokioSerialPort {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_read(cx, buf),
            None => Poll::Ready(Err(not_open())),
        }
    }
}

impl AsyncWrite for TokioSerialPort {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut().stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_write(cx, buf),
            None => Poll::Ready(Err(not_open())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

/// Observable state of a [`MemorySerialPort`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineState {
    pub open: bool,
    pub dtr: bool,
    pub rts: bool,
    pub baud_rate: u32,
    /// Every RTS level change, in order
    pub rts_history: Vec<bool>,
}

/// In-memory serial port; the other end of the pair plays the remote device
pub struct MemorySerialPort {
    name: String,
    stream: DuplexStream,
    state: Arc<Mutex<LineState>>,
}

impl MemorySerialPort {
    /// Create a port and the stream connected to its far end
    pub fn pair(name: impl Into<String>, buffer: usize) -> (Self, DuplexStream) {
        let (local, remote) = tokio::io::duplex(buffer);
        let port = Self {
            name: name.into(),
            stream: local,
            state: Arc::new(Mutex::new(LineState::default())),
        };
        (port, remote)
    }

    /// Shared view of line state for assertions and simulators
    pub fn line_state(&self) -> Arc<Mutex<LineState>> {
        self.state.clone()
    }

    fn update(&self, apply: impl FnOnce(&mut LineState)) -> ModbusResult<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| ModbusError::internal("Serial line state lock poisoned"))?;
        apply(&mut state);
        Ok(())
    }
}

impl SerialPortIo for MemorySerialPort {
    fn open(&mut self) -> ModbusResult<()> {
        self.update(|state| state.open = true)
    }

    fn close(&mut self) -> ModbusResult<()> {
        self.update(|state| state.open = false)
    }

    fn is_open(&self) -> bool {
        self.state.lock().map(|state| state.open).unwrap_or(false)
    }

    fn set_parameters(&mut self, baud_rate: u32, _data_bits: u8, _stop_bits: u8, _parity: Parity) -> ModbusResult<()> {
        self.update(|state| state.baud_rate = baud_rate)
    }

    fn set_dtr(&mut self, level: bool) -> ModbusResult<()> {
        self.update(|state| state.dtr = level)
    }

    fn set_rts(&mut self, level: bool) -> ModbusResult<()> {
        self.update(|state| {
            state.rts = level;
            state.rts_history.push(level);
        })
    }

    fn set_timeouts(&mut self, _read: Duration, _write: Duration) -> ModbusResult<()> {
        Ok(())
    }

    fn port_id(&self) -> String {
        self.name.clone()
    }
}

impl AsyncRead for MemorySerialPort {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemorySerialPort {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

/// Transport over an opened serial port, configured from `params`
pub fn serial_transport(mut port: Box<dyn SerialPortIo>, params: &SerialParameters) -> ModbusResult<crate::transport::Transport> {
    port.open()?;
    port.set_parameters(params.baud_rate, params.data_bits, params.stop_bits, params.parity)?;
    port.set_timeouts(params.timeout(), params.timeout())?;
    if params.rs485.enabled {
        port.set_rts(params.rs485.receive_level())?;
        port.set_dtr(params.rs485.receive_level())?;
    }

    let mut transport = crate::transport::Transport::new(port, params.codec()).with_timeout(params.timeout());
    transport.set_echo(params.echo);
    transport.set_rs485(params.rs485);
    Ok(transport)
}
