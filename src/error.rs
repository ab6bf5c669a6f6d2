//! # Error Handling
//!
//! Every fallible operation in the stack returns [`ModbusResult`]. The error
//! enum is flat, but each variant belongs to one of four families that decide
//! how the caller reacts:
//!
//! ### Framing errors
//! - **Frame**: malformed delimiter, bad MBAP header, non-hex ASCII digit
//! - **CrcMismatch** / **LrcMismatch**: checksum validation failures
//! - **InvalidFunction**: function or sub-function code with no known length rule
//!
//! ### Timeout errors
//! - **Timeout**: no data within the configured window
//!
//! ### Channel errors
//! - **Io**: read/write failure reported by the socket or serial driver
//! - **Connection**: connect/bind failures, channel not available
//! - **ChannelClosed**: end of stream, or the channel was closed underneath
//!   an in-flight read/write
//!
//! ### Protocol state errors
//! - **Protocol**: response shape does not match the request
//! - **Exception**: the remote device answered with a Modbus exception
//!
//! ## Propagation
//!
//! A slave connection handler stops on any error raised while decoding a frame
//! that is addressed to it. A serial slave listener logs framing errors and
//! timeouts and keeps listening. On the master side a checksum mismatch is
//! reported to the caller of that request while the connection stays open:
//!
//! ```rust
//! use voltage_modbus_stack::{ModbusError, ModbusResult};
//!
//! fn classify(result: ModbusResult<Vec<u16>>) {
//!     match result {
//!         Ok(values) => println!("Read {:?}", values),
//!         Err(e) if e.is_framing_error() => println!("Corrupted frame, retry: {}", e),
//!         Err(e) if e.is_channel_error() => println!("Channel lost: {}", e),
//!         Err(e) => println!("Failed: {}", e),
//!     }
//! }
//! ```

use thiserror::Error;

/// Result type alias for Modbus operations
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Modbus stack error types
///
/// Each variant carries enough context to be logged on its own. Use the
/// classification helpers (`is_framing_error`, `is_channel_error`, ...)
/// rather than matching variants when deciding whether to retry or close.
#[derive(Error, Debug, Clone)]
pub enum ModbusError {
    /// I/O related errors (network, serial)
    ///
    /// # Examples
    /// - Connection reset by peer
    /// - Serial driver write failure
    /// - A write that made no progress
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection errors
    ///
    /// Connect, bind and "not connected" failures that are distinct from I/O
    /// on an established channel.
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// The channel reached end-of-stream or was closed while in use
    ///
    /// Raised when the peer closes a socket and when a close signal interrupts
    /// an in-flight read or write. Watchdog closes surface here as well.
    #[error("Channel closed: {message}")]
    ChannelClosed { message: String },

    /// Timeout errors
    ///
    /// Includes which operation timed out and the window that elapsed.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Protocol-level errors
    ///
    /// # Examples
    /// - Response unit id differs from the request
    /// - MBAP transaction id mismatch
    /// - Response function code does not match the request
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Function or sub-function code with no length rule in the active direction
    #[error("Invalid function code: 0x{code:02X}")]
    InvalidFunction { code: u8 },

    /// Invalid address range
    ///
    /// # Examples
    /// - Reading 200 holding registers (max 125)
    /// - Starting address + quantity > 65535
    #[error("Invalid address: start={start}, count={count}")]
    InvalidAddress { start: u16, count: u16 },

    /// Invalid data value
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// RTU CRC16 validation failure
    ///
    /// `context` carries optional diagnostic text, typically the hex dump of
    /// the request that provoked the corrupted response.
    #[error("CRC validation failed: expected={expected:04X}, actual={actual:04X}{context}")]
    CrcMismatch {
        expected: u16,
        actual: u16,
        context: String,
    },

    /// ASCII LRC validation failure
    #[error("LRC validation failed: expected={expected:02X}, actual={actual:02X}")]
    LrcMismatch { expected: u8, actual: u8 },

    /// Modbus exception response
    ///
    /// # Standard Exception Codes
    /// - 0x01: Illegal Function
    /// - 0x02: Illegal Data Address
    /// - 0x03: Illegal Data Value
    /// - 0x04: Slave Device Failure
    /// - 0x05: Acknowledge
    /// - 0x06: Slave Device Busy
    /// - 0x08: Memory Parity Error
    /// - 0x0A: Gateway Path Unavailable
    /// - 0x0B: Gateway Target Device Failed to Respond
    #[error("Modbus exception: function={function:02X}, code={code:02X} ({message})")]
    Exception {
        function: u8,
        code: u8,
        message: String,
    },

    /// Frame parsing errors
    ///
    /// # Examples
    /// - MBAP protocol id other than zero
    /// - Non-hex character inside an ASCII frame
    /// - Unsupported MEI sub-function in an RTU response
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Internal errors (should not occur in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ModbusError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a channel-closed error
    pub fn channel_closed<S: Into<String>>(message: S) -> Self {
        Self::ChannelClosed {
            message: message.into(),
        }
    }

    /// Create a new timeout error
    ///
    /// # Arguments
    ///
    /// * `operation` - Description of the operation that timed out
    /// * `timeout_ms` - Timeout duration in milliseconds
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create an invalid function error
    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    /// Create an invalid address error
    pub fn invalid_address(start: u16, count: u16) -> Self {
        Self::InvalidAddress { start, count }
    }

    /// Create an invalid data error
    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    /// Create a CRC mismatch error
    ///
    /// # Arguments
    ///
    /// * `expected` - CRC computed over the received bytes
    /// * `actual` - CRC carried by the frame
    pub fn crc_mismatch(expected: u16, actual: u16) -> Self {
        Self::CrcMismatch {
            expected,
            actual,
            context: String::new(),
        }
    }

    /// Create a CRC mismatch error that names the request it answered
    pub fn crc_mismatch_for_request(expected: u16, actual: u16, request: &[u8]) -> Self {
        Self::CrcMismatch {
            expected,
            actual,
            context: format!(" (last request: {})", crate::utils::format::bytes_to_hex(request)),
        }
    }

    /// Create an LRC mismatch error
    pub fn lrc_mismatch(expected: u8, actual: u8) -> Self {
        Self::LrcMismatch { expected, actual }
    }

    /// Create a Modbus exception error
    ///
    /// Standard exception codes are mapped to human-readable messages.
    pub fn exception(function: u8, code: u8) -> Self {
        let message = match code {
            0x01 => "Illegal Function",
            0x02 => "Illegal Data Address",
            0x03 => "Illegal Data Value",
            0x04 => "Slave Device Failure",
            0x05 => "Acknowledge",
            0x06 => "Slave Device Busy",
            0x08 => "Memory Parity Error",
            0x0A => "Gateway Path Unavailable",
            0x0B => "Gateway Target Device Failed to Respond",
            _ => "Unknown Exception",
        }
        .to_string();

        Self::Exception {
            function,
            code,
            message,
        }
    }

    /// Create a frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if the error is recoverable (can retry)
    ///
    /// Checksum mismatches count as recoverable: the connection is intact and
    /// the next transaction may well succeed.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use voltage_modbus_stack::ModbusError;
    ///
    /// assert!(ModbusError::timeout("read response", 1000).is_recoverable());
    /// assert!(ModbusError::crc_mismatch(0x1234, 0x4321).is_recoverable());
    /// assert!(!ModbusError::invalid_function(0x99).is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. } => true,
            Self::Connection { .. } => true,
            Self::Timeout { .. } => true,
            Self::CrcMismatch { .. } | Self::LrcMismatch { .. } => true,
            Self::Exception { code, .. } => {
                // Acknowledge, Busy
                matches!(code, 0x05 | 0x06)
            }
            _ => false,
        }
    }

    /// Checksum, delimiter or unsupported-function failures
    pub fn is_framing_error(&self) -> bool {
        matches!(
            self,
            Self::Frame { .. }
                | Self::CrcMismatch { .. }
                | Self::LrcMismatch { .. }
                | Self::InvalidFunction { .. }
        )
    }

    /// No data arrived within the configured window
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Read/write failures and closed channels; fatal for the connection
    pub fn is_channel_error(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Connection { .. } | Self::ChannelClosed { .. }
        )
    }

    /// The channel ended (peer close or local close signal)
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::ChannelClosed { .. })
    }

    /// Check if the error is a network/transport issue
    ///
    /// # Examples
    ///
    /// ```rust
    /// use voltage_modbus_stack::ModbusError;
    ///
    /// let connection_error = ModbusError::connection("Connection refused");
    /// assert!(connection_error.is_transport_error());
    ///
    /// let exception_error = ModbusError::exception(0x03, 0x02);
    /// assert!(!exception_error.is_transport_error());
    /// ```
    pub fn is_transport_error(&self) -> bool {
        self.is_channel_error() || self.is_timeout()
    }

    /// Check if the error is a protocol issue
    ///
    /// Covers framing errors as well as protocol state errors.
    pub fn is_protocol_error(&self) -> bool {
        self.is_framing_error() || matches!(self, Self::Protocol { .. } | Self::Exception { .. })
    }
}

/// Convert from std::io::Error
///
/// End-of-stream style kinds map to `ChannelClosed` so callers can tell a
/// peer hang-up from a driver failure.
impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => Self::channel_closed(err.to_string()),
            _ => Self::io(err.to_string()),
        }
    }
}

/// Convert from tokio timeout errors
///
/// The elapsed window is unknown here; transport code builds its timeout
/// errors explicitly with the configured duration.
impl From<tokio::time::error::Elapsed> for ModbusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

/// Convert from serde JSON errors
impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

/// Convert from serde YAML errors
impl From<serde_yaml::Error> for ModbusError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(format!("YAML error: {}", err))
    }
}

impl From<tokio_serial::Error> for ModbusError {
    fn from(err: tokio_serial::Error) -> Self {
        Self::connection(format!("Serial port error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_taxonomy() {
        let err = ModbusError::timeout("read_registers", 5000);
        assert!(err.is_recoverable());
        assert!(err.is_transport_error());
        assert!(err.is_timeout());
        assert!(!err.is_framing_error());

        let err = ModbusError::exception(0x03, 0x02);
        assert!(!err.is_recoverable());
        assert!(err.is_protocol_error());

        let err = ModbusError::lrc_mismatch(0xFA, 0xFF);
        assert!(err.is_framing_error());
        assert!(err.is_recoverable());

        let err = ModbusError::channel_closed("end of stream");
        assert!(err.is_eof());
        assert!(err.is_channel_error());
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = ModbusError::crc_mismatch(0x1234, 0x5678);
        let msg = format!("{}", err);
        assert!(msg.contains("CRC validation failed"));
        assert!(msg.contains("1234"));
        assert!(msg.contains("5678"));

        let err = ModbusError::crc_mismatch_for_request(0x1234, 0x5678, &[0x01, 0x03]);
        assert!(err.to_string().ends_with("(last request: 01 03)"));
    }

    #[test]
    fn test_io_error_mapping() {
        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert!(ModbusError::from(eof).is_eof());

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(matches!(ModbusError::from(denied), ModbusError::Io { .. }));
    }
}
