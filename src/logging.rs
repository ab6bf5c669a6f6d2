//! Callback-based logging of master transactions
//!
//! Applications that do not use the `log` facade can receive interpreted
//! request and response lines through a [`CallbackLogger`].

use std::sync::Arc;

use crate::protocol::{Frame, ModbusFunction};
use crate::utils::format::bytes_to_hex;

/// Log levels for the callback logging system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

/// Logging mode for packet display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// Wire bytes only
    Raw,
    /// Decoded fields only
    Interpreted,
    /// Decoded fields at info, wire bytes at debug
    Both,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// Callback receiving a level and a formatted line
pub type LogCallback = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Logger that forwards lines to a callback
#[derive(Clone)]
pub struct CallbackLogger {
    callback: Option<Arc<LogCallback>>,
    min_level: LogLevel,
    mode: LoggingMode,
}

impl CallbackLogger {
    pub fn new(callback: Option<LogCallback>, min_level: LogLevel) -> Self {
        Self::with_mode(callback, min_level, LoggingMode::Interpreted)
    }

    pub fn with_mode(callback: Option<LogCallback>, min_level: LogLevel, mode: LoggingMode) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
            mode,
        }
    }

    /// Timestamped console output
    pub fn console() -> Self {
        let callback: LogCallback = Box::new(|level, message| {
            let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
            match level {
                LogLevel::Error | LogLevel::Warn => {
                    eprintln!("[{}] {}: {}", timestamp, level.as_str(), message)
                }
                LogLevel::Info | LogLevel::Debug => {
                    println!("[{}] {}: {}", timestamp, level.as_str(), message)
                }
            }
        });
        Self::new(Some(callback), LogLevel::Info)
    }

    pub fn disabled() -> Self {
        Self::new(None, LogLevel::Error)
    }

    pub fn set_mode(&mut self, mode: LoggingMode) {
        self.mode = mode;
    }

    pub fn mode(&self) -> LoggingMode {
        self.mode
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        if self.should_log(level) {
            if let Some(ref callback) = self.callback {
                callback(level, message);
            }
        }
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    fn should_log(&self, level: LogLevel) -> bool {
        self.callback.is_some() && level as u8 <= self.min_level as u8
    }

    /// Log wire bytes with a direction tag
    pub fn log_packet(&self, level: LogLevel, direction: &str, data: &[u8]) {
        if !self.should_log(level) {
            return;
        }
        let message = format!("{} packet ({} bytes): {}", direction, data.len(), bytes_to_hex(data));
        self.log(level, &message);
    }

    /// Log an outgoing request; `wire` is the encoded frame if known
    pub fn log_request(&self, request: &Frame, wire: Option<&[u8]>) {
        let interpreted = format!(
            "Modbus Request -> Slave: {}, Function: {} (0x{:02X}), {}",
            request.unit_id,
            function_name(request.function_code),
            request.function_code,
            interpret_request(request)
        );
        self.emit("Modbus Request ->", interpreted, request, wire);
    }

    /// Log a received response; `wire` is the encoded frame if known
    pub fn log_response(&self, response: &Frame, wire: Option<&[u8]>) {
        let interpreted = format!(
            "Modbus Response <- Slave: {}, Function: {} (0x{:02X}), {}",
            response.unit_id,
            function_name(response.function_code),
            response.function_code,
            interpret_response(response)
        );
        self.emit("Modbus Response <-", interpreted, response, wire);
    }

    fn emit(&self, tag: &str, interpreted: String, frame: &Frame, wire: Option<&[u8]>) {
        let raw = || {
            let bytes = wire.map(|w| w.to_vec()).unwrap_or_else(|| frame.pdu_bytes());
            format!("{} Raw: {}", tag, bytes_to_hex(&bytes))
        };
        match self.mode {
            LoggingMode::Raw => self.info(&raw()),
            LoggingMode::Interpreted => self.info(&interpreted),
            LoggingMode::Both => {
                self.info(&interpreted);
                self.debug(&raw());
            }
        }
    }
}

impl Default for CallbackLogger {
    fn default() -> Self {
        Self::disabled()
    }
}

fn function_name(function_code: u8) -> &'static str {
    ModbusFunction::from_u8(function_code & 0x7F)
        .map(|f| f.name())
        .unwrap_or("Unknown Function")
}

fn interpret_request(request: &Frame) -> String {
    match (request.word(0), request.word(2)) {
        (Ok(address), Ok(value)) => format!("Address: {}, Quantity/Value: {}", address, value),
        _ => format!("Data: {}", hex::encode(&request.payload)),
    }
}

fn interpret_response(response: &Frame) -> String {
    if let Some(code) = response.exception_code() {
        return format!("Exception: 0x{:02X}", code);
    }
    let data = &response.payload;
    if data.is_empty() {
        return "No data".to_string();
    }

    match response.function_code {
        0x01 | 0x02 => {
            let coils: Vec<bool> = data[1..]
                .iter()
                .flat_map(|byte| (0..8).map(move |bit| byte & (1 << bit) != 0))
                .take(16)
                .collect();
            format!("Byte count: {}, Coils: {:?}", data[0], coils)
        }
        0x03 | 0x04 | 0x17 => {
            let registers: Vec<u16> = data[1..]
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .take(8)
                .collect();
            format!("Byte count: {}, Registers: {:?}", data[0], registers)
        }
        0x05 if data.len() >= 4 => {
            let address = u16::from_be_bytes([data[0], data[1]]);
            let value = u16::from_be_bytes([data[2], data[3]]);
            format!(
                "Address: {}, Value: 0x{:04X} ({})",
                address,
                value,
                if value == 0xFF00 { "ON" } else { "OFF" }
            )
        }
        0x06 if data.len() >= 4 => {
            let address = u16::from_be_bytes([data[0], data[1]]);
            let value = u16::from_be_bytes([data[2], data[3]]);
            format!("Address: {}, Value: {} (0x{:04X})", address, value, value)
        }
        0x0F | 0x10 if data.len() >= 4 => {
            let address = u16::from_be_bytes([data[0], data[1]]);
            let quantity = u16::from_be_bytes([data[2], data[3]]);
            format!("Address: {}, Quantity: {}", address, quantity)
        }
        _ => format!("Data: {}", hex::encode(data)),
    }
}

/// Convenience macro for creating a simple console logger
#[macro_export]
macro_rules! console_logger {
    () => {
        $crate::logging::CallbackLogger::console()
    };
}

/// Convenience macro for creating a custom logger
#[macro_export]
macro_rules! custom_logger {
    ($callback:expr) => {
        $crate::logging::CallbackLogger::new(Some($callback), $crate::logging::LogLevel::Info)
    };
    ($callback:expr, $level:expr) => {
        $crate::logging::CallbackLogger::new(Some($callback), $level)
    };
    ($callback:expr, $level:expr, $mode:expr) => {
        $crate::logging::CallbackLogger::with_mode(Some($callback), $level, $mode)
    };
}
