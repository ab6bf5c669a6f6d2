//! # Voltage Modbus Stack - Modbus master/slave stack for TCP, RTU and ASCII
//!
//! An async Modbus stack covering both sides of the wire: masters that open
//! outbound connections and issue requests, and slaves that listen on TCP,
//! UDP or serial endpoints and answer from application process images.
//!
//! ## Features
//!
//! - **🔧 Three framings**: ASCII (`:` .. LRC CR LF), RTU (CRC16, silence
//!   timing) and TCP/MBAP, plus RTU over TCP
//! - **⏱️ Serial timing**: 1.5t / 3.5t character windows, RS-485 direction
//!   control and half-duplex echo
//! - **🔌 Connection lifecycle**: idempotent connect/close, liveness probing,
//!   idle watchdog on slave connections
//! - **🗂️ Slave registry**: one listener per endpoint, reused or replaced on
//!   demand
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Master | Slave (RegisterBank) |
//! |------|----------|--------|-------|
//! | 0x01 | Read Coils | ✅ | ✅ |
//! | 0x02 | Read Discrete Inputs | ✅ | ✅ |
//! | 0x03 | Read Holding Registers | ✅ | ✅ |
//! | 0x04 | Read Input Registers | ✅ | ✅ |
//! | 0x05 | Write Single Coil | ✅ | ✅ |
//! | 0x06 | Write Single Register | ✅ | ✅ |
//! | 0x0F | Write Multiple Coils | ✅ | ✅ |
//! | 0x10 | Write Multiple Registers | ✅ | ✅ |
//! | 0x16 | Mask Write Register | ✅ | ✅ |
//! | 0x17 | Read/Write Multiple Registers | ✅ | ✅ |
//!
//! The RTU reader frames every code listed in [`protocol::ModbusFunction`].
//!
//! ## Quick Start
//!
//! ### Master
//!
//! ```rust,no_run
//! use voltage_modbus_stack::{ModbusMaster, ModbusResult, TcpMasterConnection};
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let mut connection = TcpMasterConnection::new("127.0.0.1".parse().unwrap(), 502);
//!     connection.connect().await?;
//!
//!     let mut master = ModbusMaster::new(connection);
//!     let values = master.read_03(1, 0, 10).await?;
//!     println!("Read registers: {:?}", values);
//!     master.write_06(1, 100, 0x1234).await?;
//!
//!     master.link_mut().close().await;
//!     Ok(())
//! }
//! ```
//!
//! ### Slave
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voltage_modbus_stack::{RegisterBank, SlaveRegistry, TcpSlaveConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = SlaveRegistry::new();
//!     let slave = registry.create_tcp_slave(TcpSlaveConfig::new(5020)).await?;
//!     slave.add_process_image(1, Arc::new(RegisterBank::new()));
//!
//!     tokio::signal::ctrl_c().await?;
//!     registry.close_all().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐          ┌──────────────────┐
//! │  ModbusMaster    │          │  SlaveRegistry   │
//! └──────────────────┘          └──────────────────┘
//!          │                             │
//! ┌──────────────────┐          ┌──────────────────┐
//! │ TcpMasterConn.   │          │ ModbusSlave      │──► ConnectionHandler
//! └──────────────────┘          └──────────────────┘     + watchdog
//!          │                             │
//! ┌──────────────────┐          ┌──────────────────┐
//! │ Transport        │◄────────►│ Transport        │──► ProcessImage
//! │ (FrameCodec)     │          │ (FrameCodec)     │
//! └──────────────────┘          └──────────────────┘
//! ```

/// Core error types and result handling
pub mod error;

/// LRC and CRC16 checksums
pub mod checksum;

/// Serial character timing and RS-485 settings
pub mod timing;

/// Function codes, length tables and the framing-neutral frame
pub mod protocol;

/// ASCII, RTU and MBAP framing
pub mod codec;

/// Byte channel plus codec
pub mod transport;

/// Serial port capability and drivers
pub mod serial;

/// Outbound TCP connections
pub mod master;

/// Typed master requests
pub mod client;

/// Process image dispatch
pub mod image;

/// Per-connection slave handler
pub mod handler;

/// TCP, UDP and serial slave listeners
pub mod slave;

/// One slave per endpoint
pub mod registry;

/// In-memory process image
pub mod register_bank;

/// Stack configuration
pub mod config;

/// Validation, formatting and logger helpers
pub mod utils;

/// Callback-based transaction logging
pub mod logging;

// Re-export main types for convenience
pub use client::{MasterLink, ModbusMaster};
pub use codec::FrameCodec;
pub use config::{MasterConfig, StackConfig, TcpSlaveConfig, UdpSlaveConfig};
pub use error::{ModbusError, ModbusResult};
pub use handler::ConnectionHandler;
pub use image::{handle_request, ProcessImage, RequestListener, UnitMap};
pub use logging::{CallbackLogger, LogCallback, LogLevel, LoggingMode};
pub use master::TcpMasterConnection;
pub use protocol::{Frame, ModbusException, ModbusFunction};
pub use register_bank::RegisterBank;
pub use registry::SlaveRegistry;
pub use serial::{MemorySerialPort, SerialParameters, SerialPortIo, TokioSerialPort};
pub use slave::{ModbusSlave, SlaveKey, SlaveKind};
pub use timing::{Rs485Settings, SerialTiming};
pub use transport::{ByteChannel, Transport, TransportStats};

/// Default timeout for operations (1 second)
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Maximum number of coils that can be read in a single request
pub const MAX_COILS_PER_REQUEST: u16 = 2000;

/// Maximum number of registers that can be read in a single request
pub const MAX_REGISTERS_PER_REQUEST: u16 = 125;

/// Maximum number of coils that can be written in a single request
pub const MAX_WRITE_COILS_PER_REQUEST: u16 = 1968;

/// Maximum number of registers that can be written in a single request
pub const MAX_WRITE_REGISTERS_PER_REQUEST: u16 = 123;

/// Maximum Modbus TCP frame size (MBAP header + PDU)
pub const MAX_TCP_FRAME_SIZE: usize = 260;

/// Maximum Modbus RTU frame size
pub const MAX_RTU_FRAME_SIZE: usize = 256;

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Voltage Modbus Stack v{} - Modbus master/slave stack for TCP/RTU/ASCII", VERSION)
}
