/// Modbus protocol definitions
///
/// Function codes, exception codes, the [`Frame`] shared by every codec and
/// the per-function length rules RTU framing relies on.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ModbusError, ModbusResult};

/// Modbus slave/unit identifier
pub type UnitId = u8;

/// Bit set on the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusFunction {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05)
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Read Exception Status (0x07)
    ReadExceptionStatus = 0x07,
    /// Diagnostics (0x08)
    Diagnostics = 0x08,
    /// Get Comm Event Counter (0x0B)
    GetCommEventCounter = 0x0B,
    /// Get Comm Event Log (0x0C)
    GetCommEventLog = 0x0C,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
    /// Report Server ID (0x11)
    ReportServerId = 0x11,
    /// Read File Record (0x14)
    ReadFileRecord = 0x14,
    /// Write File Record (0x15)
    WriteFileRecord = 0x15,
    /// Mask Write Register (0x16)
    MaskWriteRegister = 0x16,
    /// Read/Write Multiple Registers (0x17)
    ReadWriteMultipleRegisters = 0x17,
    /// Read FIFO Queue (0x18)
    ReadFifoQueue = 0x18,
    /// Encapsulated Interface Transport / Read Device Identification (0x2B)
    EncapsulatedInterface = 0x2B,
}

impl ModbusFunction {
    /// Convert from u8 to ModbusFunction
    pub fn from_u8(value: u8) -> ModbusResult<Self> {
        match value {
            0x01 => Ok(ModbusFunction::ReadCoils),
            0x02 => Ok(ModbusFunction::ReadDiscreteInputs),
            0x03 => Ok(ModbusFunction::ReadHoldingRegisters),
            0x04 => Ok(ModbusFunction::ReadInputRegisters),
            0x05 => Ok(ModbusFunction::WriteSingleCoil),
            0x06 => Ok(ModbusFunction::WriteSingleRegister),
            0x07 => Ok(ModbusFunction::ReadExceptionStatus),
            0x08 => Ok(ModbusFunction::Diagnostics),
            0x0B => Ok(ModbusFunction::GetCommEventCounter),
            0x0C => Ok(ModbusFunction::GetCommEventLog),
            0x0F => Ok(ModbusFunction::WriteMultipleCoils),
            0x10 => Ok(ModbusFunction::WriteMultipleRegisters),
            0x11 => Ok(ModbusFunction::ReportServerId),
            0x14 => Ok(ModbusFunction::ReadFileRecord),
            0x15 => Ok(ModbusFunction::WriteFileRecord),
            0x16 => Ok(ModbusFunction::MaskWriteRegister),
            0x17 => Ok(ModbusFunction::ReadWriteMultipleRegisters),
            0x18 => Ok(ModbusFunction::ReadFifoQueue),
            0x2B => Ok(ModbusFunction::EncapsulatedInterface),
            _ => Err(ModbusError::invalid_function(value)),
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Human-readable name
    pub fn name(self) -> &'static str {
        match self {
            ModbusFunction::ReadCoils => "Read Coils",
            ModbusFunction::ReadDiscreteInputs => "Read Discrete Inputs",
            ModbusFunction::ReadHoldingRegisters => "Read Holding Registers",
            ModbusFunction::ReadInputRegisters => "Read Input Registers",
            ModbusFunction::WriteSingleCoil => "Write Single Coil",
            ModbusFunction::WriteSingleRegister => "Write Single Register",
            ModbusFunction::ReadExceptionStatus => "Read Exception Status",
            ModbusFunction::Diagnostics => "Diagnostics",
            ModbusFunction::GetCommEventCounter => "Get Comm Event Counter",
            ModbusFunction::GetCommEventLog => "Get Comm Event Log",
            ModbusFunction::WriteMultipleCoils => "Write Multiple Coils",
            ModbusFunction::WriteMultipleRegisters => "Write Multiple Registers",
            ModbusFunction::ReportServerId => "Report Server ID",
            ModbusFunction::ReadFileRecord => "Read File Record",
            ModbusFunction::WriteFileRecord => "Write File Record",
            ModbusFunction::MaskWriteRegister => "Mask Write Register",
            ModbusFunction::ReadWriteMultipleRegisters => "Read/Write Multiple Registers",
            ModbusFunction::ReadFifoQueue => "Read FIFO Queue",
            ModbusFunction::EncapsulatedInterface => "Encapsulated Interface Transport",
        }
    }

    /// Length rule for the data of a request carrying this function
    ///
    /// Diagnostics (0x08) has no request rule: its sub-functions carry
    /// different amounts of data and are not framed by the RTU reader.
    pub fn request_layout(self) -> ModbusResult<DataLayout> {
        use ModbusFunction::*;
        let layout = match self {
            ReadExceptionStatus | GetCommEventCounter | GetCommEventLog | ReportServerId => {
                DataLayout::Fixed(0)
            }
            ReadFifoQueue => DataLayout::Fixed(2),
            EncapsulatedInterface => DataLayout::Fixed(3),
            ReadCoils | ReadDiscreteInputs | ReadHoldingRegisters | ReadInputRegisters
            | WriteSingleCoil | WriteSingleRegister => DataLayout::Fixed(4),
            MaskWriteRegister => DataLayout::Fixed(6),
            ReadFileRecord | WriteFileRecord => DataLayout::Counted { prefix: 0 },
            WriteMultipleCoils | WriteMultipleRegisters => DataLayout::Counted { prefix: 4 },
            ReadWriteMultipleRegisters => DataLayout::Counted { prefix: 8 },
            Diagnostics => return Err(ModbusError::invalid_function(self.to_u8())),
        };
        Ok(layout)
    }

    /// Length rule for the data of a normal (non-exception) response
    pub fn response_layout(self) -> DataLayout {
        use ModbusFunction::*;
        match self {
            ReadCoils | ReadDiscreteInputs | ReadHoldingRegisters | ReadInputRegisters
            | GetCommEventLog | ReportServerId | ReadFileRecord | WriteFileRecord
            | ReadWriteMultipleRegisters => DataLayout::Counted { prefix: 0 },
            WriteSingleCoil | WriteSingleRegister | GetCommEventCounter | WriteMultipleCoils
            | WriteMultipleRegisters | Diagnostics => DataLayout::Fixed(4),
            ReadExceptionStatus => DataLayout::Fixed(1),
            MaskWriteRegister => DataLayout::Fixed(6),
            ReadFifoQueue => DataLayout::WordCounted,
            EncapsulatedInterface => DataLayout::DeviceIdentification,
        }
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), *self as u8)
    }
}

/// Which side of a transaction a frame travels on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

/// How many data bytes follow unit id and function code (CRC excluded)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataLayout {
    /// Exactly `n` bytes
    Fixed(usize),
    /// `prefix` fixed bytes, one byte count, then that many bytes
    Counted { prefix: usize },
    /// Two-byte big-endian count, then that many bytes
    WordCounted,
    /// Read Device Identification (MEI type 0x0E) response
    DeviceIdentification,
}

/// Resolve the length rule for a raw function code
///
/// Exception responses (high bit set) always carry a single exception code.
/// An exception flag on a request, or an unknown code, is a framing error.
pub fn layout_for(function_code: u8, direction: Direction) -> ModbusResult<DataLayout> {
    if function_code & EXCEPTION_FLAG != 0 {
        return match direction {
            Direction::Response => Ok(DataLayout::Fixed(1)),
            Direction::Request => Err(ModbusError::invalid_function(function_code)),
        };
    }
    let function = ModbusFunction::from_u8(function_code)?;
    match direction {
        Direction::Request => function.request_layout(),
        Direction::Response => Ok(function.response_layout()),
    }
}

/// MEI type carried by Read Device Identification
pub const MEI_READ_DEVICE_ID: u8 = 0x0E;

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModbusException {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetDeviceFailedToRespond = 0x0B,
}

impl ModbusException {
    /// Convert from u8 to ModbusException
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ModbusException::IllegalFunction),
            0x02 => Some(ModbusException::IllegalDataAddress),
            0x03 => Some(ModbusException::IllegalDataValue),
            0x04 => Some(ModbusException::ServerDeviceFailure),
            0x05 => Some(ModbusException::Acknowledge),
            0x06 => Some(ModbusException::ServerDeviceBusy),
            0x08 => Some(ModbusException::MemoryParityError),
            0x0A => Some(ModbusException::GatewayPathUnavailable),
            0x0B => Some(ModbusException::GatewayTargetDeviceFailedToRespond),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ModbusException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let error = ModbusError::exception(0, self.to_u8());
        match error {
            ModbusError::Exception { message, .. } => {
                write!(f, "Modbus Exception 0x{:02X}: {}", self.to_u8(), message)
            }
            _ => write!(f, "Modbus Exception 0x{:02X}", self.to_u8()),
        }
    }
}

/// One Modbus application data unit, independent of framing
///
/// `payload` holds everything after the function code. `checksum` is the
/// LRC/CRC read off the wire by the serial codecs; `transaction_id` is set
/// by the MBAP codec only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub unit_id: UnitId,
    pub function_code: u8,
    pub payload: Vec<u8>,
    pub checksum: Option<u16>,
    pub transaction_id: Option<u16>,
}

impl Frame {
    pub fn new(unit_id: UnitId, function_code: u8, payload: Vec<u8>) -> Self {
        Self {
            unit_id,
            function_code,
            payload,
            checksum: None,
            transaction_id: None,
        }
    }

    /// Build a request for a known function
    pub fn request(unit_id: UnitId, function: ModbusFunction, payload: Vec<u8>) -> Self {
        Self::new(unit_id, function.to_u8(), payload)
    }

    /// Response to this request, keeping unit id and transaction id
    pub fn reply(&self, payload: Vec<u8>) -> Self {
        Self {
            unit_id: self.unit_id,
            function_code: self.function_code,
            payload,
            checksum: None,
            transaction_id: self.transaction_id,
        }
    }

    /// Exception response to this request
    pub fn exception_reply(&self, exception: ModbusException) -> Self {
        Self {
            unit_id: self.unit_id,
            function_code: self.function_code | EXCEPTION_FLAG,
            payload: vec![exception.to_u8()],
            checksum: None,
            transaction_id: self.transaction_id,
        }
    }

    pub fn is_exception(&self) -> bool {
        self.function_code & EXCEPTION_FLAG != 0
    }

    /// Exception code of an exception response
    pub fn exception_code(&self) -> Option<u8> {
        if self.is_exception() {
            self.payload.first().copied()
        } else {
            None
        }
    }

    /// Known function code, ignoring the exception flag
    pub fn function(&self) -> ModbusResult<ModbusFunction> {
        ModbusFunction::from_u8(self.function_code & !EXCEPTION_FLAG)
    }

    /// Turn an exception response into the matching error
    pub fn into_result(self) -> ModbusResult<Frame> {
        match self.exception_code() {
            Some(code) => Err(ModbusError::exception(self.function_code & !EXCEPTION_FLAG, code)),
            None => Ok(self),
        }
    }

    /// unit id ‖ function code ‖ payload, the span both checksums cover
    pub fn pdu_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(2 + self.payload.len());
        bytes.push(self.unit_id);
        bytes.push(self.function_code);
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Read a big-endian word from the payload
    pub fn word(&self, offset: usize) -> ModbusResult<u16> {
        match self.payload.get(offset..offset + 2) {
            Some(bytes) => Ok(u16::from_be_bytes([bytes[0], bytes[1]])),
            None => Err(ModbusError::frame(format!(
                "Payload too short: need word at offset {}, have {} bytes",
                offset,
                self.payload.len()
            ))),
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unit:{} fc:0x{:02X} [{}]",
            self.unit_id,
            self.function_code,
            crate::utils::format::bytes_to_hex(&self.payload)
        )
    }
}

/// Data conversion utilities
pub mod data_utils {
    use super::*;

    /// Convert register values to bytes (big-endian)
    pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(registers.len() * 2);
        for &register in registers {
            bytes.extend_from_slice(&register.to_be_bytes());
        }
        bytes
    }

    /// Convert bytes to register values (big-endian)
    pub fn bytes_to_registers(bytes: &[u8]) -> ModbusResult<Vec<u16>> {
        if bytes.len() % 2 != 0 {
            return Err(ModbusError::invalid_data("Byte array length must be even"));
        }
        Ok(bytes
            .chunks(2)
            .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
            .collect())
    }

    /// Pack boolean values into bytes, LSB first
    pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
        let mut bytes = vec![0u8; (bits.len() + 7) / 8];
        for (i, &bit) in bits.iter().enumerate() {
            if bit {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }
        bytes
    }

    /// Unpack bytes into boolean values
    pub fn unpack_bits(bytes: &[u8], bit_count: usize) -> Vec<bool> {
        (0..bit_count)
            .map(|i| bytes.get(i / 8).map_or(false, |b| b & (1 << (i % 8)) != 0))
            .collect()
    }
}
