/// Modbus register bank for slave-side data storage
///
/// In-memory coils, discrete inputs, holding registers and input registers,
/// served as a [`ProcessImage`]. Addresses are 0-based; unwritten addresses
/// read as zero.
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use log::debug;

use crate::error::{ModbusError, ModbusResult};
use crate::image::ProcessImage;
use crate::protocol::{data_utils, Frame, ModbusException, ModbusFunction};
use crate::{MAX_COILS_PER_REQUEST, MAX_REGISTERS_PER_REQUEST, MAX_WRITE_COILS_PER_REQUEST, MAX_WRITE_REGISTERS_PER_REQUEST};

/// Register bank for storing coils, discrete inputs, holding registers, and input registers
///
/// Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct RegisterBank {
    /// Coils (read/write) - 1 bit each
    coils: Arc<RwLock<HashMap<u16, bool>>>,
    /// Discrete inputs (read-only) - 1 bit each
    discrete_inputs: Arc<RwLock<HashMap<u16, bool>>>,
    /// Holding registers (read/write) - 16 bits each
    holding_registers: Arc<RwLock<HashMap<u16, u16>>>,
    /// Input registers (read-only) - 16 bits each
    input_registers: Arc<RwLock<HashMap<u16, u16>>>,
}

fn read_bits(store: &RwLock<HashMap<u16, bool>>, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
    let bits = store
        .read()
        .map_err(|_| ModbusError::internal("Register bank lock poisoned"))?;
    Ok((0..quantity)
        .map(|i| bits.get(&address.wrapping_add(i)).copied().unwrap_or(false))
        .collect())
}

fn read_words(store: &RwLock<HashMap<u16, u16>>, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
    let words = store
        .read()
        .map_err(|_| ModbusError::internal("Register bank lock poisoned"))?;
    Ok((0..quantity)
        .map(|i| words.get(&address.wrapping_add(i)).copied().unwrap_or(0))
        .collect())
}

impl RegisterBank {
    /// Create a new register bank with empty data
    pub fn new() -> Self {
        Self::default()
    }

    /// Read coils starting at address (function code 0x01)
    pub fn read_coils(&self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        read_bits(&self.coils, address, quantity)
    }

    /// Read discrete inputs starting at address (function code 0x02)
    pub fn read_discrete_inputs(&self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        read_bits(&self.discrete_inputs, address, quantity)
    }

    /// Read holding registers starting at address (function code 0x03)
    pub fn read_holding_registers(&self, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        read_words(&self.holding_registers, address, quantity)
    }

    /// Read input registers starting at address (function code 0x04)
    pub fn read_input_registers(&self, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        read_words(&self.input_registers, address, quantity)
    }

    /// Write coils starting at address (function codes 0x05, 0x0F)
    pub fn write_coils(&self, address: u16, values: &[bool]) -> ModbusResult<()> {
        let mut coils = self
            .coils
            .write()
            .map_err(|_| ModbusError::internal("Failed to lock coils"))?;
        for (i, &value) in values.iter().enumerate() {
            coils.insert(address.wrapping_add(i as u16), value);
        }
        Ok(())
    }

    /// Write holding registers starting at address (function codes 0x06, 0x10)
    pub fn write_registers(&self, address: u16, values: &[u16]) -> ModbusResult<()> {
        let mut registers = self
            .holding_registers
            .write()
            .map_err(|_| ModbusError::internal("Failed to lock holding registers"))?;
        for (i, &value) in values.iter().enumerate() {
            registers.insert(address.wrapping_add(i as u16), value);
        }
        Ok(())
    }

    /// Set input register value (for simulation/testing)
    pub fn set_input_register(&self, address: u16, value: u16) -> ModbusResult<()> {
        let mut registers = self
            .input_registers
            .write()
            .map_err(|_| ModbusError::internal("Failed to lock input registers"))?;
        registers.insert(address, value);
        Ok(())
    }

    /// Set discrete input value (for simulation/testing)
    pub fn set_discrete_input(&self, address: u16, value: bool) -> ModbusResult<()> {
        let mut inputs = self
            .discrete_inputs
            .write()
            .map_err(|_| ModbusError::internal("Failed to lock discrete inputs"))?;
        inputs.insert(address, value);
        Ok(())
    }

    /// Apply one request and build the response payload
    fn apply(&self, request: &Frame) -> Result<Vec<u8>, ModbusException> {
        let function = request
            .function()
            .map_err(|_| ModbusException::IllegalFunction)?;
        let data = &request.payload;
        let word = |offset: usize| request.word(offset).map_err(|_| ModbusException::IllegalDataValue);

        match function {
            ModbusFunction::ReadCoils | ModbusFunction::ReadDiscreteInputs => {
                let (address, quantity) = (word(0)?, word(2)?);
                check_quantity(address, quantity, MAX_COILS_PER_REQUEST)?;
                let bits = if function == ModbusFunction::ReadCoils {
                    self.read_coils(address, quantity)
                } else {
                    self.read_discrete_inputs(address, quantity)
                }
                .map_err(|_| ModbusException::ServerDeviceFailure)?;
                let packed = data_utils::pack_bits(&bits);
                let mut response = vec![packed.len() as u8];
                response.extend(packed);
                Ok(response)
            }
            ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters => {
                let (address, quantity) = (word(0)?, word(2)?);
                check_quantity(address, quantity, MAX_REGISTERS_PER_REQUEST)?;
                let registers = if function == ModbusFunction::ReadHoldingRegisters {
                    self.read_holding_registers(address, quantity)
                } else {
                    self.read_input_registers(address, quantity)
                }
                .map_err(|_| ModbusException::ServerDeviceFailure)?;
                let mut response = vec![(quantity * 2) as u8];
                response.extend(data_utils::registers_to_bytes(&registers));
                Ok(response)
            }
            ModbusFunction::WriteSingleCoil => {
                let (address, value) = (word(0)?, word(2)?);
                let coil = match value {
                    0x0000 => false,
                    0xFF00 => true,
                    _ => return Err(ModbusException::IllegalDataValue),
                };
                self.write_coils(address, &[coil])
                    .map_err(|_| ModbusException::ServerDeviceFailure)?;
                Ok(data[..4].to_vec())
            }
            ModbusFunction::WriteSingleRegister => {
                let (address, value) = (word(0)?, word(2)?);
                self.write_registers(address, &[value])
                    .map_err(|_| ModbusException::ServerDeviceFailure)?;
                Ok(data[..4].to_vec())
            }
            ModbusFunction::WriteMultipleCoils => {
                let (address, quantity) = (word(0)?, word(2)?);
                check_quantity(address, quantity, MAX_WRITE_COILS_PER_REQUEST)?;
                let values = counted_values(data, 4, (usize::from(quantity) + 7) / 8)?;
                let coils = data_utils::unpack_bits(values, usize::from(quantity));
                self.write_coils(address, &coils)
                    .map_err(|_| ModbusException::ServerDeviceFailure)?;
                Ok(data[..4].to_vec())
            }
            ModbusFunction::WriteMultipleRegisters => {
                let (address, quantity) = (word(0)?, word(2)?);
                check_quantity(address, quantity, MAX_WRITE_REGISTERS_PER_REQUEST)?;
                let values = counted_values(data, 4, usize::from(quantity) * 2)?;
                let registers = data_utils::bytes_to_registers(values)
                    .map_err(|_| ModbusException::IllegalDataValue)?;
                self.write_registers(address, &registers)
                    .map_err(|_| ModbusException::ServerDeviceFailure)?;
                Ok(data[..4].to_vec())
            }
            ModbusFunction::MaskWriteRegister => {
                let (address, and_mask, or_mask) = (word(0)?, word(2)?, word(4)?);
                let current = self
                    .read_holding_registers(address, 1)
                    .map_err(|_| ModbusException::ServerDeviceFailure)?[0];
                let value = (current & and_mask) | (or_mask & !and_mask);
                self.write_registers(address, &[value])
                    .map_err(|_| ModbusException::ServerDeviceFailure)?;
                Ok(data[..6].to_vec())
            }
            ModbusFunction::ReadWriteMultipleRegisters => {
                let (read_address, read_quantity) = (word(0)?, word(2)?);
                let (write_address, write_quantity) = (word(4)?, word(6)?);
                check_quantity(read_address, read_quantity, MAX_REGISTERS_PER_REQUEST)?;
                check_quantity(write_address, write_quantity, MAX_WRITE_REGISTERS_PER_REQUEST)?;
                let values = counted_values(data, 8, usize::from(write_quantity) * 2)?;
                let registers = data_utils::bytes_to_registers(values)
                    .map_err(|_| ModbusException::IllegalDataValue)?;
                // the write happens before the read
                self.write_registers(write_address, &registers)
                    .map_err(|_| ModbusException::ServerDeviceFailure)?;
                let read = self
                    .read_holding_registers(read_address, read_quantity)
                    .map_err(|_| ModbusException::ServerDeviceFailure)?;
                let mut response = vec![(read_quantity * 2) as u8];
                response.extend(data_utils::registers_to_bytes(&read));
                Ok(response)
            }
            _ => Err(ModbusException::IllegalFunction),
        }
    }
}

/// Quantity within `1..=max` and range inside the 16-bit address space
fn check_quantity(address: u16, quantity: u16, max: u16) -> Result<(), ModbusException> {
    if quantity == 0 || quantity > max {
        return Err(ModbusException::IllegalDataValue);
    }
    if u32::from(address) + u32::from(quantity) > 0x1_0000 {
        return Err(ModbusException::IllegalDataAddress);
    }
    Ok(())
}

/// Byte-count-prefixed values at `offset`, checked against the expected size
fn counted_values(data: &[u8], offset: usize, expected: usize) -> Result<&[u8], ModbusException> {
    let count = usize::from(*data.get(offset).ok_or(ModbusException::IllegalDataValue)?);
    if count != expected {
        return Err(ModbusException::IllegalDataValue);
    }
    data.get(offset + 1..offset + 1 + count)
        .ok_or(ModbusException::IllegalDataValue)
}

#[async_trait]
impl ProcessImage for RegisterBank {
    async fn process(&self, request: &Frame) -> Frame {
        match self.apply(request) {
            Ok(payload) => request.reply(payload),
            Err(exception) => {
                debug!(
                    "Unit {} fc 0x{:02X} rejected: {}",
                    request.unit_id, request.function_code, exception
                );
                request.exception_reply(exception)
            }
        }
    }
}
