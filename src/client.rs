/// High-level Modbus master client
///
/// [`ModbusMaster`] builds request PDUs for the common function codes and
/// decodes their responses. The bytes travel over any [`MasterLink`]: a
/// [`TcpMasterConnection`] (native or RTU-over-TCP framing) or a bare
/// [`Transport`] over a serial port.
///
/// ```rust,no_run
/// use voltage_modbus_stack::client::ModbusMaster;
/// use voltage_modbus_stack::master::TcpMasterConnection;
///
/// # async fn example() -> voltage_modbus_stack::ModbusResult<()> {
/// let mut connection = TcpMasterConnection::new("127.0.0.1".parse().unwrap(), 502);
/// connection.connect().await?;
/// let mut master = ModbusMaster::new(connection).with_retries(2);
/// let registers = master.read_03(1, 0, 10).await?;
/// println!("{:?}", registers);
/// # Ok(())
/// # }
/// ```
use std::time::Instant;

use async_trait::async_trait;
use log::warn;

use crate::error::{ModbusError, ModbusResult};
use crate::logging::CallbackLogger;
use crate::master::TcpMasterConnection;
use crate::protocol::{data_utils, Frame, ModbusFunction, UnitId};
use crate::transport::Transport;
use crate::utils::logging::log_exchange;
use crate::utils::validation;

/// Something a master can send a request over and get one response back
#[async_trait]
pub trait MasterLink: Send {
    async fn exchange(&mut self, request: &Frame) -> ModbusResult<Frame>;
}

#[async_trait]
impl MasterLink for Transport {
    async fn exchange(&mut self, request: &Frame) -> ModbusResult<Frame> {
        Transport::exchange(self, request).await
    }
}

/// Reconnects first when the connection was lost
#[async_trait]
impl MasterLink for TcpMasterConnection {
    async fn exchange(&mut self, request: &Frame) -> ModbusResult<Frame> {
        if !self.is_connected() {
            self.connect().await?;
        }
        self.execute(request).await
    }
}

/// Modbus master issuing typed requests over a [`MasterLink`]
pub struct ModbusMaster<L: MasterLink> {
    link: L,
    retries: u32,
    logger: Option<CallbackLogger>,
}

impl<L: MasterLink> ModbusMaster<L> {
    pub fn new(link: L) -> Self {
        Self {
            link,
            retries: 0,
            logger: None,
        }
    }

    pub fn with_logger(mut self, logger: CallbackLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Extra attempts after a recoverable failure (timeout, checksum, busy)
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn into_link(self) -> L {
        self.link
    }

    /// Send a raw request and return the checked response
    ///
    /// Exception responses come back as [`ModbusError::Exception`].
    pub async fn execute(&mut self, request: Frame) -> ModbusResult<Frame> {
        let mut attempt = 0;
        loop {
            if let Some(ref logger) = self.logger {
                logger.log_request(&request, None);
            }
            let started = Instant::now();
            let result = self
                .link
                .exchange(&request)
                .await
                .and_then(|response| check_response(&request, response));
            let function = ModbusFunction::from_u8(request.function_code)
                .map(|f| f.name())
                .unwrap_or("Unknown Function");

            match result {
                Ok(response) => {
                    log_exchange(request.unit_id, function, &response.payload, started.elapsed(), true);
                    if let Some(ref logger) = self.logger {
                        logger.log_response(&response, None);
                    }
                    return Ok(response);
                }
                Err(e) => {
                    log_exchange(request.unit_id, function, &request.payload, started.elapsed(), false);
                    if e.is_recoverable() && attempt < self.retries {
                        attempt += 1;
                        warn!("Retrying {} to unit {} ({}/{}): {}", function, request.unit_id, attempt, self.retries, e);
                        continue;
                    }
                    if let Some(ref logger) = self.logger {
                        logger.error(&format!("{} to unit {} failed: {}", function, request.unit_id, e));
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn call(&mut self, unit_id: UnitId, function: ModbusFunction, payload: Vec<u8>) -> ModbusResult<Frame> {
        self.execute(Frame::request(unit_id, function, payload)).await
    }

    /// Read coils (function code 0x01)
    pub async fn read_01(&mut self, unit_id: UnitId, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        validation::validate_coil_count(quantity)?;
        validation::validate_address_range(address, quantity)?;
        let response = self
            .call(unit_id, ModbusFunction::ReadCoils, address_quantity(address, quantity))
            .await?;
        Ok(data_utils::unpack_bits(counted(&response)?, quantity as usize))
    }

    /// Read discrete inputs (function code 0x02)
    pub async fn read_02(&mut self, unit_id: UnitId, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        validation::validate_coil_count(quantity)?;
        validation::validate_address_range(address, quantity)?;
        let response = self
            .call(unit_id, ModbusFunction::ReadDiscreteInputs, address_quantity(address, quantity))
            .await?;
        Ok(data_utils::unpack_bits(counted(&response)?, quantity as usize))
    }

    /// Read holding registers (function code 0x03)
    pub async fn read_03(&mut self, unit_id: UnitId, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        validation::validate_register_count(quantity)?;
        validation::validate_address_range(address, quantity)?;
        let response = self
            .call(unit_id, ModbusFunction::ReadHoldingRegisters, address_quantity(address, quantity))
            .await?;
        data_utils::bytes_to_registers(counted(&response)?)
    }

    /// Read input registers (function code 0x04)
    pub async fn read_04(&mut self, unit_id: UnitId, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        validation::validate_register_count(quantity)?;
        validation::validate_address_range(address, quantity)?;
        let response = self
            .call(unit_id, ModbusFunction::ReadInputRegisters, address_quantity(address, quantity))
            .await?;
        data_utils::bytes_to_registers(counted(&response)?)
    }

    /// Write single coil (function code 0x05)
    pub async fn write_05(&mut self, unit_id: UnitId, address: u16, value: bool) -> ModbusResult<()> {
        let value = if value { 0xFF00 } else { 0x0000 };
        self.call(unit_id, ModbusFunction::WriteSingleCoil, address_quantity(address, value))
            .await?;
        Ok(())
    }

    /// Write single register (function code 0x06)
    pub async fn write_06(&mut self, unit_id: UnitId, address: u16, value: u16) -> ModbusResult<()> {
        self.call(unit_id, ModbusFunction::WriteSingleRegister, address_quantity(address, value))
            .await?;
        Ok(())
    }

    /// Write multiple coils (function code 0x0F)
    pub async fn write_0f(&mut self, unit_id: UnitId, address: u16, values: &[bool]) -> ModbusResult<()> {
        if values.is_empty() || values.len() > crate::MAX_WRITE_COILS_PER_REQUEST as usize {
            return Err(ModbusError::invalid_data(format!(
                "Invalid coil count: {} (must be 1-{})",
                values.len(),
                crate::MAX_WRITE_COILS_PER_REQUEST
            )));
        }
        validation::validate_address_range(address, values.len() as u16)?;

        let packed = data_utils::pack_bits(values);
        let mut payload = address_quantity(address, values.len() as u16);
        payload.push(packed.len() as u8);
        payload.extend_from_slice(&packed);
        self.call(unit_id, ModbusFunction::WriteMultipleCoils, payload).await?;
        Ok(())
    }

    /// Write multiple registers (function code 0x10)
    pub async fn write_10(&mut self, unit_id: UnitId, address: u16, values: &[u16]) -> ModbusResult<()> {
        validation::validate_write_register_count(values.len() as u16)?;
        validation::validate_address_range(address, values.len() as u16)?;

        let mut payload = address_quantity(address, values.len() as u16);
        payload.push((values.len() * 2) as u8);
        payload.extend_from_slice(&data_utils::registers_to_bytes(values));
        self.call(unit_id, ModbusFunction::WriteMultipleRegisters, payload).await?;
        Ok(())
    }

    /// Mask write register (function code 0x16)
    pub async fn mask_write_16(&mut self, unit_id: UnitId, address: u16, and_mask: u16, or_mask: u16) -> ModbusResult<()> {
        let mut payload = address_quantity(address, and_mask);
        payload.extend_from_slice(&or_mask.to_be_bytes());
        self.call(unit_id, ModbusFunction::MaskWriteRegister, payload).await?;
        Ok(())
    }

    /// Read/write multiple registers (function code 0x17); the write happens first
    pub async fn read_write_17(
        &mut self,
        unit_id: UnitId,
        read_address: u16,
        read_quantity: u16,
        write_address: u16,
        values: &[u16],
    ) -> ModbusResult<Vec<u16>> {
        validation::validate_register_count(read_quantity)?;
        validation::validate_address_range(read_address, read_quantity)?;
        validation::validate_write_register_count(values.len() as u16)?;
        validation::validate_address_range(write_address, values.len() as u16)?;

        let mut payload = address_quantity(read_address, read_quantity);
        payload.extend_from_slice(&address_quantity(write_address, values.len() as u16));
        payload.push((values.len() * 2) as u8);
        payload.extend_from_slice(&data_utils::registers_to_bytes(values));
        let response = self
            .call(unit_id, ModbusFunction::ReadWriteMultipleRegisters, payload)
            .await?;
        data_utils::bytes_to_registers(counted(&response)?)
    }
}

fn address_quantity(address: u16, quantity: u16) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4);
    payload.extend_from_slice(&address.to_be_bytes());
    payload.extend_from_slice(&quantity.to_be_bytes());
    payload
}

/// Data bytes of a byte-count prefixed response
fn counted(response: &Frame) -> ModbusResult<&[u8]> {
    let count = *response
        .payload
        .first()
        .ok_or_else(|| ModbusError::frame("Empty response payload"))? as usize;
    response
        .payload
        .get(1..1 + count)
        .ok_or_else(|| ModbusError::frame(format!("Byte count {} exceeds response data", count)))
}

/// Response must come from the addressed unit and echo the function code
fn check_response(request: &Frame, response: Frame) -> ModbusResult<Frame> {
    if response.unit_id != request.unit_id {
        return Err(ModbusError::protocol(format!(
            "Response from unit {} to a request for unit {}",
            response.unit_id, request.unit_id
        )));
    }
    if response.function_code & 0x7F != request.function_code {
        return Err(ModbusError::protocol(format!(
            "Function code mismatch: sent 0x{:02X}, received 0x{:02X}",
            request.function_code, response.function_code
        )));
    }
    response.into_result()
}
