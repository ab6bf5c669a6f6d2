/// Utility functions and helpers for Modbus operations
///
/// Request validation shared by the master client and the register bank,
/// hex formatting for diagnostics, and logger setup for tests and binaries.
use std::time::Duration;

use log::debug;

use crate::error::{ModbusError, ModbusResult};

/// Data validation utilities
pub mod validation {
    use super::*;

    /// Validate address range
    pub fn validate_address_range(start: u16, count: u16) -> ModbusResult<()> {
        if count == 0 {
            return Err(ModbusError::invalid_address(start, count));
        }

        if (start as u32 + count as u32) > 65536 {
            return Err(ModbusError::invalid_address(start, count));
        }

        Ok(())
    }

    /// Validate register count for read operations
    pub fn validate_register_count(count: u16) -> ModbusResult<()> {
        if count == 0 || count > crate::MAX_REGISTERS_PER_REQUEST {
            return Err(ModbusError::invalid_data(format!(
                "Invalid register count: {} (must be 1-{})",
                count,
                crate::MAX_REGISTERS_PER_REQUEST
            )));
        }
        Ok(())
    }

    /// Validate register count for write operations
    pub fn validate_write_register_count(count: u16) -> ModbusResult<()> {
        if count == 0 || count > crate::MAX_WRITE_REGISTERS_PER_REQUEST {
            return Err(ModbusError::invalid_data(format!(
                "Invalid register count: {} (must be 1-{})",
                count,
                crate::MAX_WRITE_REGISTERS_PER_REQUEST
            )));
        }
        Ok(())
    }

    /// Validate coil count for read operations
    pub fn validate_coil_count(count: u16) -> ModbusResult<()> {
        if count == 0 || count > crate::MAX_COILS_PER_REQUEST {
            return Err(ModbusError::invalid_data(format!(
                "Invalid coil count: {} (must be 1-{})",
                count,
                crate::MAX_COILS_PER_REQUEST
            )));
        }
        Ok(())
    }
}

/// Formatting and display utilities
pub mod format {
    use super::*;

    /// Format byte array as hex string
    pub fn bytes_to_hex(bytes: &[u8]) -> String {
        bytes
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Format register values as hex
    pub fn registers_to_hex(registers: &[u16]) -> String {
        registers
            .iter()
            .map(|r| format!("{:04X}", r))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Format duration in a human-readable way
    pub fn format_duration(duration: Duration) -> String {
        let millis = duration.as_millis();
        if millis < 1000 {
            format!("{}ms", millis)
        } else if millis < 60_000 {
            format!("{:.2}s", duration.as_secs_f64())
        } else {
            let mins = millis / 60_000;
            let secs = (millis % 60_000) as f64 / 1000.0;
            format!("{}m {:.1}s", mins, secs)
        }
    }
}

/// Logging utilities
pub mod logging {
    use super::*;

    /// Initialize simple logger for testing
    pub fn init_test_logger() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Debug)
            .is_test(true)
            .try_init();
    }

    /// Log one master transaction for debugging
    pub fn log_exchange(unit_id: u8, function: &str, data: &[u8], duration: Duration, success: bool) {
        let status = if success { "ok" } else { "failed" };
        debug!(
            "[{}] Slave {} {} | Data: {} | Duration: {}",
            status,
            unit_id,
            function,
            format::bytes_to_hex(data),
            format::format_duration(duration)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation() {
        assert!(validation::validate_address_range(0, 10).is_ok());
        assert!(validation::validate_address_range(65530, 5).is_ok());
        assert!(validation::validate_address_range(65530, 10).is_err());

        assert!(validation::validate_register_count(125).is_ok());
        assert!(validation::validate_register_count(126).is_err());
        assert!(validation::validate_write_register_count(123).is_ok());
        assert!(validation::validate_write_register_count(124).is_err());
        assert!(validation::validate_coil_count(2000).is_ok());
        assert!(validation::validate_coil_count(0).is_err());
    }

    #[test]
    fn test_formatting() {
        let bytes = vec![0x01, 0x03, 0x10, 0xFF];
        assert_eq!(format::bytes_to_hex(&bytes), "01 03 10 FF");

        let registers = vec![0x1234, 0x5678];
        assert_eq!(format::registers_to_hex(&registers), "1234 5678");

        let duration = Duration::from_millis(1500);
        assert_eq!(format::format_duration(duration), "1.50s");
        assert_eq!(format::format_duration(Duration::from_millis(20)), "20ms");
    }
}
