//! Stack configuration
//!
//! Slave listeners and master connections can be described in YAML or JSON
//! and loaded into a [`StackConfig`]:
//!
//! ```yaml
//! tcp_slaves:
//!   - port: 5020
//!     max_idle_secs: 30
//! serial_slaves:
//!   - port_name: /dev/ttyUSB0
//!     baud_rate: 19200
//!     parity: even
//!     encoding: rtu
//! master:
//!   address: 192.168.1.10
//!   retries: 2
//! ```

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ModbusError, ModbusResult};
use crate::serial::SerialParameters;
use crate::DEFAULT_TCP_PORT;

fn any_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

/// Modbus TCP slave listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpSlaveConfig {
    pub bind_address: IpAddr,
    pub port: u16,
    /// Concurrent connections served; 0 means unbounded
    pub pool_size: usize,
    /// Frame requests as RTU inside the TCP stream instead of MBAP
    pub rtu_over_tcp: bool,
    /// Close connections idle for this long; 0 disables the watchdog
    pub max_idle_secs: u64,
    pub timeout_ms: u64,
    pub packet_logging: bool,
}

impl Default for TcpSlaveConfig {
    fn default() -> Self {
        Self {
            bind_address: any_address(),
            port: DEFAULT_TCP_PORT,
            pool_size: 5,
            rtu_over_tcp: false,
            max_idle_secs: 0,
            timeout_ms: crate::DEFAULT_TIMEOUT_MS,
            packet_logging: false,
        }
    }
}

impl TcpSlaveConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    pub fn max_idle(&self) -> Option<Duration> {
        (self.max_idle_secs > 0).then(|| Duration::from_secs(self.max_idle_secs))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> ModbusResult<()> {
        if self.timeout_ms == 0 {
            return Err(ModbusError::configuration(format!(
                "TCP slave on port {}: timeout_ms must be greater than 0",
                self.port
            )));
        }
        Ok(())
    }
}

/// Modbus UDP slave listener (MBAP over datagrams)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpSlaveConfig {
    pub bind_address: IpAddr,
    pub port: u16,
    pub packet_logging: bool,
}

impl Default for UdpSlaveConfig {
    fn default() -> Self {
        Self {
            bind_address: any_address(),
            port: DEFAULT_TCP_PORT,
            packet_logging: false,
        }
    }
}

impl UdpSlaveConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }
}

/// Outbound Modbus TCP connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    pub address: IpAddr,
    pub port: u16,
    /// Local interface to bind before connecting
    pub local_address: Option<IpAddr>,
    pub timeout_ms: u64,
    pub rtu_over_tcp: bool,
    /// Send a one-byte out-of-band probe when checking liveness
    pub use_urgent_data: bool,
    pub retries: u32,
    pub packet_logging: bool,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_TCP_PORT,
            local_address: None,
            timeout_ms: crate::DEFAULT_TIMEOUT_MS,
            rtu_over_tcp: false,
            use_urgent_data: false,
            retries: 0,
            packet_logging: false,
        }
    }
}

impl MasterConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> ModbusResult<()> {
        if self.port == 0 {
            return Err(ModbusError::configuration("Master port must not be 0"));
        }
        if self.timeout_ms == 0 {
            return Err(ModbusError::configuration("Master timeout_ms must be greater than 0"));
        }
        if let Some(local) = self.local_address {
            if local.is_ipv4() != self.address.is_ipv4() {
                return Err(ModbusError::configuration(format!(
                    "Local address {} and remote address {} use different IP versions",
                    local, self.address
                )));
            }
        }
        Ok(())
    }
}

/// Everything one process runs: slave listeners plus an optional master
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    pub tcp_slaves: Vec<TcpSlaveConfig>,
    pub udp_slaves: Vec<UdpSlaveConfig>,
    pub serial_slaves: Vec<SerialParameters>,
    pub master: Option<MasterConfig>,
}

impl StackConfig {
    pub fn from_yaml_str(text: &str) -> ModbusResult<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> ModbusResult<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.json` file, or YAML for any other extension
    pub fn from_file(path: impl AsRef<Path>) -> ModbusResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ModbusError::configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&text),
            _ => Self::from_yaml_str(&text),
        }
    }

    pub fn validate(&self) -> ModbusResult<()> {
        for slave in &self.tcp_slaves {
            slave.validate()?;
        }
        for params in &self.serial_slaves {
            params.validate()?;
        }
        if let Some(master) = &self.master {
            master.validate()?;
        }

        let mut tcp_ports: Vec<u16> = self.tcp_slaves.iter().map(|s| s.port).collect();
        tcp_ports.sort_unstable();
        if let Some(pair) = tcp_ports.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(ModbusError::configuration(format!(
                "TCP port {} configured twice",
                pair[0]
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::{Parity, SerialEncoding};

    #[test]
    fn test_defaults() {
        let tcp = TcpSlaveConfig::default();
        assert_eq!(tcp.port, 502);
        assert_eq!(tcp.pool_size, 5);
        assert_eq!(tcp.max_idle(), None);
        assert_eq!(TcpSlaveConfig { max_idle_secs: 1, ..tcp }.max_idle(), Some(Duration::from_secs(1)));

        let master = MasterConfig::default();
        assert_eq!(master.timeout(), Duration::from_millis(1000));
        assert!(master.validate().is_ok());
    }

    #[test]
    fn test_yaml_config() {
        let yaml = r#"
tcp_slaves:
  - port: 5020
    max_idle_secs: 30
    rtu_over_tcp: true
udp_slaves:
  - port: 5021
serial_slaves:
  - port_name: /dev/ttyUSB0
    baud_rate: 19200
    parity: even
    encoding: ascii
master:
  address: 192.168.1.10
  retries: 2
"#;
        let config = StackConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.tcp_slaves[0].port, 5020);
        assert!(config.tcp_slaves[0].rtu_over_tcp);
        assert_eq!(config.tcp_slaves[0].pool_size, 5);
        assert_eq!(config.udp_slaves[0].port, 5021);
        assert_eq!(config.serial_slaves[0].parity, Parity::Even);
        assert_eq!(config.serial_slaves[0].encoding, SerialEncoding::Ascii);
        let master = config.master.unwrap();
        assert_eq!(master.address, "192.168.1.10".parse::<IpAddr>().unwrap());
        assert_eq!(master.retries, 2);
    }

    #[test]
    fn test_json_config() {
        let json = r#"{"tcp_slaves": [{"port": 1502, "pool_size": 0}]}"#;
        let config = StackConfig::from_json_str(json).unwrap();
        assert_eq!(config.tcp_slaves[0].pool_size, 0);
        assert!(config.master.is_none());
    }

    #[test]
    fn test_validation_errors() {
        let duplicate = "tcp_slaves:\n  - port: 502\n  - port: 502\n";
        assert!(matches!(
            StackConfig::from_yaml_str(duplicate),
            Err(ModbusError::Configuration { .. })
        ));

        let mixed = MasterConfig {
            local_address: Some("::1".parse().unwrap()),
            ..MasterConfig::default()
        };
        assert!(mixed.validate().is_err());

        assert!(StackConfig::from_json_str("{not json").is_err());
    }
}
