//! Slave registry
//!
//! Keeps at most one running [`ModbusSlave`] per (kind, endpoint). The
//! registry is an ordinary value: create one per process (or per test) and
//! pass it where slaves are created.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info};
use tokio::sync::Mutex;

use crate::config::{StackConfig, TcpSlaveConfig, UdpSlaveConfig};
use crate::error::ModbusResult;
use crate::serial::{SerialParameters, SerialPortIo};
use crate::slave::ModbusSlave;

pub use crate::slave::{Endpoint, SlaveKey, SlaveKind};

#[derive(Default)]
pub struct SlaveRegistry {
    slaves: Mutex<HashMap<SlaveKey, Arc<ModbusSlave>>>,
}

impl SlaveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Running TCP slave for `config.port`, created and opened on first use
    pub async fn create_tcp_slave(&self, config: TcpSlaveConfig) -> ModbusResult<Arc<ModbusSlave>> {
        config.validate()?;
        self.get_or_open(ModbusSlave::tcp(config)).await
    }

    pub async fn create_udp_slave(&self, config: UdpSlaveConfig) -> ModbusResult<Arc<ModbusSlave>> {
        self.get_or_open(ModbusSlave::udp(config)).await
    }

    /// Running serial slave on the system port named in `params`
    ///
    /// An existing slave on the same port is returned when its parameters
    /// match; otherwise it is closed and replaced.
    pub async fn create_serial_slave(&self, params: SerialParameters) -> ModbusResult<Arc<ModbusSlave>> {
        params.validate()?;
        self.replace_serial(ModbusSlave::serial(params)).await
    }

    /// Like [`create_serial_slave`](Self::create_serial_slave), over a caller-supplied port
    pub async fn create_serial_slave_with_port(
        &self,
        params: SerialParameters,
        port: Box<dyn SerialPortIo>,
    ) -> ModbusResult<Arc<ModbusSlave>> {
        params.validate()?;
        self.replace_serial(ModbusSlave::serial_with_port(params, port)).await
    }

    pub async fn get_slave(&self, key: &SlaveKey) -> Option<Arc<ModbusSlave>> {
        self.slaves.lock().await.get(key).cloned()
    }

    /// Stop `slave` and forget it; slaves already removed are only stopped
    pub async fn close(&self, slave: &Arc<ModbusSlave>) {
        let mut slaves = self.slaves.lock().await;
        let key = slave.key();
        if slaves.get(&key).map_or(false, |current| Arc::ptr_eq(current, slave)) {
            slaves.remove(&key);
        }
        slave.close().await;
        debug!("Removed slave {}", key);
    }

    pub async fn close_all(&self) {
        let mut slaves = self.slaves.lock().await;
        for (key, slave) in slaves.drain() {
            slave.close().await;
            debug!("Removed slave {}", key);
        }
    }

    pub async fn len(&self) -> usize {
        self.slaves.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slaves.lock().await.is_empty()
    }

    pub async fn keys(&self) -> Vec<SlaveKey> {
        self.slaves.lock().await.keys().cloned().collect()
    }

    /// Create every slave described by `config`
    pub async fn create_from_config(&self, config: &StackConfig) -> ModbusResult<Vec<Arc<ModbusSlave>>> {
        config.validate()?;
        let mut created = Vec::new();
        for tcp in &config.tcp_slaves {
            created.push(self.create_tcp_slave(tcp.clone()).await?);
        }
        for udp in &config.udp_slaves {
            created.push(self.create_udp_slave(udp.clone()).await?);
        }
        for params in &config.serial_slaves {
            created.push(self.create_serial_slave(params.clone()).await?);
        }
        info!("Registry running {} slave(s)", created.len());
        Ok(created)
    }

    async fn get_or_open(&self, candidate: ModbusSlave) -> ModbusResult<Arc<ModbusSlave>> {
        let key = candidate.key();
        let mut slaves = self.slaves.lock().await;
        if let Some(existing) = slaves.get(&key) {
            return Ok(existing.clone());
        }
        candidate.open().await?;
        let slave = Arc::new(candidate);
        slaves.insert(key, slave.clone());
        Ok(slave)
    }

    async fn replace_serial(&self, candidate: ModbusSlave) -> ModbusResult<Arc<ModbusSlave>> {
        let key = candidate.key();
        let mut slaves = self.slaves.lock().await;
        if let Some(existing) = slaves.get(&key) {
            if existing.serial_parameters() == candidate.serial_parameters() {
                return Ok(existing.clone());
            }
            info!("Serial parameters for {} changed, reopening", key);
            if let Some(stale) = slaves.remove(&key) {
                stale.close().await;
            }
        }
        candidate.open().await?;
        let slave = Arc::new(candidate);
        slaves.insert(key, slave.clone());
        Ok(slave)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::MemorySerialPort;

    fn loopback(port: u16) -> TcpSlaveConfig {
        TcpSlaveConfig {
            bind_address: "127.0.0.1".parse().unwrap(),
            ..TcpSlaveConfig::new(port)
        }
    }

    async fn free_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_tcp_create_is_idempotent() {
        let registry = SlaveRegistry::new();
        let port = free_port().await;

        let first = registry.create_tcp_slave(loopback(port)).await.unwrap();
        let second = registry.create_tcp_slave(loopback(port)).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len().await, 1);

        registry.close(&first).await;
        assert!(registry.is_empty().await);
        assert!(registry.get_slave(&SlaveKey::tcp(port)).await.is_none());

        let third = registry.create_tcp_slave(loopback(port)).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert!(third.is_running().await);

        // closing a slave that is no longer registered leaves the new one alone
        registry.close(&first).await;
        assert_eq!(registry.len().await, 1);
        registry.close_all().await;
        assert!(!third.is_running().await);
    }

    #[tokio::test]
    async fn test_serial_parameters_change_replaces_slave() {
        let registry = SlaveRegistry::new();
        let params = SerialParameters::new("sim-registry", 9600);

        let (port, _remote) = MemorySerialPort::pair("sim-registry", 64);
        let first_lines = port.line_state();
        let first = registry
            .create_serial_slave_with_port(params.clone(), Box::new(port))
            .await
            .unwrap();

        let (port, _remote2) = MemorySerialPort::pair("sim-registry", 64);
        let same = registry
            .create_serial_slave_with_port(params.clone(), Box::new(port))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &same));

        let mut faster = params.clone();
        faster.baud_rate = 19_200;
        let (port, _remote3) = MemorySerialPort::pair("sim-registry", 64);
        let replaced = registry
            .create_serial_slave_with_port(faster, Box::new(port))
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&first, &replaced));
        assert!(!first.is_running().await);
        assert!(!first_lines.lock().unwrap().open);
        assert_eq!(replaced.serial_parameters().unwrap().baud_rate, 19_200);
        assert_eq!(registry.len().await, 1);

        registry.close_all().await;
    }

    #[tokio::test]
    async fn test_close_releases_serial_port() {
        let registry = SlaveRegistry::new();
        let (port, _remote) = MemorySerialPort::pair("sim-release", 64);
        let lines = port.line_state();
        let slave = registry
            .create_serial_slave_with_port(SerialParameters::new("sim-release", 9600), Box::new(port))
            .await
            .unwrap();
        assert!(lines.lock().unwrap().open);

        registry.close(&slave).await;
        assert!(!slave.is_running().await);
        assert!(!lines.lock().unwrap().open);
    }

    #[tokio::test]
    async fn test_create_from_config() {
        let registry = SlaveRegistry::new();
        let port = free_port().await;
        let yaml = format!(
            "tcp_slaves:\n  - bind_address: 127.0.0.1\n    port: {}\nudp_slaves:\n  - bind_address: 127.0.0.1\n    port: {}\n",
            port, port
        );
        let config = StackConfig::from_yaml_str(&yaml).unwrap();
        let slaves = registry.create_from_config(&config).await.unwrap();
        assert_eq!(slaves.len(), 2);
        assert!(registry.get_slave(&SlaveKey::udp(port)).await.is_some());
        registry.close_all().await;
    }
}
