//! Integration Tests for Voltage Modbus Stack
//!
//! Masters and slaves talking over real loopback sockets and simulated
//! serial lines.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use voltage_modbus_stack::serial::SerialEncoding;
use voltage_modbus_stack::*;

fn localhost() -> IpAddr {
    "127.0.0.1".parse().unwrap()
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn slave_config(port: u16) -> TcpSlaveConfig {
    TcpSlaveConfig {
        bind_address: localhost(),
        timeout_ms: 500,
        ..TcpSlaveConfig::new(port)
    }
}

async fn master_for(port: u16, rtu_over_tcp: bool) -> ModbusMaster<TcpMasterConnection> {
    let mut connection = TcpMasterConnection::new(localhost(), port);
    connection.set_timeout(Duration::from_millis(500));
    connection.connect_with(rtu_over_tcp).await.unwrap();
    ModbusMaster::new(connection)
}

/// Full read/write cycle between a TCP master and a registry slave
#[tokio::test]
async fn test_tcp_master_slave_round_trip() {
    utils::logging::init_test_logger();
    let registry = SlaveRegistry::new();
    let port = free_port().await;
    let slave = registry.create_tcp_slave(slave_config(port)).await.unwrap();
    let bank = Arc::new(RegisterBank::new());
    bank.set_input_register(3, 0x0BAD).unwrap();
    slave.add_process_image(1, bank.clone());

    let mut master = master_for(port, false).await;
    master.write_10(1, 100, &[10, 20, 30]).await.unwrap();
    master.write_0f(1, 0, &[true, true, false, true]).await.unwrap();

    assert_eq!(master.read_03(1, 100, 3).await.unwrap(), vec![10, 20, 30]);
    assert_eq!(master.read_01(1, 0, 4).await.unwrap(), vec![true, true, false, true]);
    assert_eq!(master.read_04(1, 3, 1).await.unwrap(), vec![0x0BAD]);
    assert_eq!(bank.read_holding_registers(101, 1).unwrap(), vec![20]);

    let stats = master.link().transport().unwrap().stats();
    assert_eq!(stats.requests_sent, 5);
    assert_eq!(stats.responses_received, 5);

    master.link_mut().close().await;
    registry.close_all().await;
}

/// Units without a process image get a gateway exception over TCP
#[tokio::test]
async fn test_unknown_unit_gets_gateway_exception() {
    let registry = SlaveRegistry::new();
    let port = free_port().await;
    let slave = registry.create_tcp_slave(slave_config(port)).await.unwrap();
    slave.add_process_image(1, Arc::new(RegisterBank::new()));

    let mut master = master_for(port, false).await;
    match master.read_03(9, 0, 1).await {
        Err(ModbusError::Exception { code, .. }) => assert_eq!(code, 0x0B),
        other => panic!("expected exception, got {:?}", other),
    }
    // the connection survives an exception response
    assert_eq!(master.read_03(1, 0, 1).await.unwrap(), vec![0]);
    registry.close_all().await;
}

#[tokio::test]
async fn test_rtu_over_tcp_round_trip() {
    let registry = SlaveRegistry::new();
    let port = free_port().await;
    let slave = registry
        .create_tcp_slave(TcpSlaveConfig {
            rtu_over_tcp: true,
            ..slave_config(port)
        })
        .await
        .unwrap();
    slave.add_process_image(5, Arc::new(RegisterBank::new()));

    let mut master = master_for(port, true).await;
    master.write_06(5, 7, 0x4242).await.unwrap();
    master.mask_write_16(5, 7, 0xFF00, 0x0001).await.unwrap();
    assert_eq!(master.read_03(5, 7, 1).await.unwrap(), vec![0x4201]);
    registry.close_all().await;
}

/// An idle connection is closed by the slave without any request
#[tokio::test]
async fn test_watchdog_closes_idle_connection() {
    let registry = SlaveRegistry::new();
    let port = free_port().await;
    let slave = registry
        .create_tcp_slave(TcpSlaveConfig {
            max_idle_secs: 1,
            ..slave_config(port)
        })
        .await
        .unwrap();
    slave.add_process_image(1, Arc::new(RegisterBank::new()));

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let started = Instant::now();
    let mut buf = [0u8; 1];
    let read = timeout(Duration::from_secs(4), stream.read(&mut buf))
        .await
        .expect("connection should be closed by the watchdog");
    assert!(matches!(read, Ok(0)) || read.is_err());
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(900), "closed after {:?}", elapsed);
    assert!(elapsed <= Duration::from_secs(3), "closed after {:?}", elapsed);

    registry.close_all().await;
}

/// Same endpoint returns the same slave; close then create binds again
#[tokio::test]
async fn test_registry_rebind_after_close() {
    let registry = SlaveRegistry::new();
    let port = free_port().await;

    let first = registry.create_tcp_slave(slave_config(port)).await.unwrap();
    let again = registry.create_tcp_slave(slave_config(port)).await.unwrap();
    assert!(Arc::ptr_eq(&first, &again));

    registry.close(&first).await;
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());

    let second = registry.create_tcp_slave(slave_config(port)).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    second.add_process_image(1, Arc::new(RegisterBank::new()));
    let mut master = master_for(port, false).await;
    assert_eq!(master.read_03(1, 0, 2).await.unwrap(), vec![0, 0]);

    registry.close_all().await;
    assert!(registry.is_empty().await);
}

/// A master reconnects on its next request after the slave went away
#[tokio::test]
async fn test_master_reconnects_after_slave_restart() {
    let registry = SlaveRegistry::new();
    let port = free_port().await;
    let bank = Arc::new(RegisterBank::new());
    bank.write_registers(0, &[99]).unwrap();

    let slave = registry.create_tcp_slave(slave_config(port)).await.unwrap();
    slave.add_process_image(1, bank.clone());
    let mut master = master_for(port, false).await;
    assert_eq!(master.read_03(1, 0, 1).await.unwrap(), vec![99]);

    registry.close(&slave).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!master.link_mut().is_connected());

    let slave = registry.create_tcp_slave(slave_config(port)).await.unwrap();
    slave.add_process_image(1, bank);
    assert_eq!(master.read_03(1, 0, 1).await.unwrap(), vec![99]);
    assert!(master.link_mut().is_connected());

    registry.close_all().await;
}

/// ASCII master and serial slave over a simulated serial line
#[tokio::test]
async fn test_ascii_serial_slave() {
    let registry = SlaveRegistry::new();
    let (port, line) = MemorySerialPort::pair("sim-ascii", 512);
    let mut params = SerialParameters::new("sim-ascii", 19_200);
    params.encoding = SerialEncoding::Ascii;

    let slave = registry
        .create_serial_slave_with_port(params, Box::new(port))
        .await
        .unwrap();
    slave.add_process_image(2, Arc::new(RegisterBank::new()));

    let transport = Transport::new(line, FrameCodec::Ascii).with_timeout(Duration::from_millis(500));
    let mut master = ModbusMaster::new(transport);
    master.write_10(2, 0, &[0x0102, 0x0304]).await.unwrap();
    assert_eq!(master.read_03(2, 0, 2).await.unwrap(), vec![0x0102, 0x0304]);

    // frames for other units are skipped; the master sees a timeout
    let err = master.read_03(3, 0, 1).await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(master.read_03(2, 1, 1).await.unwrap(), vec![0x0304]);

    registry.close_all().await;
}

/// RTU master and serial slave over a simulated serial line
#[tokio::test]
async fn test_rtu_serial_slave() {
    let registry = SlaveRegistry::new();
    let (port, line) = MemorySerialPort::pair("sim-rtu", 512);
    let params = SerialParameters::new("sim-rtu", 38_400);
    let codec = params.codec();

    let slave = registry
        .create_serial_slave_with_port(params, Box::new(port))
        .await
        .unwrap();
    slave.add_process_image(1, Arc::new(RegisterBank::new()));

    let transport = Transport::new(line, codec).with_timeout(Duration::from_millis(500));
    let mut master = ModbusMaster::new(transport).with_retries(1);
    master.write_05(1, 4, true).await.unwrap();
    assert_eq!(master.read_01(1, 0, 6).await.unwrap(), vec![false, false, false, false, true, false]);
    assert_eq!(
        master.read_write_17(1, 10, 2, 10, &[7, 8]).await.unwrap(),
        vec![7, 8]
    );

    registry.close_all().await;
}
