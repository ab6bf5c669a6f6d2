/// Voltage Modbus Stack Slave Demo
///
/// Starts every slave described in a YAML/JSON configuration file (or a
/// single TCP slave on 127.0.0.1:5020 when none is given) and serves unit 1
/// from a pre-filled register bank until Ctrl-C.
///
/// Usage: slave_demo [config.yaml]
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::info;
use tokio::signal;
use tokio::time::interval;

use voltage_modbus_stack::{RegisterBank, SlaveRegistry, StackConfig, TcpSlaveConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    println!("🚀 Voltage Modbus Stack Slave Demo");
    println!("==================================");

    let config = match std::env::args().nth(1) {
        Some(path) => StackConfig::from_file(&path).with_context(|| format!("loading {}", path))?,
        None => StackConfig {
            tcp_slaves: vec![TcpSlaveConfig {
                bind_address: "127.0.0.1".parse::<IpAddr>()?,
                max_idle_secs: 60,
                ..TcpSlaveConfig::new(5020)
            }],
            ..StackConfig::default()
        },
    };

    let bank = Arc::new(RegisterBank::new());
    info!("🔧 Initializing test data...");
    for i in 0..50u16 {
        bank.write_registers(i, &[0x1000 + i])?;
        bank.write_coils(i, &[i % 3 == 0])?;
        bank.set_input_register(i, 0x2000 + i)?;
        bank.set_discrete_input(i, i % 2 == 0)?;
    }

    let registry = SlaveRegistry::new();
    let slaves = registry
        .create_from_config(&config)
        .await
        .context("starting slaves")?;
    for slave in &slaves {
        slave.add_process_image(1, bank.clone());
        match slave.local_addr().await {
            Some(addr) => info!("✅ {} listening on {}", slave.key(), addr),
            None => info!("✅ {} listening", slave.key()),
        }
    }

    let monitor = bank.clone();
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(10));
        loop {
            ticker.tick().await;
            if let Ok(values) = monitor.read_holding_registers(0, 4) {
                info!("📊 Holding registers 0-3: {:?}", values);
            }
        }
    });

    println!("Press Ctrl+C to stop");
    signal::ctrl_c().await?;

    info!("⏹️  Stopping slaves...");
    registry.close_all().await;
    Ok(())
}
