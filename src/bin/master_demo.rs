/// Voltage Modbus Stack Master Demo
///
/// Connects to a Modbus TCP slave, reads and writes a few registers and
/// coils, and prints the transport statistics.
///
/// Usage: master_demo [address] [port] [--rtu-over-tcp]
use std::net::IpAddr;
use std::time::Duration;

use anyhow::Context;
use voltage_modbus_stack::utils::format::registers_to_hex;
use voltage_modbus_stack::{
    CallbackLogger, LoggingMode, MasterConfig, ModbusMaster, TcpMasterConnection,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    println!("🚀 Voltage Modbus Stack Master Demo");
    println!("===================================");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let positional: Vec<&String> = args.iter().filter(|a| !a.starts_with("--")).collect();
    let defaults = MasterConfig::default();
    let config = MasterConfig {
        address: positional
            .first()
            .map(|a| a.parse::<IpAddr>())
            .transpose()
            .context("invalid address")?
            .unwrap_or(defaults.address),
        port: positional
            .get(1)
            .map(|p| p.parse::<u16>())
            .transpose()
            .context("invalid port")?
            .unwrap_or(5020),
        rtu_over_tcp: args.iter().any(|a| a == "--rtu-over-tcp"),
        timeout_ms: 2000,
        retries: 1,
        ..defaults
    };
    config.validate()?;

    println!("Connecting to {}:{}...", config.address, config.port);
    let mut connection = TcpMasterConnection::from_config(&config);
    if let Err(e) = connection.connect().await {
        eprintln!("❌ Failed to connect: {}", e);
        eprintln!("Make sure a Modbus slave is running (try `slave_demo`)");
        return Ok(());
    }
    println!("✅ Connected");

    let mut logger = CallbackLogger::console();
    logger.set_mode(LoggingMode::Interpreted);
    let mut master = ModbusMaster::new(connection)
        .with_retries(config.retries)
        .with_logger(logger);
    let unit = 1;

    println!("\n📖 Read operations");
    match master.read_03(unit, 0, 5).await {
        Ok(values) => {
            for (i, value) in values.iter().enumerate() {
                println!("  Holding {}: {} (0x{:04X})", i, value, value);
            }
        }
        Err(e) => println!("  ❌ read holding registers: {}", e),
    }
    match master.read_04(unit, 0, 3).await {
        Ok(values) => println!("  Input registers 0-2: {:?}", values),
        Err(e) => println!("  ❌ read input registers: {}", e),
    }
    match master.read_01(unit, 0, 8).await {
        Ok(bits) => println!("  Coils 0-7: {:?}", bits),
        Err(e) => println!("  ❌ read coils: {}", e),
    }

    println!("\n✏️  Write operations");
    master.write_06(unit, 100, 0x1234).await?;
    master.write_10(unit, 101, &[1, 2, 3]).await?;
    master.write_05(unit, 20, true).await?;
    master.mask_write_16(unit, 100, 0x00FF, 0x0000).await?;
    let readback = master.read_write_17(unit, 100, 4, 104, &[0xBEEF]).await?;
    println!("  Registers 100-103 after writes: {}", registers_to_hex(&readback));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let connection = master.link_mut();
    if let Some(transport) = connection.transport() {
        let stats = transport.stats();
        println!("\n📊 Statistics");
        println!("  Requests sent: {}", stats.requests_sent);
        println!("  Responses received: {}", stats.responses_received);
        println!("  Errors: {}", stats.errors);
        println!("  Timeouts: {}", stats.timeouts);
    }
    connection.close().await;
    Ok(())
}
