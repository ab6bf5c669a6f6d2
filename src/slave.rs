//! # Slave listeners
//!
//! A [`ModbusSlave`] owns one listening endpoint and the unit table it
//! serves:
//!
//! - **TCP**: accept loop spawning a [`ConnectionHandler`] per connection,
//!   bounded by an optional connection pool, MBAP or RTU-over-TCP framing
//! - **UDP**: one MBAP request per datagram, answered to the sender
//! - **Serial**: a single request loop over a [`SerialPortIo`] in ASCII or
//!   RTU framing
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voltage_modbus_stack::config::TcpSlaveConfig;
//! use voltage_modbus_stack::register_bank::RegisterBank;
//! use voltage_modbus_stack::slave::ModbusSlave;
//!
//! # async fn example() -> voltage_modbus_stack::ModbusResult<()> {
//! let slave = ModbusSlave::tcp(TcpSlaveConfig::new(5020));
//! slave.add_process_image(1, Arc::new(RegisterBank::new()));
//! slave.open().await?;
//! // ...
//! slave.close().await;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpSocket, UdpSocket};
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::codec::{tcp, FrameCodec};
use crate::config::{TcpSlaveConfig, UdpSlaveConfig};
use crate::error::{ModbusError, ModbusResult};
use crate::handler::ConnectionHandler;
use crate::image::{handle_request, ProcessImage, RequestListener, UnitMap};
use crate::protocol::ModbusException;
use crate::serial::{serial_transport, SerialParameters, SerialPortIo, TokioSerialPort};
use crate::transport::{log_packet, CloseHandle, Transport};
use crate::MAX_TCP_FRAME_SIZE;

/// Pause after a UDP receive failure before polling the socket again
const UDP_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Listen backlog for TCP slaves
const LISTEN_BACKLOG: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlaveKind {
    Tcp,
    Udp,
    Serial,
}

impl fmt::Display for SlaveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlaveKind::Tcp => write!(f, "tcp"),
            SlaveKind::Udp => write!(f, "udp"),
            SlaveKind::Serial => write!(f, "serial"),
        }
    }
}

/// Where a slave listens: a port number or a serial device name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Port(u16),
    Name(String),
}

/// Registry key; at most one slave per kind and endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlaveKey {
    pub kind: SlaveKind,
    pub endpoint: Endpoint,
}

impl SlaveKey {
    pub fn tcp(port: u16) -> Self {
        Self {
            kind: SlaveKind::Tcp,
            endpoint: Endpoint::Port(port),
        }
    }

    pub fn udp(port: u16) -> Self {
        Self {
            kind: SlaveKind::Udp,
            endpoint: Endpoint::Port(port),
        }
    }

    pub fn serial(port_name: impl Into<String>) -> Self {
        Self {
            kind: SlaveKind::Serial,
            endpoint: Endpoint::Name(port_name.into()),
        }
    }
}

impl fmt::Display for SlaveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.endpoint {
            Endpoint::Port(port) => write!(f, "{}:{}", self.kind, port),
            Endpoint::Name(name) => write!(f, "{}:{}", self.kind, name),
        }
    }
}

/// Listener settings per slave kind
#[derive(Debug, Clone, PartialEq)]
pub enum SlaveEndpoint {
    Tcp(TcpSlaveConfig),
    Udp(UdpSlaveConfig),
    Serial(SerialParameters),
}

#[derive(Default)]
struct SlaveState {
    task: Option<JoinHandle<()>>,
    shutdown: Option<broadcast::Sender<()>>,
    local_addr: Option<SocketAddr>,
}

/// One listening endpoint and the process images it serves
pub struct ModbusSlave {
    endpoint: SlaveEndpoint,
    units: UnitMap,
    /// Port handed in by the caller, consumed by the first `open`
    injected_port: std::sync::Mutex<Option<Box<dyn SerialPortIo>>>,
    state: Mutex<SlaveState>,
}

impl ModbusSlave {
    pub fn new(endpoint: SlaveEndpoint) -> Self {
        Self {
            endpoint,
            units: UnitMap::new(),
            injected_port: std::sync::Mutex::new(None),
            state: Mutex::new(SlaveState::default()),
        }
    }

    pub fn tcp(config: TcpSlaveConfig) -> Self {
        Self::new(SlaveEndpoint::Tcp(config))
    }

    pub fn udp(config: UdpSlaveConfig) -> Self {
        Self::new(SlaveEndpoint::Udp(config))
    }

    /// Serial slave on the system port named in `params`
    pub fn serial(params: SerialParameters) -> Self {
        Self::new(SlaveEndpoint::Serial(params))
    }

    /// Serial slave over a caller-supplied port driver
    pub fn serial_with_port(params: SerialParameters, port: Box<dyn SerialPortIo>) -> Self {
        let mut slave = Self::serial(params);
        slave.injected_port = std::sync::Mutex::new(Some(port));
        slave
    }

    pub fn kind(&self) -> SlaveKind {
        match self.endpoint {
            SlaveEndpoint::Tcp(_) => SlaveKind::Tcp,
            SlaveEndpoint::Udp(_) => SlaveKind::Udp,
            SlaveEndpoint::Serial(_) => SlaveKind::Serial,
        }
    }

    pub fn key(&self) -> SlaveKey {
        match &self.endpoint {
            SlaveEndpoint::Tcp(config) => SlaveKey::tcp(config.port),
            SlaveEndpoint::Udp(config) => SlaveKey::udp(config.port),
            SlaveEndpoint::Serial(params) => SlaveKey::serial(params.port_name.clone()),
        }
    }

    pub fn endpoint(&self) -> &SlaveEndpoint {
        &self.endpoint
    }

    pub fn serial_parameters(&self) -> Option<&SerialParameters> {
        match &self.endpoint {
            SlaveEndpoint::Serial(params) => Some(params),
            _ => None,
        }
    }

    pub fn units(&self) -> &UnitMap {
        &self.units
    }

    /// Serve `unit_id` from `image`; takes effect for live connections too
    pub fn add_process_image(&self, unit_id: u8, image: Arc<dyn ProcessImage>) {
        self.units.insert(unit_id, image);
    }

    pub fn remove_process_image(&self, unit_id: u8) -> Option<Arc<dyn ProcessImage>> {
        self.units.remove(unit_id)
    }

    /// Start listening; does nothing when already running
    pub async fn open(&self) -> ModbusResult<()> {
        let mut state = self.state.lock().await;
        if state.task.as_ref().map_or(false, |task| !task.is_finished()) {
            return Ok(());
        }

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let listener: Arc<dyn RequestListener> = Arc::new(self.units.clone());

        let (task, local_addr) = match &self.endpoint {
            SlaveEndpoint::Tcp(config) => {
                let socket_listener = bind_tcp(config)?;
                let local_addr = socket_listener.local_addr()?;
                info!("🚀 Modbus TCP slave listening on {}", local_addr);
                let task = tokio::spawn(serve_tcp(socket_listener, config.clone(), listener, shutdown_rx));
                (task, Some(local_addr))
            }
            SlaveEndpoint::Udp(config) => {
                let socket = UdpSocket::bind(SocketAddr::new(config.bind_address, config.port))
                    .await
                    .map_err(|e| {
                        ModbusError::connection(format!("Failed to bind UDP port {}: {}", config.port, e))
                    })?;
                let local_addr = socket.local_addr()?;
                info!("🚀 Modbus UDP slave listening on {}", local_addr);
                let task = tokio::spawn(serve_udp(socket, config.packet_logging, listener, shutdown_rx));
                (task, Some(local_addr))
            }
            SlaveEndpoint::Serial(params) => {
                params.validate()?;
                let injected = self
                    .injected_port
                    .lock()
                    .map_err(|_| ModbusError::internal("Serial port slot lock poisoned"))?
                    .take();
                let port = match injected {
                    Some(port) => port,
                    None => Box::new(TokioSerialPort::new(params)) as Box<dyn SerialPortIo>,
                };
                let transport = serial_transport(port, params)?;
                info!(
                    "🚀 Modbus {} slave listening on {} at {} baud",
                    transport.codec().name(),
                    params.port_name,
                    params.baud_rate
                );
                let task = tokio::spawn(serve_serial(transport, listener, params.port_name.clone(), shutdown_rx));
                (task, None)
            }
        };

        state.task = Some(task);
        state.shutdown = Some(shutdown_tx);
        state.local_addr = local_addr;
        Ok(())
    }

    /// Stop listening and wait until the endpoint is released
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if let Some(shutdown) = state.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = state.task.take() {
            if let Err(e) = task.await {
                error!("Slave {} task failed: {}", self.key(), e);
            }
            info!("⏹️  Modbus slave {} stopped", self.key());
        }
        state.local_addr = None;
    }

    pub async fn is_running(&self) -> bool {
        let state = self.state.lock().await;
        state.task.as_ref().map_or(false, |task| !task.is_finished())
    }

    /// Bound socket address of a running TCP or UDP slave
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().await.local_addr
    }
}

impl fmt::Debug for ModbusSlave {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModbusSlave")
            .field("key", &self.key())
            .field("units", &self.units.unit_ids())
            .finish()
    }
}

impl Drop for ModbusSlave {
    fn drop(&mut self) {
        if let Some(shutdown) = self.state.get_mut().shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

fn bind_tcp(config: &TcpSlaveConfig) -> ModbusResult<TcpListener> {
    let address = SocketAddr::new(config.bind_address, config.port);
    let bind_error = |e: std::io::Error| {
        ModbusError::connection(format!("Failed to bind TCP port {}: {}", config.port, e))
    };
    let socket = if address.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(bind_error)?;
    socket.set_reuseaddr(true).map_err(bind_error)?;
    socket.bind(address).map_err(bind_error)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_error)
}

async fn serve_tcp(
    listener: TcpListener,
    config: TcpSlaveConfig,
    units: Arc<dyn RequestListener>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let codec = if config.rtu_over_tcp {
        FrameCodec::rtu_over_tcp()
    } else {
        FrameCodec::Tcp
    };
    let pool = (config.pool_size > 0).then(|| Arc::new(Semaphore::new(config.pool_size)));
    let mut connections: Vec<(CloseHandle, JoinHandle<()>)> = Vec::new();

    loop {
        // a full pool stops accepting until a connection ends
        let permit = match &pool {
            Some(pool) => tokio::select! {
                permit = pool.clone().acquire_owned() => match permit {
                    Ok(permit) => Some(permit),
                    Err(_) => break,
                },
                _ = shutdown.recv() => break,
            },
            None => None,
        };

        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!("📡 New client connected: {}", peer);
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                    }
                    let mut transport = Transport::new(stream, codec).with_timeout(config.timeout());
                    transport.set_packet_logging(config.packet_logging);

                    let mut handler = ConnectionHandler::new(transport, units.clone())
                        .with_max_idle(config.max_idle())
                        .with_peer(peer);
                    if let Some(permit) = permit {
                        handler = handler.with_permit(permit);
                    }
                    connections.retain(|(_, task)| !task.is_finished());
                    connections.push((handler.close_handle(), handler.spawn()));
                }
                Err(e) => error!("Failed to accept connection: {}", e),
            },
            _ = shutdown.recv() => break,
        }
    }

    drop(listener);
    debug!("Closing {} open connection(s)", connections.len());
    for (closer, task) in connections {
        closer.close();
        let _ = task.await;
    }
}

async fn serve_udp(
    socket: UdpSocket,
    packet_logging: bool,
    units: Arc<dyn RequestListener>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = [0u8; MAX_TCP_FRAME_SIZE];
    loop {
        let received = tokio::select! {
            received = socket.recv_from(&mut buf) => received,
            _ = shutdown.recv() => break,
        };
        let (len, peer) = match received {
            Ok(received) => received,
            Err(e) if is_transient_udp_error(&e) => {
                debug!("UDP receive interrupted: {}", e);
                continue;
            }
            Err(e) => {
                warn!("UDP receive failed: {}", e);
                tokio::select! {
                    _ = sleep(UDP_ERROR_BACKOFF) => continue,
                    _ = shutdown.recv() => break,
                }
            }
        };

        let datagram = &buf[..len];
        let request = match tcp::decode(datagram) {
            Ok(request) => request,
            Err(e) => {
                debug!("Dropping datagram from {}: {}", peer, e);
                continue;
            }
        };
        if packet_logging {
            log_packet("receive", datagram, "UDP", Some(request.unit_id));
        }

        let response = match units.process_image(request.unit_id) {
            Some(image) => image.process(&request).await,
            None => {
                debug!("No process image for unit {}", request.unit_id);
                request.exception_reply(ModbusException::GatewayTargetDeviceFailedToRespond)
            }
        };
        let wire = tcp::encode(&response, request.transaction_id.unwrap_or(0));
        if packet_logging {
            log_packet("send", &wire, "UDP", Some(response.unit_id));
        }
        if let Err(e) = socket.send_to(&wire, peer).await {
            warn!("Failed to answer {}: {}", peer, e);
        }
    }
}

/// Errors a datagram socket reports for one packet, e.g. ICMP port
/// unreachable surfacing as a reset
fn is_transient_udp_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

async fn serve_serial(
    mut transport: Transport,
    units: Arc<dyn RequestListener>,
    port_name: String,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let result = tokio::select! {
            result = handle_request(&mut transport, units.as_ref()) => result,
            _ = shutdown.recv() => break,
        };
        match result {
            Ok(()) => {}
            Err(e) if e.is_channel_error() => {
                error!("Serial slave on {} stopped: {}", port_name, e);
                break;
            }
            Err(e) => debug!("Serial slave on {}: {}", port_name, e),
        }
    }
    transport.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::crc16_bytes;
    use crate::protocol::Frame;
    use crate::register_bank::RegisterBank;
    use crate::serial::MemorySerialPort;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    fn loopback_tcp() -> TcpSlaveConfig {
        TcpSlaveConfig {
            bind_address: "127.0.0.1".parse().unwrap(),
            port: 0,
            ..TcpSlaveConfig::default()
        }
    }

    #[test]
    fn test_key_display() {
        assert_eq!(SlaveKey::tcp(502).to_string(), "tcp:502");
        assert_eq!(SlaveKey::serial("/dev/ttyS0").to_string(), "serial:/dev/ttyS0");
        assert_ne!(SlaveKey::tcp(502), SlaveKey::udp(502));
    }

    #[tokio::test]
    async fn test_tcp_open_serve_close() {
        let slave = ModbusSlave::tcp(loopback_tcp());
        let bank = RegisterBank::new();
        bank.write_registers(0, &[7]).unwrap();
        slave.add_process_image(1, Arc::new(bank));

        slave.open().await.unwrap();
        slave.open().await.unwrap();
        assert!(slave.is_running().await);
        let addr = slave.local_addr().await.unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(&tcp::encode(&Frame::new(1, 0x03, vec![0, 0, 0, 1]), 3))
            .await
            .unwrap();
        let mut reply = [0u8; 11];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(tcp::decode(&reply).unwrap().payload, vec![2, 0, 7]);

        timeout(Duration::from_secs(2), slave.close()).await.unwrap();
        assert!(!slave.is_running().await);
        assert!(slave.local_addr().await.is_none());

        // open connections are closed with the listener
        let mut buf = [0u8; 1];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_pool_limits_concurrent_connections() {
        let slave = ModbusSlave::tcp(TcpSlaveConfig {
            pool_size: 1,
            ..loopback_tcp()
        });
        slave.add_process_image(1, Arc::new(RegisterBank::new()));
        slave.open().await.unwrap();
        let addr = slave.local_addr().await.unwrap();
        let request = tcp::encode(&Frame::new(1, 0x03, vec![0, 0, 0, 1]), 1);

        let mut first = TcpStream::connect(addr).await.unwrap();
        let mut second = TcpStream::connect(addr).await.unwrap();
        first.write_all(&request).await.unwrap();
        let mut reply = [0u8; 11];
        first.read_exact(&mut reply).await.unwrap();

        second.write_all(&request).await.unwrap();
        assert!(timeout(Duration::from_millis(200), second.read_exact(&mut reply)).await.is_err());

        drop(first);
        timeout(Duration::from_secs(2), second.read_exact(&mut reply))
            .await
            .unwrap()
            .unwrap();
        slave.close().await;
    }

    #[test]
    fn test_udp_error_classification() {
        assert!(is_transient_udp_error(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(is_transient_udp_error(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_transient_udp_error(&io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(!is_transient_udp_error(&io::Error::from(io::ErrorKind::Other)));
    }

    #[tokio::test]
    async fn test_udp_request_and_unknown_unit() {
        let slave = ModbusSlave::udp(UdpSlaveConfig {
            bind_address: "127.0.0.1".parse().unwrap(),
            port: 0,
            packet_logging: true,
        });
        slave.add_process_image(1, Arc::new(RegisterBank::new()));
        slave.open().await.unwrap();
        let addr = slave.local_addr().await.unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut buf = [0u8; 64];

        client
            .send_to(&tcp::encode(&Frame::new(1, 0x06, vec![0, 2, 0, 5]), 11), addr)
            .await
            .unwrap();
        let (len, _) = timeout(Duration::from_secs(1), client.recv_from(&mut buf)).await.unwrap().unwrap();
        let reply = tcp::decode(&buf[..len]).unwrap();
        assert_eq!(reply.transaction_id, Some(11));
        assert_eq!(reply.payload, vec![0, 2, 0, 5]);

        client
            .send_to(&tcp::encode(&Frame::new(4, 0x03, vec![0, 0, 0, 1]), 12), addr)
            .await
            .unwrap();
        let (len, _) = timeout(Duration::from_secs(1), client.recv_from(&mut buf)).await.unwrap().unwrap();
        assert_eq!(tcp::decode(&buf[..len]).unwrap().exception_code(), Some(0x0B));

        slave.close().await;
    }

    #[tokio::test]
    async fn test_serial_slave_over_memory_port() {
        let (port, mut remote) = MemorySerialPort::pair("sim-slave", 256);
        let lines = port.line_state();
        let mut params = SerialParameters::new("sim-slave", 115_200);
        params.timeout_ms = 200;

        let slave = ModbusSlave::serial_with_port(params, Box::new(port));
        slave.add_process_image(1, Arc::new(RegisterBank::new()));
        slave.open().await.unwrap();
        assert!(lines.lock().unwrap().open);
        assert_eq!(lines.lock().unwrap().baud_rate, 115_200);

        let mut request = vec![0x01, 0x06, 0x00, 0x04, 0x00, 0x2A];
        request.extend_from_slice(&crc16_bytes(&request));
        remote.write_all(&request).await.unwrap();

        let mut reply = [0u8; 8];
        timeout(Duration::from_secs(1), remote.read_exact(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&reply[..], &request[..]);

        slave.close().await;
        assert!(!slave.is_running().await);
    }
}
