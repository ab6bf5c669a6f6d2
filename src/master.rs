//! # TCP master connection
//!
//! Lifecycle of one outbound Modbus TCP connection:
//!
//! ```text
//! Disconnected --connect()--> Connecting --ok--> Connected --close()/failure--> Disconnected
//! ```
//!
//! The connection owns one [`Transport`], framed either natively (MBAP) or
//! as RTU over TCP. Reconnecting with the same framing keeps the transport
//! and only rebinds its socket, so statistics survive reconnects.
//!
//! ```rust,no_run
//! use voltage_modbus_stack::master::TcpMasterConnection;
//! use voltage_modbus_stack::protocol::{Frame, ModbusFunction};
//!
//! # async fn example() -> voltage_modbus_stack::ModbusResult<()> {
//! let mut connection = TcpMasterConnection::new("192.168.1.10".parse().unwrap(), 502);
//! connection.connect().await?;
//! let request = Frame::request(1, ModbusFunction::ReadHoldingRegisters, vec![0, 0, 0, 10]);
//! let response = connection.execute(&request).await?;
//! println!("{}", response);
//! connection.close().await;
//! # Ok(())
//! # }
//! ```

use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;

use crate::codec::FrameCodec;
use crate::config::MasterConfig;
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::Frame;
use crate::transport::{ByteChannel, Transport, DEFAULT_TIMEOUT};
use crate::DEFAULT_TCP_PORT;

/// Linger applied to master sockets so close does not hang on unsent data
const SOCKET_LINGER: Duration = Duration::from_secs(1);

/// Outbound Modbus TCP connection
pub struct TcpMasterConnection {
    address: IpAddr,
    port: u16,
    local_address: Option<IpAddr>,
    timeout: Duration,
    use_rtu_over_tcp: bool,
    use_urgent_data: bool,
    packet_logging: bool,
    transport: Option<Transport>,
    connected: bool,
}

impl TcpMasterConnection {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self {
            address,
            port,
            local_address: None,
            timeout: DEFAULT_TIMEOUT,
            use_rtu_over_tcp: false,
            use_urgent_data: false,
            packet_logging: false,
            transport: None,
            connected: false,
        }
    }

    /// Connection to the default Modbus port
    pub fn with_default_port(address: IpAddr) -> Self {
        Self::new(address, DEFAULT_TCP_PORT)
    }

    pub fn from_config(config: &MasterConfig) -> Self {
        let mut connection = Self::new(config.address, config.port);
        connection.local_address = config.local_address;
        connection.timeout = config.timeout();
        connection.use_rtu_over_tcp = config.rtu_over_tcp;
        connection.use_urgent_data = config.use_urgent_data;
        connection.packet_logging = config.packet_logging;
        connection
    }

    /// Adopt an already connected stream
    pub fn from_stream(stream: TcpStream, use_rtu_over_tcp: bool) -> ModbusResult<Self> {
        let peer = stream.peer_addr()?;
        let mut connection = Self::new(peer.ip(), peer.port());
        connection.use_rtu_over_tcp = use_rtu_over_tcp;
        connection.prepare_transport(Box::new(stream));
        connection.connected = true;
        Ok(connection)
    }

    /// Connect using the configured framing
    pub async fn connect(&mut self) -> ModbusResult<()> {
        let rtu = self.use_rtu_over_tcp;
        self.connect_with(rtu).await
    }

    /// Connect, selecting native or RTU-over-TCP framing
    ///
    /// Does nothing when already connected.
    pub async fn connect_with(&mut self, use_rtu_over_tcp: bool) -> ModbusResult<()> {
        if self.is_connected() {
            return Ok(());
        }

        let remote = SocketAddr::new(self.address, self.port);
        debug!("Connecting to Modbus TCP endpoint {}", remote);
        let socket = if remote.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        self.configure_socket(&socket);
        if let Some(local) = self.local_address {
            socket.bind(SocketAddr::new(local, 0)).map_err(|e| {
                ModbusError::connection(format!("Failed to bind local address {}: {}", local, e))
            })?;
        }

        let stream = match timeout(self.timeout, socket.connect(remote)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(ModbusError::connection(format!(
                    "Failed to connect to {}: {}",
                    remote, e
                )))
            }
            Err(_) => {
                return Err(ModbusError::timeout(
                    format!("connect to {}", remote),
                    self.timeout.as_millis() as u64,
                ))
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }

        self.use_rtu_over_tcp = use_rtu_over_tcp;
        self.prepare_transport(Box::new(stream));
        self.connected = true;
        info!(
            "Connected to {} ({})",
            remote,
            if use_rtu_over_tcp { "RTU over TCP" } else { "TCP" }
        );
        Ok(())
    }

    fn configure_socket(&self, socket: &TcpSocket) {
        if let Err(e) = socket.set_reuseaddr(true) {
            warn!("Failed to set SO_REUSEADDR: {}", e);
        }
        let sock = socket2::SockRef::from(socket);
        if let Err(e) = sock.set_keepalive(true) {
            warn!("Failed to set keep-alive: {}", e);
        }
        if let Err(e) = sock.set_linger(Some(SOCKET_LINGER)) {
            warn!("Failed to set linger: {}", e);
        }
    }

    fn codec(&self) -> FrameCodec {
        if self.use_rtu_over_tcp {
            FrameCodec::rtu_over_tcp()
        } else {
            FrameCodec::Tcp
        }
    }

    /// Bind `channel` to a transport of the selected framing
    ///
    /// An existing transport with the same framing is reused.
    fn prepare_transport(&mut self, channel: Box<dyn ByteChannel>) {
        let codec = self.codec();
        match self.transport.as_mut() {
            Some(transport) if transport.codec() == codec => {
                transport.rebind_boxed(channel);
                transport.set_timeout(self.timeout);
            }
            _ => {
                let mut transport = Transport::from_boxed(channel, codec).with_timeout(self.timeout);
                transport.set_packet_logging(self.packet_logging);
                self.transport = Some(transport);
            }
        }
    }

    /// Re-validate the connection
    ///
    /// Checks for socket errors and a peer close without consuming input; with
    /// urgent data enabled a one-byte out-of-band probe is sent as well. A
    /// failed check closes the channel.
    pub fn is_connected(&mut self) -> bool {
        if !self.connected {
            return false;
        }
        let urgent = self.use_urgent_data;
        let alive = match self.transport.as_ref() {
            Some(transport) => match transport.probe(urgent) {
                Ok(()) => true,
                Err(e) => {
                    debug!("Connection to {}:{} lost: {}", self.address, self.port, e);
                    false
                }
            },
            None => false,
        };
        if !alive {
            if let Some(transport) = self.transport.as_mut() {
                transport.discard();
            }
            self.connected = false;
        }
        alive
    }

    /// Close the connection; repeated calls are harmless
    pub async fn close(&mut self) {
        if let Some(transport) = self.transport.as_mut() {
            transport.close().await;
        }
        if self.connected {
            debug!("Closed connection to {}:{}", self.address, self.port);
        }
        self.connected = false;
    }

    /// Send a request and wait for its response
    ///
    /// Channel failures close the connection. Checksum mismatches and
    /// timeouts are returned with the connection left open.
    pub async fn execute(&mut self, request: &Frame) -> ModbusResult<Frame> {
        if !self.connected {
            return Err(ModbusError::connection(format!(
                "Not connected to {}:{}",
                self.address, self.port
            )));
        }
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| ModbusError::internal("Connected without a transport"))?;

        match transport.exchange(request).await {
            Ok(response) => Ok(response),
            Err(e) => {
                if e.is_channel_error() {
                    warn!("Closing connection to {}:{}: {}", self.address, self.port, e);
                    transport.close().await;
                    self.connected = false;
                }
                Err(e)
            }
        }
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local_address(&self) -> Option<IpAddr> {
        self.local_address
    }

    /// Local interface for future connects
    pub fn set_local_address(&mut self, local_address: Option<IpAddr>) {
        self.local_address = local_address;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Connect and read timeout
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
        if let Some(transport) = self.transport.as_mut() {
            transport.set_timeout(timeout);
        }
    }

    pub fn use_rtu_over_tcp(&self) -> bool {
        self.use_rtu_over_tcp
    }

    /// Switch framing; a live connection moves its socket to a new transport
    pub fn set_use_rtu_over_tcp(&mut self, use_rtu_over_tcp: bool) {
        if self.use_rtu_over_tcp == use_rtu_over_tcp {
            return;
        }
        self.use_rtu_over_tcp = use_rtu_over_tcp;
        if !self.connected {
            return;
        }
        if let Some(channel) = self.transport.as_mut().and_then(|t| t.take_channel()) {
            self.prepare_transport(channel);
        }
    }

    pub fn use_urgent_data(&self) -> bool {
        self.use_urgent_data
    }

    pub fn set_use_urgent_data(&mut self, use_urgent_data: bool) {
        self.use_urgent_data = use_urgent_data;
    }

    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
        if let Some(transport) = self.transport.as_mut() {
            transport.set_packet_logging(enabled);
        }
    }

    pub fn transport(&self) -> Option<&Transport> {
        self.transport.as_ref()
    }

    pub fn transport_mut(&mut self) -> Option<&mut Transport> {
        self.transport.as_mut()
    }
}

impl std::fmt::Debug for TcpMasterConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpMasterConnection")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("connected", &self.connected)
            .field("rtu_over_tcp", &self.use_rtu_over_tcp)
            .finish()
    }
}

/// Connections are identified by remote address and port
impl PartialEq for TcpMasterConnection {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.port == other.port
    }
}

impl Eq for TcpMasterConnection {}

impl Hash for TcpMasterConnection {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.port.hash(state);
    }
}
