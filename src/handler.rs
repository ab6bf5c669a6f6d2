//! Slave-side connection handler
//!
//! One [`ConnectionHandler`] serves one accepted connection on its own task,
//! answering requests until the channel ends. With an idle limit configured,
//! a watchdog task closes the connection once no bytes have moved for longer
//! than the limit.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::image::{handle_request, RequestListener};
use crate::transport::{ActivityClock, CloseHandle, Transport};

/// Longest interval between two watchdog checks
const MAX_WATCHDOG_PERIOD: Duration = Duration::from_secs(5);

pub struct ConnectionHandler {
    transport: Transport,
    listener: Arc<dyn RequestListener>,
    max_idle: Option<Duration>,
    peer: Option<SocketAddr>,
    /// Pool slot held for the lifetime of the connection
    permit: Option<OwnedSemaphorePermit>,
}

impl ConnectionHandler {
    pub fn new(transport: Transport, listener: Arc<dyn RequestListener>) -> Self {
        Self {
            transport,
            listener,
            max_idle: None,
            peer: None,
            permit: None,
        }
    }

    /// Close the connection after `max_idle` without traffic
    pub fn with_max_idle(mut self, max_idle: Option<Duration>) -> Self {
        self.max_idle = max_idle;
        self
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn with_permit(mut self, permit: OwnedSemaphorePermit) -> Self {
        self.permit = Some(permit);
        self
    }

    /// Handle for closing the connection from outside the handler task
    pub fn close_handle(&self) -> CloseHandle {
        self.transport.close_handle()
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Serve requests until the channel ends or an addressed frame fails
    pub async fn run(mut self) {
        let peer = self
            .peer
            .map(|p| p.to_string())
            .unwrap_or_else(|| "<local>".to_string());
        debug!("Serving connection from {}", peer);

        let watchdog = self.max_idle.map(|max_idle| {
            spawn_watchdog(
                self.transport.activity(),
                self.transport.close_handle(),
                max_idle,
                peer.clone(),
            )
        });

        loop {
            if let Err(e) = handle_request(&mut self.transport, self.listener.as_ref()).await {
                if e.is_eof() {
                    debug!("Connection from {} ended: {}", peer, e);
                } else {
                    warn!("Closing connection from {}: {}", peer, e);
                }
                break;
            }
        }

        self.transport.close().await;
        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }
        drop(self.permit.take());
        info!("🔌 Client {} disconnected", peer);
    }
}

fn spawn_watchdog(
    activity: ActivityClock,
    closer: CloseHandle,
    max_idle: Duration,
    peer: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(max_idle.min(MAX_WATCHDOG_PERIOD));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if closer.is_closed() {
                break;
            }
            let idle = activity.idle();
            if idle > max_idle {
                warn!(
                    "Closing connection from {} after {:?} without activity (limit {:?})",
                    peer, idle, max_idle
                );
                closer.close();
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{tcp, FrameCodec};
    use crate::image::UnitMap;
    use crate::protocol::Frame;
    use crate::register_bank::RegisterBank;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::{timeout, Instant};

    fn units() -> Arc<dyn RequestListener> {
        let units = UnitMap::new();
        units.insert(1, Arc::new(RegisterBank::new()));
        Arc::new(units)
    }

    #[tokio::test]
    async fn test_serves_until_peer_closes() {
        let (local, mut remote) = tokio::io::duplex(256);
        let handler = ConnectionHandler::new(Transport::new(local, FrameCodec::Tcp), units());
        let task = handler.spawn();

        remote
            .write_all(&tcp::encode(&Frame::new(1, 0x06, vec![0, 1, 0, 9]), 1))
            .await
            .unwrap();
        let mut reply = [0u8; 12];
        remote.read_exact(&mut reply).await.unwrap();
        assert_eq!(tcp::decode(&reply).unwrap().payload, vec![0, 1, 0, 9]);

        drop(remote);
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_watchdog_closes_idle_connection() {
        let (local, mut remote) = tokio::io::duplex(256);
        let handler = ConnectionHandler::new(Transport::new(local, FrameCodec::Tcp), units())
            .with_max_idle(Some(Duration::from_millis(300)));
        let started = Instant::now();
        let task = handler.spawn();

        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(300));

        let mut buf = [0u8; 1];
        assert_eq!(remote.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_external_close_stops_handler() {
        let (local, _remote) = tokio::io::duplex(256);
        let handler = ConnectionHandler::new(Transport::new(local, FrameCodec::Tcp), units());
        let closer = handler.close_handle();
        let task = handler.spawn();

        closer.close();
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}
