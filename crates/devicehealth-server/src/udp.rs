//! UDP transports for devices.
//!
//! Each device gets its own socket bound to an ephemeral port so replies
//! can be attributed to the device by socket rather than by payload.

use devicehealth::{InboundRouter, Transport, TransportError};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Largest UDP payload over IPv4
const MAX_DATAGRAM: usize = 65_507;

/// Pause after a failed receive before polling the socket again
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Unicast transport to one device
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl UdpTransport {
    /// Bind an ephemeral local socket for `peer`
    pub async fn bind(peer: SocketAddr) -> io::Result<Self> {
        let local: SocketAddr = if peer.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        // Sends are non-blocking; wait for the first writable readiness here
        socket.writable().await?;
        debug!(peer = %peer, local = %socket.local_addr()?, "Bound device socket");
        Ok(Self {
            socket: Arc::new(socket),
            peer,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Spawn the receive loop. Datagrams from addresses other than the
    /// device are discarded.
    pub fn spawn_receiver(&self, router: InboundRouter) -> JoinHandle<()> {
        let socket = self.socket.clone();
        let peer = self.peer;
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, from)) if from == peer => {
                        trace!(worker = %router.worker(), len, "Datagram received");
                        router.route(&buf[..len]);
                    }
                    Ok((_, from)) => {
                        debug!(worker = %router.worker(), from = %from, "Ignoring datagram from unexpected sender");
                    }
                    Err(e) => {
                        // ICMP unreachable surfaces here on some platforms
                        warn!(worker = %router.worker(), error = %e, "UDP receive failed");
                        tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                    }
                }
            }
        })
    }
}

impl Transport for UdpTransport {
    fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        self.socket.try_send_to(payload, self.peer)?;
        Ok(())
    }
}

/// Transport that broadcasts to every device on the segment
pub struct BroadcastTransport {
    socket: UdpSocket,
    target: SocketAddr,
}

impl BroadcastTransport {
    /// Bind a broadcast-enabled socket sending to `target`
    pub async fn bind(target: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.set_broadcast(true)?;
        socket.writable().await?;
        Ok(Self { socket, target })
    }

    /// Limited broadcast address on `port`
    pub fn limited(port: u16) -> SocketAddr {
        (Ipv4Addr::BROADCAST, port).into()
    }
}

impl Transport for BroadcastTransport {
    fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        self.broadcast(payload)
    }

    fn broadcast(&self, payload: &[u8]) -> Result<(), TransportError> {
        self.socket.try_send_to(payload, self.target)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use devicehealth::{Dispatcher, HealthMonitor, MonitorConfig, MonitorDriver};
    use tokio::sync::mpsc;

    struct Forward(mpsc::UnboundedSender<Bytes>);

    impl Dispatcher for Forward {
        fn dispatch(&self, _worker: &str, payload: Bytes) {
            let _ = self.0.send(payload);
        }
    }

    #[tokio::test]
    async fn test_send_reaches_peer() {
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let transport = UdpTransport::bind(device.local_addr().unwrap()).await.unwrap();

        transport.send(b"PING").unwrap();

        let mut buf = [0u8; 16];
        let (len, from) = device.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"PING");
        assert_eq!(from.port(), transport.local_addr().unwrap().port());
    }

    #[tokio::test]
    async fn test_large_application_datagram_routed_intact() {
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let transport = UdpTransport::bind(device.local_addr().unwrap()).await.unwrap();
        let (handle, _task) =
            MonitorDriver::spawn(HealthMonitor::new(MonitorConfig::default()).unwrap());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let receiver = transport.spawn_receiver(InboundRouter::new(
            "drive-1",
            handle.clone(),
            Arc::new(Forward(tx)),
        ));

        let payload: Vec<u8> = (0..3000u32).map(|i| b'a' + (i % 26) as u8).collect();
        let target = SocketAddr::from(([127, 0, 0, 1], transport.local_addr().unwrap().port()));
        device.send_to(&payload, target).await.unwrap();

        let routed = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(routed.len(), 3000);
        assert_eq!(&routed[..], &payload[..]);

        receiver.abort();
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_broadcast_transport_sends_to_target() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let transport = BroadcastTransport::bind(listener.local_addr().unwrap())
            .await
            .unwrap();

        transport.broadcast(b"ZULU:20240315:142530.123").unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = listener.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"ZULU:20240315:142530.123");
    }

    #[test]
    fn test_limited_broadcast_addr() {
        assert_eq!(
            BroadcastTransport::limited(5000),
            "255.255.255.255:5000".parse::<SocketAddr>().unwrap()
        );
    }
}
