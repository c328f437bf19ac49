//! UDP broadcast device discovery
//!
//! Devices announce themselves by broadcasting identity packets on UDP port
//! 1716. The listener feeds parsed announcements into a channel; malformed
//! datagrams and self-announcements are dropped without disturbing the loop.
//!
//! ## Port Configuration
//!
//! - Primary port: UDP 1716
//! - Fallback range: 1714-1764
//! - Listen on 0.0.0.0 for incoming broadcasts

use crate::error::Result;
use crate::identity::DeviceInfo;
use crate::packet::Packet;
use std::net::{Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

/// Default UDP port for device discovery
pub const DISCOVERY_PORT: u16 = 1716;

/// Port range for fallback when the primary port is unavailable
pub const PORT_RANGE_START: u16 = 1714;
pub const PORT_RANGE_END: u16 = 1764;

/// Broadcast address for IPv4
pub const BROADCAST_ADDR: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 255);

/// Maximum accepted UDP datagram size
const MAX_DATAGRAM_SIZE: usize = 8192;

/// Bind retry attempts before giving up on the whole port range
const BIND_ATTEMPTS: u32 = 4;

/// Initial delay between bind retry rounds
const BIND_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Identity announcement received from a remote device
#[derive(Debug, Clone)]
pub struct RemoteAnnouncement {
    /// Announced identity
    pub identity: DeviceInfo,
    /// Source address of the datagram
    pub source: SocketAddr,
}

/// UDP discovery service
///
/// Owns a broadcast-capable socket bound within the discovery port range.
pub struct Discovery {
    socket: Arc<UdpSocket>,
    local: DeviceInfo,
    bound_port: u16,
    broadcast_port: u16,
}

impl Discovery {
    /// Bind a discovery socket, preferring `primary_port`
    ///
    /// Tries the primary port first, then walks the fallback range. If a full
    /// pass fails the round is retried with a doubling delay up to
    /// [`BIND_ATTEMPTS`] rounds before the last error is returned. Broadcasts
    /// always target `primary_port`, wherever the socket ended up bound.
    pub async fn bind(
        local: DeviceInfo,
        primary_port: u16,
        fallback: RangeInclusive<u16>,
    ) -> Result<Self> {
        let mut delay = BIND_RETRY_DELAY;
        let mut last_err = None;

        for attempt in 0..BIND_ATTEMPTS {
            match Self::try_bind_range(primary_port, fallback.clone()).await {
                Ok(socket) => {
                    let bound_port = socket.local_addr()?.port();
                    socket.set_broadcast(true)?;
                    info!(port = bound_port, "Discovery socket bound");
                    return Ok(Self {
                        socket: Arc::new(socket),
                        local,
                        bound_port,
                        broadcast_port: primary_port,
                    });
                }
                Err(e) => {
                    warn!(
                        attempt = attempt + 1,
                        error = %e,
                        "Failed to bind discovery port range, retrying"
                    );
                    last_err = Some(e);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::AddrInUse, "discovery bind failed").into()
        }))
    }

    async fn try_bind_range(
        primary_port: u16,
        fallback: RangeInclusive<u16>,
    ) -> Result<UdpSocket> {
        match UdpSocket::bind(("0.0.0.0", primary_port)).await {
            Ok(socket) => return Ok(socket),
            Err(e) => {
                debug!(port = primary_port, error = %e, "Primary discovery port unavailable");
            }
        }

        let mut last_err = None;
        for port in fallback {
            if port == primary_port {
                continue;
            }
            match UdpSocket::bind(("0.0.0.0", port)).await {
                Ok(socket) => {
                    debug!(port, "Bound fallback discovery port");
                    return Ok(socket);
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err
            .unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::AddrInUse, "no port available")
            })
            .into())
    }

    /// Port the discovery socket is bound to
    pub fn local_port(&self) -> u16 {
        self.bound_port
    }

    /// Broadcast the local identity packet
    pub async fn broadcast(&self) -> Result<()> {
        let packet = self.local.to_identity_packet();
        let bytes = packet.to_bytes()?;
        let target = SocketAddr::from((BROADCAST_ADDR, self.broadcast_port));

        self.socket.send_to(&bytes, target).await?;
        trace!(device_id = %self.local.device_id, "Broadcast identity packet");
        Ok(())
    }

    /// Spawn the listener task
    ///
    /// Returns a channel of announcements from other devices. Announcements
    /// carrying the local device ID are filtered out; datagrams that fail to
    /// parse are logged and skipped. The task exits when `shutdown` flips to
    /// true or the channel receiver is dropped.
    pub fn start_listener(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> mpsc::Receiver<RemoteAnnouncement> {
        let (tx, rx) = mpsc::channel(64);
        let socket = Arc::clone(&self.socket);
        let local_id = self.local.device_id.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                tokio::select! {
                    result = socket.recv_from(&mut buf) => {
                        let (len, source) = match result {
                            Ok(pair) => pair,
                            Err(e) => {
                                warn!(error = %e, "Discovery receive error");
                                continue;
                            }
                        };

                        let Some(announcement) =
                            parse_announcement(&buf[..len], source, &local_id)
                        else {
                            continue;
                        };

                        if tx.send(announcement).await.is_err() {
                            debug!("Announcement receiver dropped, stopping listener");
                            break;
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            debug!("Discovery listener shutting down");
                            break;
                        }
                    }
                }
            }
        });

        rx
    }
}

fn parse_announcement(
    data: &[u8],
    source: SocketAddr,
    local_id: &str,
) -> Option<RemoteAnnouncement> {
    let packet = match Packet::from_bytes(data) {
        Ok(packet) => packet,
        Err(e) => {
            debug!(source = %source, error = %e, "Ignoring malformed discovery datagram");
            return None;
        }
    };

    let identity = match DeviceInfo::from_identity_packet(&packet) {
        Ok(identity) => identity,
        Err(e) => {
            debug!(source = %source, error = %e, "Ignoring invalid identity announcement");
            return None;
        }
    };

    if identity.device_id == local_id {
        trace!("Ignoring own broadcast");
        return None;
    }

    debug!(
        device_id = %identity.device_id,
        device_name = %identity.device_name,
        source = %source,
        "Received identity announcement"
    );
    Some(RemoteAnnouncement { identity, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::DeviceType;

    fn local_info(name: &str) -> DeviceInfo {
        DeviceInfo::new(name, DeviceType::Desktop, 1716)
    }

    #[test]
    fn test_parse_announcement_filters_self() {
        let info = local_info("Self");
        let bytes = info.to_identity_packet().to_bytes().unwrap();
        let source: SocketAddr = "192.168.1.10:1716".parse().unwrap();

        assert!(parse_announcement(&bytes, source, &info.device_id).is_none());
        assert!(parse_announcement(&bytes, source, "some_other_id").is_some());
    }

    #[test]
    fn test_parse_announcement_rejects_garbage() {
        let source: SocketAddr = "192.168.1.10:1716".parse().unwrap();
        assert!(parse_announcement(b"not json", source, "id").is_none());
        assert!(parse_announcement(b"{\"id\":1,\"type\":\"devlink.ping\",\"body\":{}}", source, "id").is_none());
    }

    #[tokio::test]
    async fn test_bind_and_broadcast() {
        let range = PORT_RANGE_START..=PORT_RANGE_END;
        let discovery = match Discovery::bind(local_info("Broadcaster"), DISCOVERY_PORT, range).await
        {
            Ok(d) => d,
            // Port range fully occupied on the host; nothing to assert
            Err(_) => return,
        };

        assert!(discovery.local_port() >= PORT_RANGE_START);
        assert!(discovery.local_port() <= PORT_RANGE_END);
    }

    #[tokio::test]
    async fn test_bind_honors_configured_port() {
        let reserved = UdpSocket::bind("0.0.0.0:0").await.unwrap();
        let port = reserved.local_addr().unwrap().port();
        drop(reserved);

        let discovery = Discovery::bind(local_info("Configured"), port, port..=port)
            .await
            .unwrap();
        assert_eq!(discovery.local_port(), port);
    }

    #[tokio::test]
    async fn test_listener_receives_announcement() {
        let range = PORT_RANGE_START..=PORT_RANGE_END;
        let listener = match Discovery::bind(local_info("Listener"), DISCOVERY_PORT, range).await {
            Ok(d) => d,
            Err(_) => return,
        };
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut announcements = listener.start_listener(shutdown_rx);

        let remote = local_info("Remote");
        let bytes = remote.to_identity_packet().to_bytes().unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(&bytes, ("127.0.0.1", listener.local_port()))
            .await
            .unwrap();

        let announcement =
            tokio::time::timeout(Duration::from_secs(2), announcements.recv())
                .await
                .unwrap()
                .unwrap();
        assert_eq!(announcement.identity.device_id, remote.device_id);
    }
}
