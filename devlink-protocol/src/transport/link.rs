//! Link establishment and packet framing
//!
//! A link is set up in two phases: an identity packet exchange over plaintext
//! TCP, then a TLS upgrade in the role derived from both device IDs. Packets
//! are newline-delimited JSON; the frame reader tolerates partial reads and
//! rejects frames beyond [`MAX_PACKET_SIZE`] before buffering them whole.

use crate::error::{ProtocolError, Result};
use crate::identity::DeviceInfo;
use crate::packet::{Packet, MAX_PACKET_SIZE};
use crate::transport::tls::{self, TlsRole};
use crate::trust::{calculate_fingerprint, CertificateProvider};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_openssl::SslStream;
use tracing::{debug, info, trace};

/// Bound on identity exchange and TLS handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Accumulates bytes and yields complete newline-terminated frames
struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete frame, without its newline
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            if pos > MAX_PACKET_SIZE {
                return Err(ProtocolError::PacketSizeExceeded(pos, MAX_PACKET_SIZE));
            }
            let mut frame: Vec<u8> = self.buf.drain(..=pos).collect();
            frame.pop();
            if frame.last() == Some(&b'\r') {
                frame.pop();
            }
            return Ok(Some(frame));
        }

        // No delimiter yet; refuse to buffer past the size limit
        if self.buf.len() > MAX_PACKET_SIZE {
            return Err(ProtocolError::PacketSizeExceeded(
                self.buf.len(),
                MAX_PACKET_SIZE,
            ));
        }
        Ok(None)
    }
}

async fn read_framed_packet<R>(reader: &mut R, buffer: &mut FrameBuffer) -> Result<Option<Packet>>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 8192];
    loop {
        if let Some(frame) = buffer.next_frame()? {
            if frame.is_empty() {
                continue;
            }
            return Ok(Some(Packet::from_bytes(&frame)?));
        }

        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buffer.extend(&chunk[..n]);
    }
}

/// Link after identity exchange but before the TLS upgrade
pub struct PendingLink {
    tcp: TcpStream,
    remote_addr: SocketAddr,
    remote_identity: DeviceInfo,
}

impl PendingLink {
    /// Open an outgoing link: connect, send our identity, read theirs
    pub async fn connect(
        addr: SocketAddr,
        local: &DeviceInfo,
        handshake_timeout: Duration,
    ) -> Result<Self> {
        let mut tcp = timeout(handshake_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ProtocolError::Timeout(format!("connecting to {}", addr)))?
            .map_err(|e| ProtocolError::from_io_error(e, &format!("connect to {}", addr)))?;
        tcp.set_nodelay(true)?;
        debug!(remote = %addr, "TCP connection established");

        let bytes = local.to_identity_packet().to_bytes()?;
        tcp.write_all(&bytes).await?;

        let remote_identity =
            read_identity(&mut tcp, handshake_timeout, "identity from connect peer").await?;

        Ok(Self {
            tcp,
            remote_addr: addr,
            remote_identity,
        })
    }

    /// Accept an incoming link: read their identity, send ours
    pub async fn accept(
        mut tcp: TcpStream,
        remote_addr: SocketAddr,
        local: &DeviceInfo,
        handshake_timeout: Duration,
    ) -> Result<Self> {
        tcp.set_nodelay(true)?;

        let remote_identity =
            read_identity(&mut tcp, handshake_timeout, "identity from accepted peer").await?;

        let bytes = local.to_identity_packet().to_bytes()?;
        tcp.write_all(&bytes).await?;

        Ok(Self {
            tcp,
            remote_addr,
            remote_identity,
        })
    }

    /// Identity the remote side announced during the exchange
    pub fn remote_identity(&self) -> &DeviceInfo {
        &self.remote_identity
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Upgrade to TLS and produce a secured link
    ///
    /// The handshake role comes from comparing the two device IDs, so the
    /// remote side independently arrives at the complementary role.
    pub async fn secure(
        self,
        provider: &dyn CertificateProvider,
        local_id: &str,
        handshake_timeout: Duration,
    ) -> Result<Link> {
        let role = TlsRole::for_ids(local_id, &self.remote_identity.device_id);
        debug!(
            device_id = %self.remote_identity.device_id,
            ?role,
            "Starting TLS upgrade"
        );

        let (stream, peer_certificate) =
            timeout(handshake_timeout, tls::secure(self.tcp, role, provider))
                .await
                .map_err(|_| {
                    ProtocolError::Timeout(format!(
                        "TLS handshake with {}",
                        self.remote_identity.device_id
                    ))
                })??;

        info!(
            device_id = %self.remote_identity.device_id,
            remote = %self.remote_addr,
            "Secure link established"
        );

        Ok(Link {
            stream,
            remote_addr: self.remote_addr,
            remote_identity: self.remote_identity,
            peer_certificate,
        })
    }
}

async fn read_identity(
    tcp: &mut TcpStream,
    handshake_timeout: Duration,
    context: &str,
) -> Result<DeviceInfo> {
    let mut buffer = FrameBuffer::new();
    let packet = timeout(handshake_timeout, read_framed_packet(tcp, &mut buffer))
        .await
        .map_err(|_| ProtocolError::Timeout(context.to_string()))??
        .ok_or_else(|| {
            ProtocolError::NetworkError("Connection closed during identity exchange".to_string())
        })?;

    DeviceInfo::from_identity_packet(&packet)
}

/// Secured link to a remote device
pub struct Link {
    stream: SslStream<TcpStream>,
    remote_addr: SocketAddr,
    remote_identity: DeviceInfo,
    peer_certificate: Vec<u8>,
}

impl Link {
    pub fn remote_identity(&self) -> &DeviceInfo {
        &self.remote_identity
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Fingerprint of the certificate the peer presented
    pub fn peer_fingerprint(&self) -> String {
        calculate_fingerprint(&self.peer_certificate)
    }

    /// Split into independent read and write halves
    pub fn into_parts(self) -> (LinkReader, LinkWriter) {
        let (read_half, write_half) = tokio::io::split(self.stream);
        (
            LinkReader {
                reader: read_half,
                buffer: FrameBuffer::new(),
                device_id: self.remote_identity.device_id.clone(),
            },
            LinkWriter {
                writer: write_half,
                device_id: self.remote_identity.device_id,
            },
        )
    }
}

/// Read half of a secured link
pub struct LinkReader {
    reader: ReadHalf<SslStream<TcpStream>>,
    buffer: FrameBuffer,
    device_id: String,
}

impl LinkReader {
    /// Read the next packet, `None` on orderly close
    pub async fn read_packet(&mut self) -> Result<Option<Packet>> {
        let packet = read_framed_packet(&mut self.reader, &mut self.buffer).await?;
        if let Some(ref packet) = packet {
            trace!(
                device_id = %self.device_id,
                packet_type = %packet.packet_type,
                "Received packet"
            );
        }
        Ok(packet)
    }
}

/// Write half of a secured link
pub struct LinkWriter {
    writer: WriteHalf<SslStream<TcpStream>>,
    device_id: String,
}

impl LinkWriter {
    /// Serialize and send one packet
    pub async fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        let bytes = packet.to_bytes()?;
        if bytes.len() > MAX_PACKET_SIZE {
            return Err(ProtocolError::PacketSizeExceeded(
                bytes.len(),
                MAX_PACKET_SIZE,
            ));
        }

        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;
        trace!(
            device_id = %self.device_id,
            packet_type = %packet.packet_type,
            "Sent packet"
        );
        Ok(())
    }

    /// Close the write side of the link
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// TCP listener for incoming links
pub struct LinkListener {
    listener: TcpListener,
    local_port: u16,
}

impl LinkListener {
    /// Bind the link listener, port 0 picks an ephemeral port
    pub async fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local_port = listener.local_addr()?.port();
        info!(port = local_port, "Link listener bound");
        Ok(Self {
            listener,
            local_port,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Accept one TCP connection; identity exchange is the caller's job
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        let (tcp, addr) = self.listener.accept().await?;
        debug!(remote = %addr, "Accepted incoming connection");
        Ok((tcp, addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_buffer_splits_on_newline() {
        let mut buffer = FrameBuffer::new();
        buffer.extend(b"{\"a\":1}\n{\"b\":");
        assert_eq!(buffer.next_frame().unwrap().unwrap(), b"{\"a\":1}");
        assert!(buffer.next_frame().unwrap().is_none());

        buffer.extend(b"2}\n");
        assert_eq!(buffer.next_frame().unwrap().unwrap(), b"{\"b\":2}");
    }

    #[test]
    fn test_frame_buffer_strips_carriage_return() {
        let mut buffer = FrameBuffer::new();
        buffer.extend(b"{\"a\":1}\r\n");
        assert_eq!(buffer.next_frame().unwrap().unwrap(), b"{\"a\":1}");
    }

    #[test]
    fn test_frame_buffer_rejects_oversized_partial() {
        let mut buffer = FrameBuffer::new();
        buffer.extend(&vec![b'x'; MAX_PACKET_SIZE + 1]);
        let err = buffer.next_frame().unwrap_err();
        assert!(matches!(err, ProtocolError::PacketSizeExceeded(_, _)));
    }

    #[test]
    fn test_frame_buffer_rejects_oversized_frame() {
        let mut buffer = FrameBuffer::new();
        let mut data = vec![b'x'; MAX_PACKET_SIZE + 1];
        data.push(b'\n');
        buffer.extend(&data);
        let err = buffer.next_frame().unwrap_err();
        assert!(matches!(err, ProtocolError::PacketSizeExceeded(_, _)));
    }

    #[tokio::test]
    async fn test_read_framed_packet_across_chunks() {
        let packet = Packet::new("devlink.ping", serde_json::json!({}));
        let bytes = packet.to_bytes().unwrap();

        let (client, mut server) = tokio::io::duplex(64);
        let handle = tokio::spawn(async move {
            let mut reader = client;
            let mut buffer = FrameBuffer::new();
            read_framed_packet(&mut reader, &mut buffer).await
        });

        // Drip-feed the serialized packet in two writes
        server.write_all(&bytes[..10]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.write_all(&bytes[10..]).await.unwrap();

        let received = handle.await.unwrap().unwrap().unwrap();
        assert_eq!(received.packet_type, "devlink.ping");
    }

    #[tokio::test]
    async fn test_read_framed_packet_eof() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);

        let mut reader = client;
        let mut buffer = FrameBuffer::new();
        let result = read_framed_packet(&mut reader, &mut buffer).await.unwrap();
        assert!(result.is_none());
    }
}
