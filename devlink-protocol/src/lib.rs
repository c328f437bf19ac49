//! Device session engine
//!
//! A pure Rust engine for discovering devices on the local network,
//! establishing mutually authenticated TLS links, pairing with user consent,
//! and exchanging newline-delimited JSON packets through a capability-based
//! plugin layer.

pub mod config;
pub mod connection;
pub mod discovery;
pub mod events;
pub mod identity;
pub mod packet;
pub mod pairing;
pub mod plugins;
pub mod session;
pub mod transport;
pub mod trust;

mod error;
pub use config::{Config, DeviceConfig, NetworkConfig, PathConfig};
pub use connection::{ConnectionConfig, ConnectionManager, ReconnectPolicy};
pub use discovery::{Discovery, RemoteAnnouncement};
pub use error::{ProtocolError, Result};
pub use events::DeviceEvent;
pub use identity::{DeviceInfo, DeviceType};
pub use packet::{current_timestamp, Packet, MAX_PACKET_SIZE};
pub use pairing::{PairingManager, PairingPacket, PairingState};
pub use session::{DeviceSession, Engine};
pub use transport::TlsRole;
pub use trust::{CertificateProvider, LocalCertificate, TrustStore};

/// Protocol version we implement
pub const PROTOCOL_VERSION: u32 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_version() {
        assert_eq!(PROTOCOL_VERSION, 1);
    }
}
