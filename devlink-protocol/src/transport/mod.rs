//! Link transport
//!
//! Plaintext identity exchange over TCP, TLS upgrade, and newline-delimited
//! packet framing over the secured stream.

pub mod link;
pub mod tls;

pub use link::{Link, LinkListener, LinkReader, LinkWriter, PendingLink, HANDSHAKE_TIMEOUT};
pub use tls::TlsRole;
