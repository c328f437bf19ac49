//! TLS upgrade and role negotiation
//!
//! Secure links use self-signed certificates under a trust-on-first-use model.
//! The TLS layer never rejects a peer; certificate validation happens at the
//! application layer against the pinned fingerprint.
//!
//! Which endpoint plays the TLS server is derived from the two device IDs, so
//! both sides reach the same answer without any extra negotiation.

use crate::error::{ProtocolError, Result};
use crate::trust::CertificateProvider;
use openssl::pkey::PKey;
use openssl::ssl::{Ssl, SslAcceptor, SslConnector, SslMethod, SslVerifyMode, SslVersion};
use openssl::x509::X509;
use std::pin::Pin;
use tokio::net::TcpStream;
use tokio_openssl::SslStream;
use tracing::debug;

/// Cipher suites accepted on secure links
///
/// @SECLEVEL=1 permits TLS 1.0 and the weaker ECDHE-RSA suite needed by
/// older remote implementations (security level 2 blocks them).
const CIPHER_LIST: &str =
    "ECDHE-ECDSA-AES256-GCM-SHA384:ECDHE-ECDSA-AES128-GCM-SHA256:ECDHE-RSA-AES128-SHA:@SECLEVEL=1";

/// Role an endpoint plays during the TLS handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRole {
    Server,
    Client,
}

impl TlsRole {
    /// Derive the local role from the two device IDs
    ///
    /// The endpoint with the lexicographically greater ID acts as the TLS
    /// server. Both sides evaluate this on their own IDs and always agree.
    pub fn for_ids(local_id: &str, remote_id: &str) -> Self {
        if local_id > remote_id {
            TlsRole::Server
        } else {
            TlsRole::Client
        }
    }
}

/// Build a TLS acceptor from the local certificate
pub fn build_acceptor(provider: &dyn CertificateProvider) -> Result<SslAcceptor> {
    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())?;

    builder.set_min_proto_version(Some(SslVersion::TLS1))?;
    builder.set_max_proto_version(Some(SslVersion::TLS1_3))?;
    builder.set_cipher_list(CIPHER_LIST)?;

    // PEER makes the server send a CertificateRequest so the client presents
    // its certificate; the callback accepts any chain. The fingerprint check
    // against the trust store happens after the handshake.
    builder.set_verify_callback(SslVerifyMode::PEER, |_, _| true);

    let cert = X509::from_der(provider.certificate_der())?;
    let pkey = PKey::private_key_from_der(provider.private_key_der())?;
    builder.set_certificate(&cert)?;
    builder.set_private_key(&pkey)?;

    Ok(builder.build())
}

/// Build a TLS connector from the local certificate
pub fn build_connector(provider: &dyn CertificateProvider) -> Result<SslConnector> {
    let mut builder = SslConnector::builder(SslMethod::tls_client())?;

    builder.set_min_proto_version(Some(SslVersion::TLS1))?;
    builder.set_max_proto_version(Some(SslVersion::TLS1_3))?;
    builder.set_cipher_list(CIPHER_LIST)?;
    builder.set_verify(SslVerifyMode::NONE);

    let cert = X509::from_der(provider.certificate_der())?;
    let pkey = PKey::private_key_from_der(provider.private_key_der())?;
    builder.set_certificate(&cert)?;
    builder.set_private_key(&pkey)?;

    Ok(builder.build())
}

/// Upgrade a plaintext TCP stream to TLS in the given role
///
/// Returns the encrypted stream and the peer certificate in DER form.
pub async fn secure(
    tcp: TcpStream,
    role: TlsRole,
    provider: &dyn CertificateProvider,
) -> Result<(SslStream<TcpStream>, Vec<u8>)> {
    let ssl = match role {
        TlsRole::Server => {
            let acceptor = build_acceptor(provider)?;
            Ssl::new(acceptor.context())?
        }
        TlsRole::Client => {
            let connector = build_connector(provider)?;
            Ssl::new(connector.context())?
        }
    };

    let mut stream = SslStream::new(ssl, tcp)?;
    match role {
        TlsRole::Server => Pin::new(&mut stream).accept().await?,
        TlsRole::Client => Pin::new(&mut stream).connect().await?,
    }

    debug!(?role, "TLS handshake complete");

    let peer_cert = stream
        .ssl()
        .peer_certificate()
        .ok_or_else(|| {
            ProtocolError::CertificateValidation("Peer presented no certificate".to_string())
        })?
        .to_der()?;

    Ok((stream, peer_cert))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::LocalCertificate;
    use openssl::asn1::Asn1Time;
    use openssl::hash::MessageDigest;
    use openssl::rsa::Rsa;
    use openssl::x509::X509Name;
    use tokio::net::TcpListener;

    fn test_certificate(common_name: &str) -> LocalCertificate {
        let rsa = Rsa::generate(2048).unwrap();
        let pkey = PKey::from_rsa(rsa).unwrap();

        let mut name = X509Name::builder().unwrap();
        name.append_entry_by_text("CN", common_name).unwrap();
        let name = name.build();

        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(365).unwrap())
            .unwrap();
        builder.set_pubkey(&pkey).unwrap();
        builder.sign(&pkey, MessageDigest::sha256()).unwrap();
        let cert = builder.build();

        LocalCertificate::new(cert.to_der().unwrap(), pkey.private_key_to_der().unwrap())
    }

    #[test]
    fn test_role_from_ids() {
        assert_eq!(TlsRole::for_ids("aaa", "zzz"), TlsRole::Client);
        assert_eq!(TlsRole::for_ids("zzz", "aaa"), TlsRole::Server);
    }

    #[test]
    fn test_role_symmetric() {
        let pairs = [("alpha", "beta"), ("device_9", "device_1"), ("a", "ab")];
        for (a, b) in pairs {
            let role_a = TlsRole::for_ids(a, b);
            let role_b = TlsRole::for_ids(b, a);
            assert_ne!(role_a, role_b, "both endpoints picked {:?}", role_a);
        }
    }

    #[tokio::test]
    async fn test_secure_captures_peer_certificate_in_both_roles() {
        let server_cert = test_certificate("server_device");
        let client_cert = test_certificate("client_device");
        let server_der = server_cert.certificate_der().to_vec();
        let client_der = client_cert.certificate_der().to_vec();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            secure(tcp, TlsRole::Server, &server_cert).await.unwrap()
        });

        let tcp = TcpStream::connect(addr).await.unwrap();
        let (_client_stream, cert_seen_by_client) =
            secure(tcp, TlsRole::Client, &client_cert).await.unwrap();
        let (_server_stream, cert_seen_by_server) = server.await.unwrap();

        assert_eq!(cert_seen_by_client, server_der);
        assert_eq!(cert_seen_by_server, client_der);
    }
}
