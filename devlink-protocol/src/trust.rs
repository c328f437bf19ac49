//! Certificate trust and persisted pairing records
//!
//! Trust follows a trust-on-first-use model: the peer certificate seen when a
//! pairing completes is pinned by its SHA-256 fingerprint, and later links to
//! the same device must present a certificate with the same fingerprint.

use crate::error::{ProtocolError, Result};
use crate::pairing::PairingState;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Calculate the SHA-256 fingerprint of a DER certificate
///
/// Formatted as uppercase colon-separated hex pairs, matching what users see
/// in pairing verification dialogs.
pub fn calculate_fingerprint(cert_der: &[u8]) -> String {
    let digest = Sha256::digest(cert_der);
    hex::encode_upper(digest)
        .as_bytes()
        .chunks(2)
        .map(String::from_utf8_lossy)
        .collect::<Vec<_>>()
        .join(":")
}

/// Source of the local identity certificate used for TLS
pub trait CertificateProvider: Send + Sync {
    /// Local certificate in DER form
    fn certificate_der(&self) -> &[u8];

    /// Local private key in DER form (PKCS#8)
    fn private_key_der(&self) -> &[u8];

    /// Fingerprint of the local certificate
    fn fingerprint(&self) -> String {
        calculate_fingerprint(self.certificate_der())
    }
}

/// In-memory certificate and key pair
#[derive(Clone)]
pub struct LocalCertificate {
    certificate: Vec<u8>,
    private_key: Vec<u8>,
}

impl LocalCertificate {
    pub fn new(certificate_der: Vec<u8>, private_key_der: Vec<u8>) -> Self {
        Self {
            certificate: certificate_der,
            private_key: private_key_der,
        }
    }
}

impl CertificateProvider for LocalCertificate {
    fn certificate_der(&self) -> &[u8] {
        &self.certificate
    }

    fn private_key_der(&self) -> &[u8] {
        &self.private_key
    }
}

/// Persisted trust record for one device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustRecord {
    /// ID of the trusted device
    pub device_id: String,

    /// Pinned certificate fingerprint
    pub certificate_fingerprint: String,

    /// Pairing state at the time of persistence
    pub pairing_state: PairingState,
}

/// Persisted store of pairing records
///
/// Records are written through to a JSON file on every mutation so a restart
/// never loses a completed pairing.
pub struct TrustStore {
    path: PathBuf,
    records: Mutex<HashMap<String, TrustRecord>>,
}

impl TrustStore {
    /// Open the trust store, loading existing records if the file exists
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let records = match fs::read_to_string(&path).await {
            Ok(json) => serde_json::from_str(&json)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        debug!(path = %path.display(), "Trust store opened");
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    /// Record a trusted device, pinning its certificate fingerprint
    pub async fn record(&self, record: TrustRecord) -> Result<()> {
        let mut records = self.records.lock().await;
        records.insert(record.device_id.clone(), record);
        self.persist(&records).await
    }

    /// Look up the trust record for a device
    pub async fn lookup(&self, device_id: &str) -> Option<TrustRecord> {
        self.records.lock().await.get(device_id).cloned()
    }

    /// Remove the trust record for a device
    pub async fn remove(&self, device_id: &str) -> Result<()> {
        let mut records = self.records.lock().await;
        if records.remove(device_id).is_some() {
            self.persist(&records).await?;
        }
        Ok(())
    }

    /// Check whether a device has a completed pairing on record
    pub async fn is_trusted(&self, device_id: &str) -> bool {
        self.records
            .lock()
            .await
            .get(device_id)
            .map(|r| r.pairing_state == PairingState::Paired)
            .unwrap_or(false)
    }

    /// Verify a presented certificate against the pinned fingerprint
    ///
    /// Returns `Ok(())` when the device is unknown (first use) or when the
    /// fingerprint matches the record. A mismatch against a trusted record is
    /// a hard failure.
    pub async fn verify_fingerprint(&self, device_id: &str, fingerprint: &str) -> Result<()> {
        let records = self.records.lock().await;
        match records.get(device_id) {
            Some(record) if record.certificate_fingerprint != fingerprint => {
                warn!(
                    device_id = %device_id,
                    expected = %record.certificate_fingerprint,
                    presented = %fingerprint,
                    "Certificate fingerprint mismatch for trusted device"
                );
                Err(ProtocolError::CertificateValidation(format!(
                    "Certificate fingerprint mismatch for device {}",
                    device_id
                )))
            }
            _ => Ok(()),
        }
    }

    /// List all trusted device IDs
    pub async fn trusted_devices(&self) -> Vec<String> {
        self.records
            .lock()
            .await
            .iter()
            .filter(|(_, r)| r.pairing_state == PairingState::Paired)
            .map(|(id, _)| id.clone())
            .collect()
    }

    async fn persist(&self, records: &HashMap<String, TrustRecord>) -> Result<()> {
        let json = serde_json::to_string_pretty(records)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&self.path, json).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(device_id: &str, fingerprint: &str) -> TrustRecord {
        TrustRecord {
            device_id: device_id.to_string(),
            certificate_fingerprint: fingerprint.to_string(),
            pairing_state: PairingState::Paired,
        }
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = calculate_fingerprint(b"test certificate data");
        assert_eq!(fp.len(), 32 * 3 - 1);
        assert!(fp
            .split(':')
            .all(|pair| pair.len() == 2 && pair.chars().all(|c| c.is_ascii_hexdigit())));
        assert_eq!(fp, fp.to_uppercase());
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let a = calculate_fingerprint(b"same data");
        let b = calculate_fingerprint(b"same data");
        let c = calculate_fingerprint(b"other data");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_record_and_lookup() {
        let temp_dir = TempDir::new().unwrap();
        let store = TrustStore::open(temp_dir.path().join("trust.json"))
            .await
            .unwrap();

        store.record(record("dev_1", "AA:BB")).await.unwrap();
        let found = store.lookup("dev_1").await.unwrap();
        assert_eq!(found.certificate_fingerprint, "AA:BB");
        assert!(store.is_trusted("dev_1").await);
        assert!(!store.is_trusted("dev_2").await);
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("trust.json");

        {
            let store = TrustStore::open(&path).await.unwrap();
            store.record(record("dev_1", "AA:BB")).await.unwrap();
        }

        let store = TrustStore::open(&path).await.unwrap();
        assert!(store.is_trusted("dev_1").await);
    }

    #[tokio::test]
    async fn test_verify_fingerprint() {
        let temp_dir = TempDir::new().unwrap();
        let store = TrustStore::open(temp_dir.path().join("trust.json"))
            .await
            .unwrap();

        // Unknown device passes (first use)
        store.verify_fingerprint("dev_1", "AA:BB").await.unwrap();

        store.record(record("dev_1", "AA:BB")).await.unwrap();
        store.verify_fingerprint("dev_1", "AA:BB").await.unwrap();

        let err = store.verify_fingerprint("dev_1", "CC:DD").await.unwrap_err();
        assert!(matches!(err, ProtocolError::CertificateValidation(_)));
    }

    #[tokio::test]
    async fn test_remove() {
        let temp_dir = TempDir::new().unwrap();
        let store = TrustStore::open(temp_dir.path().join("trust.json"))
            .await
            .unwrap();

        store.record(record("dev_1", "AA:BB")).await.unwrap();
        store.remove("dev_1").await.unwrap();
        assert!(store.lookup("dev_1").await.is_none());
    }
}
