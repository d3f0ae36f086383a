// Persistence seam for CA material, issued certificates and revocations

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use trellis_common::{CaRecord, CertKind, CertRecord, Result, RevokedCert, TrellisError};

/// Storage backing a [`crate::CertAuthority`].
///
/// The registry binds this to the replicated log; [`MemoryCaStorage`] keeps
/// everything in process.
#[async_trait]
pub trait CaStorage: Send + Sync {
    async fn load_ca(&self, network: &str) -> Result<Option<CaRecord>>;

    /// Store a CA unless one exists; returns whichever CA won
    async fn store_ca(&self, ca: CaRecord) -> Result<CaRecord>;

    async fn load_cert(
        &self,
        network: &str,
        kind: CertKind,
        subject: &str,
    ) -> Result<Option<CertRecord>>;

    /// Store an issued certificate. Fails AlreadyExists while an unrevoked
    /// certificate for the same (network, kind, subject) exists.
    async fn store_cert(&self, cert: CertRecord) -> Result<CertRecord>;

    async fn is_revoked(&self, network: &str, fingerprint: &str) -> Result<bool>;

    async fn store_revocation(&self, revoked: RevokedCert) -> Result<RevokedCert>;

    async fn list_revocations(&self, network: &str) -> Result<Vec<RevokedCert>>;
}

#[derive(Default)]
struct MemoryInner {
    cas: HashMap<String, CaRecord>,
    certs: HashMap<(String, CertKind, String), CertRecord>,
    revocations: HashMap<(String, String), RevokedCert>,
}

/// In-process [`CaStorage`]
#[derive(Default)]
pub struct MemoryCaStorage {
    inner: RwLock<MemoryInner>,
}

impl MemoryCaStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CaStorage for MemoryCaStorage {
    async fn load_ca(&self, network: &str) -> Result<Option<CaRecord>> {
        Ok(self.inner.read().cas.get(network).cloned())
    }

    async fn store_ca(&self, ca: CaRecord) -> Result<CaRecord> {
        let mut inner = self.inner.write();
        Ok(inner.cas.entry(ca.network.clone()).or_insert(ca).clone())
    }

    async fn load_cert(
        &self,
        network: &str,
        kind: CertKind,
        subject: &str,
    ) -> Result<Option<CertRecord>> {
        let key = (network.to_string(), kind, subject.to_string());
        Ok(self.inner.read().certs.get(&key).cloned())
    }

    async fn store_cert(&self, cert: CertRecord) -> Result<CertRecord> {
        let mut inner = self.inner.write();
        let key = (cert.network.clone(), cert.kind, cert.subject.clone());
        if let Some(existing) = inner.certs.get(&key) {
            let revoked_key = (existing.network.clone(), existing.fingerprint.clone());
            if !inner.revocations.contains_key(&revoked_key) {
                return Err(TrellisError::already_exists(format!(
                    "{} certificate for '{}' already issued in network '{}'",
                    cert.kind, cert.subject, cert.network
                )));
            }
        }
        inner.certs.insert(key, cert.clone());
        Ok(cert)
    }

    async fn is_revoked(&self, network: &str, fingerprint: &str) -> Result<bool> {
        let key = (network.to_string(), fingerprint.to_string());
        Ok(self.inner.read().revocations.contains_key(&key))
    }

    async fn store_revocation(&self, revoked: RevokedCert) -> Result<RevokedCert> {
        let mut inner = self.inner.write();
        let key = (revoked.network.clone(), revoked.fingerprint.clone());
        Ok(inner.revocations.entry(key).or_insert(revoked).clone())
    }

    async fn list_revocations(&self, network: &str) -> Result<Vec<RevokedCert>> {
        let mut list: Vec<RevokedCert> = self
            .inner
            .read()
            .revocations
            .values()
            .filter(|r| r.network == network)
            .cloned()
            .collect();
        list.sort_by_key(|r| r.revoked);
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cert(fingerprint: &str) -> CertRecord {
        CertRecord {
            network: "example".to_string(),
            kind: CertKind::Host,
            subject: "api".to_string(),
            cert_pem: String::new(),
            serial: "01".to_string(),
            fingerprint: fingerprint.to_string(),
            issued: 1,
        }
    }

    #[tokio::test]
    async fn test_store_ca_first_wins() {
        let storage = MemoryCaStorage::new();
        let ca = |key: &str| CaRecord {
            network: "example".to_string(),
            cert_pem: "cert".to_string(),
            key_pem: key.to_string(),
            cap_secret: "00".to_string(),
            created: 0,
        };
        storage.store_ca(ca("first")).await.unwrap();
        let winner = storage.store_ca(ca("second")).await.unwrap();
        assert_eq!(winner.key_pem, "first");
    }

    #[tokio::test]
    async fn test_store_cert_requires_revocation() {
        let storage = MemoryCaStorage::new();
        storage.store_cert(cert("aa")).await.unwrap();
        let err = storage.store_cert(cert("bb")).await.unwrap_err();
        assert_eq!(err.kind, trellis_common::ErrorKind::AlreadyExists);

        storage
            .store_revocation(RevokedCert {
                network: "example".to_string(),
                fingerprint: "aa".to_string(),
                serial: "01".to_string(),
                subject: "api".to_string(),
                revoked: 2,
            })
            .await
            .unwrap();
        assert!(storage.is_revoked("example", "aa").await.unwrap());
        storage.store_cert(cert("bb")).await.unwrap();
        assert_eq!(storage.list_revocations("example").await.unwrap().len(), 1);
        assert!(storage.list_revocations("other").await.unwrap().is_empty());
    }
}
