// CA storage bound to the replicated log
// Every CA, certificate and revocation write is a raft command

use std::sync::Arc;

use async_trait::async_trait;
use trellis_common::{CaRecord, CertKind, CertRecord, Result, RevokedCert};
use trellis_consistency::RaftRequest;
use trellis_pki::CaStorage;

use crate::store::{RegistryStore, expect_doc, storage_error};

pub struct RaftCaStorage {
    store: Arc<RegistryStore>,
}

impl RaftCaStorage {
    pub fn new(store: Arc<RegistryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CaStorage for RaftCaStorage {
    async fn load_ca(&self, network: &str) -> Result<Option<CaRecord>> {
        self.store.reader().get_ca(network).map_err(storage_error)
    }

    async fn store_ca(&self, ca: CaRecord) -> Result<CaRecord> {
        expect_doc(self.store.submit(RaftRequest::CaPut { ca }).await?)
    }

    async fn load_cert(
        &self,
        network: &str,
        kind: CertKind,
        subject: &str,
    ) -> Result<Option<CertRecord>> {
        self.store
            .reader()
            .get_cert(network, kind, subject)
            .map_err(storage_error)
    }

    async fn store_cert(&self, cert: CertRecord) -> Result<CertRecord> {
        expect_doc(self.store.submit(RaftRequest::CertIssue { cert }).await?)
    }

    async fn is_revoked(&self, network: &str, fingerprint: &str) -> Result<bool> {
        Ok(self
            .store
            .reader()
            .get_revocation(network, fingerprint)
            .map_err(storage_error)?
            .is_some())
    }

    async fn store_revocation(&self, revoked: RevokedCert) -> Result<RevokedCert> {
        expect_doc(self.store.submit(RaftRequest::CertRevoke { revoked }).await?)
    }

    async fn list_revocations(&self, network: &str) -> Result<Vec<RevokedCert>> {
        self.store
            .reader()
            .list_revocations(network)
            .map_err(storage_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::single_node_store;
    use trellis_common::ErrorKind;
    use trellis_pki::{CertAuthority, CertPolicy, SignConstraints, build_csr};

    #[tokio::test(flavor = "multi_thread")]
    async fn test_authority_over_raft_storage() {
        let (store, _dir) = single_node_store().await;
        let ca = CertAuthority::new(
            Arc::new(RaftCaStorage::new(store.clone())),
            CertPolicy::default(),
        );

        let first = ca.get_or_create_ca("example").await.unwrap();
        assert_eq!(store.reader().get_ca("example").unwrap(), Some(first.clone()));
        assert_eq!(ca.get_or_create_ca("example").await.unwrap(), first);

        let (csr, _) = build_csr("00.svc").unwrap();
        let cert = ca
            .sign_csr("example", CertKind::Host, &csr, &SignConstraints::default())
            .await
            .unwrap();
        let err = ca
            .sign_csr("example", CertKind::Host, &csr, &SignConstraints::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AlreadyExists);

        ca.revoke("example", &cert.cert_pem).await.unwrap();
        let err = ca.validate("example", &cert.cert_pem).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Revoked);
        assert_eq!(store.reader().list_revocations("example").unwrap().len(), 1);
    }
}
