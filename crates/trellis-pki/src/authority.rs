//! Per-network certificate authority
//!
//! CA material is created lazily on first use and persisted through a
//! [`CaStorage`]. Concurrent creators converge on whichever CA the storage
//! committed first. Leaf certificates are signed from CSRs under a
//! [`CertPolicy`]; validation distinguishes revoked certificates from
//! otherwise bad ones.

use std::sync::Arc;

use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use trellis_common::{
    CaRecord, CertKind, CertRecord, Result, RevokedCert, SigningCapability, TrellisError,
    now_millis,
};

use crate::capability::CapabilitySeal;
use crate::policy::{CertPolicy, SignConstraints, check_subject, subject_alt_names};
use crate::storage::CaStorage;
use crate::x509::{self, CertInfo};

fn rcgen_error(what: &str) -> impl FnOnce(rcgen::Error) -> TrellisError + '_ {
    move |e| TrellisError::internal(format!("{}: {}", what, e))
}

/// Random positive 128-bit serial
fn random_serial() -> SerialNumber {
    let mut bytes = rand::random::<[u8; 16]>();
    bytes[0] &= 0x7f;
    SerialNumber::from(bytes.to_vec())
}

pub struct CertAuthority {
    storage: Arc<dyn CaStorage>,
    policy: CertPolicy,
    /// Serializes local CA creation
    create_lock: Mutex<()>,
}

impl CertAuthority {
    pub fn new(storage: Arc<dyn CaStorage>, policy: CertPolicy) -> Self {
        Self {
            storage,
            policy,
            create_lock: Mutex::new(()),
        }
    }

    pub fn policy(&self) -> &CertPolicy {
        &self.policy
    }

    /// CA for `network`, generating and persisting one if none exists
    pub async fn get_or_create_ca(&self, network: &str) -> Result<CaRecord> {
        if let Some(ca) = self.storage.load_ca(network).await? {
            return Ok(ca);
        }

        let _guard = self.create_lock.lock().await;
        if let Some(ca) = self.storage.load_ca(network).await? {
            return Ok(ca);
        }

        let generated = self.generate_ca(network)?;
        let stored = self.storage.store_ca(generated).await?;
        info!(network, "Certificate authority ready");
        Ok(stored)
    }

    fn generate_ca(&self, network: &str) -> Result<CaRecord> {
        let key = KeyPair::generate().map_err(rcgen_error("generate CA key"))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, network);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.serial_number = Some(random_serial());
        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + self.policy.ca_validity;

        let cert = params
            .self_signed(&key)
            .map_err(rcgen_error("self-sign CA"))?;

        Ok(CaRecord {
            network: network.to_string(),
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            cap_secret: const_hex::encode(rand::random::<[u8; 32]>()),
            created: now_millis(),
        })
    }

    pub async fn ca_cert_pem(&self, network: &str) -> Result<String> {
        Ok(self.get_or_create_ca(network).await?.cert_pem)
    }

    pub async fn get_cert(
        &self,
        network: &str,
        kind: CertKind,
        subject: &str,
    ) -> Result<CertRecord> {
        self.storage
            .load_cert(network, kind, subject)
            .await?
            .ok_or_else(|| {
                TrellisError::not_found(format!(
                    "no {} certificate for '{}' in network '{}'",
                    kind, subject, network
                ))
            })
    }

    /// Sign `csr_pem` as a `kind` certificate for the CSR's common name
    pub async fn sign_csr(
        &self,
        network: &str,
        kind: CertKind,
        csr_pem: &str,
        constraints: &SignConstraints,
    ) -> Result<CertRecord> {
        let csr = x509::parse_csr(csr_pem)?;
        let max_len = constraints
            .max_subject_len
            .unwrap_or(self.policy.max_subject_len);
        check_subject(&csr.subject, max_len)?;
        let sans = subject_alt_names(kind, &csr.subject, &constraints.sans)?;

        if let Some(existing) = self.storage.load_cert(network, kind, &csr.subject).await?
            && !self.storage.is_revoked(network, &existing.fingerprint).await?
        {
            return Err(TrellisError::already_exists(format!(
                "{} certificate for '{}' already issued in network '{}'",
                kind, csr.subject, network
            ))
            .with_info("fingerprint", existing.fingerprint));
        }

        let ca = self.get_or_create_ca(network).await?;
        let cert_pem = self.sign_leaf(&ca, kind, &csr.subject, &sans, csr_pem)?;
        let info = x509::cert_info(&cert_pem)?;

        let record = CertRecord {
            network: network.to_string(),
            kind,
            subject: csr.subject.clone(),
            cert_pem,
            serial: info.serial,
            fingerprint: info.fingerprint,
            issued: now_millis(),
        };
        let stored = self.storage.store_cert(record).await?;

        metrics::counter!("trellis_pki_certs_issued_total", "kind" => kind.as_str()).increment(1);
        info!(network, %kind, subject = %stored.subject, serial = %stored.serial, "Certificate issued");
        Ok(stored)
    }

    fn sign_leaf(
        &self,
        ca: &CaRecord,
        kind: CertKind,
        subject: &str,
        sans: &[String],
        csr_pem: &str,
    ) -> Result<String> {
        let ca_key = KeyPair::from_pem(&ca.key_pem).map_err(rcgen_error("load CA key"))?;
        let issuer = CertificateParams::from_ca_cert_pem(&ca.cert_pem)
            .map_err(rcgen_error("load CA certificate"))?
            .self_signed(&ca_key)
            .map_err(rcgen_error("rebuild CA issuer"))?;

        let mut csr =
            CertificateSigningRequestParams::from_pem(csr_pem).map_err(|e| {
                TrellisError::bad_argument(format!("invalid CSR: {}", e))
            })?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, subject);
        params.distinguished_name = dn;
        params.subject_alt_names = sans
            .iter()
            .map(|san| {
                san.as_str()
                    .try_into()
                    .map(SanType::DnsName)
                    .map_err(|_| TrellisError::bad_argument(format!("invalid SAN '{}'", san)))
            })
            .collect::<Result<Vec<_>>>()?;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = match kind {
            CertKind::Host => vec![
                ExtendedKeyUsagePurpose::ServerAuth,
                ExtendedKeyUsagePurpose::ClientAuth,
            ],
            CertKind::User => vec![ExtendedKeyUsagePurpose::ClientAuth],
        };
        params.serial_number = Some(random_serial());
        params.use_authority_key_identifier_extension = true;
        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + self.policy.cert_validity;
        csr.params = params;

        let cert = csr
            .signed_by(&issuer, &ca_key)
            .map_err(rcgen_error("sign certificate"))?;
        Ok(cert.pem())
    }

    /// Capability allowing the holder to have exactly `subject` signed
    pub async fn issue_capability(
        &self,
        network: &str,
        subject: &str,
        kind: CertKind,
    ) -> Result<SigningCapability> {
        check_subject(subject, self.policy.max_subject_len)?;
        let ca = self.get_or_create_ca(network).await?;
        SigningCapability::seal(
            &ca.cap_secret,
            network,
            subject,
            kind,
            self.policy.capability_ttl,
            now_millis(),
        )
    }

    pub async fn verify_capability(&self, cap: &SigningCapability) -> Result<()> {
        let ca = self
            .storage
            .load_ca(&cap.network)
            .await?
            .ok_or_else(|| TrellisError::auth_deny("capability names an unknown network"))?;
        cap.verify(&ca.cap_secret, now_millis())
    }

    /// Sign a CSR under a capability; the CSR subject must be the
    /// capability's subject.
    pub async fn sign_with_capability(
        &self,
        cap: &SigningCapability,
        csr_pem: &str,
        constraints: &SignConstraints,
    ) -> Result<CertRecord> {
        self.verify_capability(cap).await?;
        let csr = x509::parse_csr(csr_pem)?;
        if csr.subject != cap.subject {
            warn!(
                network = %cap.network,
                granted = %cap.subject,
                requested = %csr.subject,
                "CSR subject outside capability scope"
            );
            return Err(TrellisError::auth_deny(format!(
                "capability does not allow signing '{}'",
                csr.subject
            ))
            .with_info("subject", cap.subject.clone()));
        }
        self.sign_csr(&cap.network, cap.kind, csr_pem, constraints)
            .await
    }

    /// Add `cert_pem` to the network's revocation list
    pub async fn revoke(&self, network: &str, cert_pem: &str) -> Result<RevokedCert> {
        let ca = self.storage.load_ca(network).await?.ok_or_else(|| {
            TrellisError::not_found(format!("network '{}' has no certificate authority", network))
        })?;
        // expired certificates are still revocable
        let info = x509::verify_signed_by(cert_pem, &ca.cert_pem)?;

        let revoked = self
            .storage
            .store_revocation(RevokedCert {
                network: network.to_string(),
                fingerprint: info.fingerprint,
                serial: info.serial,
                subject: info.subject,
                revoked: now_millis(),
            })
            .await?;
        metrics::counter!("trellis_pki_certs_revoked_total").increment(1);
        info!(network, subject = %revoked.subject, serial = %revoked.serial, "Certificate revoked");
        Ok(revoked)
    }

    /// Validate a certificate against the network CA and revocation list
    pub async fn validate(&self, network: &str, cert_pem: &str) -> Result<CertInfo> {
        let ca = self.storage.load_ca(network).await?.ok_or_else(|| {
            TrellisError::bad_cert(format!("network '{}' has no certificate authority", network))
        })?;
        let info = x509::verify_issued_by(cert_pem, &ca.cert_pem)?;
        if self.storage.is_revoked(network, &info.fingerprint).await? {
            debug!(network, subject = %info.subject, "Rejected revoked certificate");
            return Err(TrellisError::revoked(format!(
                "certificate for '{}' has been revoked",
                info.subject
            ))
            .with_info("serial", info.serial));
        }
        Ok(info)
    }

    pub async fn list_revocations(&self, network: &str) -> Result<Vec<RevokedCert>> {
        self.storage.list_revocations(network).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::DEFAULT_MAX_SUBJECT_LEN;
    use crate::storage::MemoryCaStorage;
    use crate::x509::build_csr;
    use trellis_common::ErrorKind;

    fn authority() -> CertAuthority {
        CertAuthority::new(Arc::new(MemoryCaStorage::new()), CertPolicy::default())
    }

    async fn issue(ca: &CertAuthority, subject: &str) -> Result<CertRecord> {
        let (csr, _key) = build_csr(subject)?;
        ca.sign_csr("example", CertKind::Host, &csr, &SignConstraints::default())
            .await
    }

    #[tokio::test]
    async fn test_ca_created_once() {
        let ca = authority();
        let first = ca.get_or_create_ca("example").await.unwrap();
        let second = ca.get_or_create_ca("example").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(x509::cert_info(&first.cert_pem).unwrap().subject, "example");
        assert_eq!(first.cap_secret.len(), 64);
    }

    #[tokio::test]
    async fn test_issued_cert_validates() {
        let ca = authority();
        let cert = issue(&ca, "00.svc").await.unwrap();
        let info = ca.validate("example", &cert.cert_pem).await.unwrap();
        assert_eq!(info.subject, "00.svc");
        assert_eq!(info.issuer, "example");
        assert_eq!(info.fingerprint, cert.fingerprint);
        assert_eq!(
            ca.get_cert("example", CertKind::Host, "00.svc").await.unwrap(),
            cert
        );
    }

    #[tokio::test]
    async fn test_subject_bound_checked_before_signing() {
        let ca = authority();
        let boundary = "a".repeat(DEFAULT_MAX_SUBJECT_LEN);
        assert!(issue(&ca, &boundary).await.is_ok());

        let over = "a".repeat(DEFAULT_MAX_SUBJECT_LEN + 1);
        let err = issue(&ca, &over).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadArgument);
        assert!(
            ca.get_cert("example", CertKind::Host, &over)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_duplicate_subject_requires_revocation() {
        let ca = authority();
        let first = issue(&ca, "api").await.unwrap();
        let err = issue(&ca, "api").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AlreadyExists);

        ca.revoke("example", &first.cert_pem).await.unwrap();
        let second = issue(&ca, "api").await.unwrap();
        assert_ne!(first.fingerprint, second.fingerprint);
    }

    #[tokio::test]
    async fn test_revoked_is_distinct_from_bad_cert() {
        let ca = authority();
        let revoked = issue(&ca, "api").await.unwrap();
        let kept = issue(&ca, "web").await.unwrap();

        ca.revoke("example", &revoked.cert_pem).await.unwrap();
        let err = ca.validate("example", &revoked.cert_pem).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Revoked);
        assert!(ca.validate("example", &kept.cert_pem).await.is_ok());
        assert_eq!(ca.list_revocations("example").await.unwrap().len(), 1);

        // a certificate from another network's CA
        let (csr, _) = build_csr("api").unwrap();
        let foreign = ca
            .sign_csr("other", CertKind::Host, &csr, &SignConstraints::default())
            .await
            .unwrap();
        let err = ca.validate("example", &foreign.cert_pem).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadCert);
        let err = ca.validate("example", "garbage").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadCert);
    }

    #[tokio::test]
    async fn test_capability_is_scoped_to_subject() {
        let ca = authority();
        let cap = ca
            .issue_capability("example", "00.svc", CertKind::Host)
            .await
            .unwrap();

        let (other_csr, _) = build_csr("01.svc").unwrap();
        let err = ca
            .sign_with_capability(&cap, &other_csr, &SignConstraints::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthDeny);

        let (csr, _) = build_csr("00.svc").unwrap();
        let cert = ca
            .sign_with_capability(&cap, &csr, &SignConstraints::default())
            .await
            .unwrap();
        assert_eq!(cert.subject, "00.svc");
        assert_eq!(cert.kind, CertKind::Host);
    }

    #[tokio::test]
    async fn test_user_cert_rejects_sans() {
        let ca = authority();
        let (csr, _) = build_csr("alice").unwrap();
        let err = ca
            .sign_csr(
                "example",
                CertKind::User,
                &csr,
                &SignConstraints::with_sans(vec!["alice.example".to_string()]),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadArgument);

        let cert = ca
            .sign_csr("example", CertKind::User, &csr, &SignConstraints::default())
            .await
            .unwrap();
        assert!(ca.validate("example", &cert.cert_pem).await.is_ok());
    }
}
