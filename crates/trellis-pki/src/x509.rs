// X.509 parsing and verification helpers

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use trellis_common::{Result, TrellisError};
use x509_parser::certificate::X509Certificate;
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::pem::{Pem, parse_x509_pem};
use x509_parser::prelude::FromDer;
use x509_parser::x509::X509Name;

/// Summary of a parsed certificate
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CertInfo {
    pub subject: String,
    pub issuer: String,
    pub serial: String,
    pub fingerprint: String,
    /// Unix seconds
    pub not_before: i64,
    pub not_after: i64,
}

/// Subject of a verified certificate signing request
#[derive(Clone, Debug, PartialEq)]
pub struct CsrInfo {
    pub subject: String,
}

/// SHA-256 of a DER encoding, hex
pub fn fingerprint(der: &[u8]) -> String {
    const_hex::encode(Sha256::digest(der))
}

fn decode_pem(pem: &str, what: &str) -> Result<Pem> {
    let (_, pem) = parse_x509_pem(pem.as_bytes())
        .map_err(|e| TrellisError::bad_cert(format!("invalid {} PEM: {}", what, e)))?;
    Ok(pem)
}

fn common_name(name: &X509Name<'_>) -> Option<String> {
    name.iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
}

/// Parse a certificate PEM and hand the parsed form to `f`
pub fn with_cert<T>(
    pem: &str,
    f: impl FnOnce(&X509Certificate<'_>, &[u8]) -> Result<T>,
) -> Result<T> {
    let pem = decode_pem(pem, "certificate")?;
    let cert = pem
        .parse_x509()
        .map_err(|e| TrellisError::bad_cert(format!("invalid certificate: {}", e)))?;
    f(&cert, &pem.contents)
}

pub fn cert_info(pem: &str) -> Result<CertInfo> {
    with_cert(pem, |cert, der| Ok(info_of(cert, der)))
}

fn info_of(cert: &X509Certificate<'_>, der: &[u8]) -> CertInfo {
    CertInfo {
        subject: common_name(cert.subject()).unwrap_or_default(),
        issuer: common_name(cert.issuer()).unwrap_or_default(),
        serial: const_hex::encode(cert.raw_serial()),
        fingerprint: fingerprint(der),
        not_before: cert.validity().not_before.timestamp(),
        not_after: cert.validity().not_after.timestamp(),
    }
}

/// Verify `cert_pem` carries a signature from `ca_pem`, ignoring validity
pub fn verify_signed_by(cert_pem: &str, ca_pem: &str) -> Result<CertInfo> {
    check_issued(cert_pem, ca_pem, false)
}

/// Verify `cert_pem` was signed by `ca_pem` and is inside its validity window
pub fn verify_issued_by(cert_pem: &str, ca_pem: &str) -> Result<CertInfo> {
    check_issued(cert_pem, ca_pem, true)
}

fn check_issued(cert_pem: &str, ca_pem: &str, check_validity: bool) -> Result<CertInfo> {
    let ca = decode_pem(ca_pem, "CA certificate")?;
    let ca_cert = ca
        .parse_x509()
        .map_err(|e| TrellisError::internal(format!("stored CA certificate is invalid: {}", e)))?;

    with_cert(cert_pem, |cert, der| {
        cert.verify_signature(Some(ca_cert.public_key()))
            .map_err(|_| TrellisError::bad_cert("certificate was not issued by this network's CA"))?;
        if check_validity && !cert.validity().is_valid() {
            return Err(TrellisError::bad_cert("certificate is outside its validity period"));
        }
        Ok(info_of(cert, der))
    })
}

/// Parse a CSR, check its self-signature and extract the subject common name
pub fn parse_csr(csr_pem: &str) -> Result<CsrInfo> {
    let (_, pem) = parse_x509_pem(csr_pem.as_bytes())
        .map_err(|e| TrellisError::bad_argument(format!("invalid CSR PEM: {}", e)))?;
    let (_, csr) = X509CertificationRequest::from_der(&pem.contents)
        .map_err(|e| TrellisError::bad_argument(format!("invalid CSR: {}", e)))?;
    csr.verify_signature()
        .map_err(|_| TrellisError::bad_argument("CSR signature does not verify"))?;
    let subject = common_name(&csr.certification_request_info.subject)
        .ok_or_else(|| TrellisError::bad_argument("CSR has no common name"))?;
    Ok(CsrInfo { subject })
}

/// Generate a fresh key pair and a CSR for `subject`, returning
/// `(csr_pem, key_pem)`
pub fn build_csr(subject: &str) -> Result<(String, String)> {
    let key = KeyPair::generate()
        .map_err(|e| TrellisError::internal(format!("generate key: {}", e)))?;
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, subject);
    params.distinguished_name = dn;
    let csr = params
        .serialize_request(&key)
        .map_err(|e| TrellisError::internal(format!("build CSR: {}", e)))?;
    let csr_pem = csr
        .pem()
        .map_err(|e| TrellisError::internal(format!("encode CSR: {}", e)))?;
    Ok((csr_pem, key.serialize_pem()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csr_round_trip_subject() {
        let (csr_pem, key_pem) = build_csr("00.svc").unwrap();
        assert!(csr_pem.contains("BEGIN CERTIFICATE REQUEST"));
        assert!(key_pem.contains("PRIVATE KEY"));
        assert_eq!(parse_csr(&csr_pem).unwrap().subject, "00.svc");
    }

    #[test]
    fn test_parse_csr_rejects_garbage() {
        let err = parse_csr("-----BEGIN CERTIFICATE REQUEST-----\nAAAA\n-----END CERTIFICATE REQUEST-----\n")
            .unwrap_err();
        assert_eq!(err.kind, trellis_common::ErrorKind::BadArgument);
    }

    #[test]
    fn test_cert_info_rejects_non_pem() {
        let err = cert_info("not a certificate").unwrap_err();
        assert_eq!(err.kind, trellis_common::ErrorKind::BadCert);
    }

    #[test]
    fn test_fingerprint_is_sha256_hex() {
        assert_eq!(
            fingerprint(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
