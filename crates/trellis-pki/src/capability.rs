// Signing capabilities
// A capability authorizes exactly one certificate subject in one network

use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use trellis_common::{CertKind, Result, SigningCapability, TrellisError};

type HmacSha256 = Hmac<Sha256>;

fn keyed(secret_hex: &str) -> Result<HmacSha256> {
    let secret = const_hex::decode(secret_hex)
        .map_err(|e| TrellisError::internal(format!("invalid capability secret: {}", e)))?;
    HmacSha256::new_from_slice(&secret)
        .map_err(|e| TrellisError::internal(format!("invalid capability secret: {}", e)))
}

fn canonical(cap: &SigningCapability) -> String {
    format!(
        "{}\n{}\n{}\n{}\n{}",
        cap.network, cap.subject, cap.kind, cap.expires, cap.nonce
    )
}

/// MAC sealing of [`SigningCapability`] under a network's capability secret
pub trait CapabilitySeal: Sized {
    /// Issue a capability valid for `ttl` from `now_ms`
    fn seal(
        secret_hex: &str,
        network: &str,
        subject: &str,
        kind: CertKind,
        ttl: Duration,
        now_ms: i64,
    ) -> Result<Self>;

    /// Check the MAC and expiry; both failures are AuthDeny
    fn verify(&self, secret_hex: &str, now_ms: i64) -> Result<()>;
}

impl CapabilitySeal for SigningCapability {
    fn seal(
        secret_hex: &str,
        network: &str,
        subject: &str,
        kind: CertKind,
        ttl: Duration,
        now_ms: i64,
    ) -> Result<Self> {
        let mut cap = SigningCapability {
            network: network.to_string(),
            subject: subject.to_string(),
            kind,
            expires: now_ms.saturating_add(ttl.as_millis() as i64),
            nonce: const_hex::encode(rand::random::<[u8; 16]>()),
            mac: String::new(),
        };
        let mut mac = keyed(secret_hex)?;
        mac.update(canonical(&cap).as_bytes());
        cap.mac = const_hex::encode(mac.finalize().into_bytes());
        Ok(cap)
    }

    fn verify(&self, secret_hex: &str, now_ms: i64) -> Result<()> {
        let tag = const_hex::decode(&self.mac)
            .map_err(|_| TrellisError::auth_deny("malformed signing capability"))?;
        let mut mac = keyed(secret_hex)?;
        mac.update(canonical(self).as_bytes());
        mac.verify_slice(&tag)
            .map_err(|_| TrellisError::auth_deny("signing capability does not verify"))?;
        if now_ms >= self.expires {
            return Err(TrellisError::auth_deny("signing capability has expired")
                .with_info("expires", self.expires));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn cap() -> SigningCapability {
        SigningCapability::seal(
            SECRET,
            "example",
            "00.svc",
            CertKind::Host,
            Duration::from_secs(60),
            1_000,
        )
        .unwrap()
    }

    #[test]
    fn test_seal_and_verify() {
        let cap = cap();
        assert_eq!(cap.expires, 61_000);
        cap.verify(SECRET, 2_000).unwrap();
    }

    #[test]
    fn test_tampered_subject_denied() {
        let mut cap = cap();
        cap.subject = "01.svc".to_string();
        let err = cap.verify(SECRET, 2_000).unwrap_err();
        assert_eq!(err.kind, trellis_common::ErrorKind::AuthDeny);
    }

    #[test]
    fn test_wrong_secret_and_expiry_denied() {
        let cap = cap();
        let other = "ff".repeat(32);
        assert!(cap.verify(&other, 2_000).is_err());
        let err = cap.verify(SECRET, 61_000).unwrap_err();
        assert_eq!(err.kind, trellis_common::ErrorKind::AuthDeny);
    }
}
