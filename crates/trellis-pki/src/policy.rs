// Certificate issuance policy

use std::time::Duration;

use trellis_common::{CertKind, Result, TrellisError};

/// Default maximum subject name length in UTF-8 bytes
pub const DEFAULT_MAX_SUBJECT_LEN: usize = 64;

/// Maximum length of one subject alternative name
pub const MAX_SAN_LEN: usize = 253;

/// Authority-wide issuance settings
#[derive(Clone, Debug)]
pub struct CertPolicy {
    pub max_subject_len: usize,
    pub ca_validity: Duration,
    pub cert_validity: Duration,
    /// Lifetime of signing capabilities handed out at redemption
    pub capability_ttl: Duration,
}

impl Default for CertPolicy {
    fn default() -> Self {
        Self {
            max_subject_len: DEFAULT_MAX_SUBJECT_LEN,
            ca_validity: Duration::from_secs(10 * 365 * 24 * 3600),
            cert_validity: Duration::from_secs(365 * 24 * 3600),
            capability_ttl: Duration::from_secs(15 * 60),
        }
    }
}

/// Per-request signing constraints
#[derive(Clone, Debug, Default)]
pub struct SignConstraints {
    /// Overrides the policy's subject bound when set
    pub max_subject_len: Option<usize>,
    /// Extra subject alternative names, host certificates only
    pub sans: Vec<String>,
}

impl SignConstraints {
    pub fn with_sans(sans: Vec<String>) -> Self {
        Self {
            sans,
            ..Default::default()
        }
    }
}

/// Reject subjects the CA must never sign
pub fn check_subject(subject: &str, max_len: usize) -> Result<()> {
    if subject.is_empty() {
        return Err(TrellisError::bad_argument("certificate subject is empty"));
    }
    if subject.len() > max_len {
        return Err(TrellisError::bad_argument(format!(
            "certificate subject is {} bytes, limit is {}",
            subject.len(),
            max_len
        ))
        .with_info("subject_len", subject.len())
        .with_info("max_len", max_len));
    }
    if subject.chars().any(char::is_control) {
        return Err(TrellisError::bad_argument(
            "certificate subject contains control characters",
        ));
    }
    Ok(())
}

/// Subject alternative names for a certificate of `kind`; host certificates
/// always carry the subject itself.
pub fn subject_alt_names(kind: CertKind, subject: &str, extra: &[String]) -> Result<Vec<String>> {
    match kind {
        CertKind::User if !extra.is_empty() => Err(TrellisError::bad_argument(
            "user certificates do not carry subject alternative names",
        )),
        CertKind::User => Ok(Vec::new()),
        CertKind::Host => {
            let mut sans = vec![subject.to_string()];
            for san in extra {
                if san.is_empty() || san.len() > MAX_SAN_LEN || !san.is_ascii() {
                    return Err(TrellisError::bad_argument(format!(
                        "invalid subject alternative name '{}'",
                        san
                    )));
                }
                if !sans.contains(san) {
                    sans.push(san.clone());
                }
            }
            Ok(sans)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_boundary() {
        let limit = DEFAULT_MAX_SUBJECT_LEN;
        assert!(check_subject(&"a".repeat(limit), limit).is_ok());
        let err = check_subject(&"a".repeat(limit + 1), limit).unwrap_err();
        assert_eq!(err.kind, trellis_common::ErrorKind::BadArgument);
    }

    #[test]
    fn test_subject_bound_counts_bytes() {
        // 22 three-byte characters: 22 chars, 66 bytes
        let subject = "\u{4e2d}".repeat(22);
        assert_eq!(subject.chars().count(), 22);
        assert!(check_subject(&subject, 64).is_err());
        assert!(check_subject(&"\u{4e2d}".repeat(21), 64).is_ok());
    }

    #[test]
    fn test_subject_rejects_empty_and_control() {
        assert!(check_subject("", 64).is_err());
        assert!(check_subject("api\n", 64).is_err());
    }

    #[test]
    fn test_host_sans_include_subject() {
        let sans = subject_alt_names(
            CertKind::Host,
            "api",
            &["api.example".to_string(), "api".to_string()],
        )
        .unwrap();
        assert_eq!(sans, vec!["api".to_string(), "api.example".to_string()]);
    }

    #[test]
    fn test_user_sans_rejected() {
        assert!(subject_alt_names(CertKind::User, "alice", &[]).unwrap().is_empty());
        assert!(subject_alt_names(CertKind::User, "alice", &["x".to_string()]).is_err());
    }
}
