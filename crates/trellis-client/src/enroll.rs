//! Enrollment through a provisioning URL
//!
//! Redeems the one-time URL, generates a key pair locally and has the
//! network CA sign it. The private key never leaves the process.

use serde_json::json;
use tracing::info;
use trellis_common::{CertRecord, TrellisError, UrlInfo};
use trellis_pki::build_csr;

use crate::error::Result;
use crate::http::{HttpClientConfig, TrellisHttpClient};
use crate::model::{Redemption, SignRequest};

/// Trust material of an enrolled process
#[derive(Clone, Debug)]
pub struct Enrollment {
    pub redemption: Redemption,
    pub cert: CertRecord,
    pub key_pem: String,
}

impl Enrollment {
    /// Client of the registries named in the redemption, authenticated
    /// with the token minted for this principal
    pub fn registry_client(&self) -> Result<TrellisHttpClient> {
        let mut config = HttpClientConfig::with_servers(self.redemption.registry_urls());
        if let Some(token) = &self.redemption.token {
            config = config.with_token(token.clone());
        }
        TrellisHttpClient::new(config)
    }
}

/// Split a provisioning URL into its listener base and ticket iden
fn split_ticket_url(url: &str) -> Result<(String, String)> {
    let info = UrlInfo::parse(url)?;
    let iden = info.path.trim_matches('/');
    if iden.is_empty() || iden.contains('/') {
        return Err(TrellisError::bad_argument(format!(
            "'{}' is not a provisioning url",
            url
        ))
        .into());
    }
    Ok((
        format!("{}://{}", info.scheme, info.authority()),
        iden.to_string(),
    ))
}

pub struct EnrollClient {
    http: TrellisHttpClient,
    iden: String,
}

impl EnrollClient {
    pub fn new(provision_url: &str) -> Result<Self> {
        let (base, iden) = split_ticket_url(provision_url)?;
        let http = TrellisHttpClient::new(HttpClientConfig::new(&base))?;
        Ok(Self { http, iden })
    }

    /// Consume the ticket
    pub async fn redeem(&self) -> Result<Redemption> {
        self.http
            .post_json(&format!("/{}", self.iden), &json!({}))
            .await
    }

    /// Sign a freshly generated key for the redemption's subject
    pub async fn sign(
        &self,
        redemption: &Redemption,
        sans: Vec<String>,
    ) -> Result<(CertRecord, String)> {
        let (csr, key_pem) = build_csr(&redemption.capability.subject)?;
        let request = SignRequest {
            capability: redemption.capability.clone(),
            csr,
            sans,
        };
        let cert: CertRecord = self.http.post_json("/sign", &request).await?;
        Ok((cert, key_pem))
    }

    pub async fn enroll(&self, sans: Vec<String>) -> Result<Enrollment> {
        let redemption = self.redeem().await?;
        let (cert, key_pem) = self.sign(&redemption, sans).await?;
        info!(
            network = %redemption.network,
            subject = %cert.subject,
            serial = %cert.serial,
            "Enrolled"
        );
        Ok(Enrollment {
            redemption,
            cert,
            key_pem,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_common::ErrorKind;

    #[test]
    fn test_split_ticket_url() {
        let (base, iden) =
            split_ticket_url("https://10.0.0.9:27492/0123456789abcdef0123456789abcdef").unwrap();
        assert_eq!(base, "https://10.0.0.9:27492");
        assert_eq!(iden, "0123456789abcdef0123456789abcdef");
    }

    #[test]
    fn test_rejects_url_without_iden() {
        for url in ["http://10.0.0.9:27492/", "http://10.0.0.9:27492/a/b", "not a url"] {
            let err = split_ticket_url(url).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::BadArgument, "{url}");
        }
    }
}
