// Record lookup used by the resolver

use std::sync::Arc;

use async_trait::async_trait;
use trellis_common::ServiceRecord;
use trellis_common::api::API_PREFIX;

use crate::error::Result;
use crate::http::TrellisHttpClient;

/// Source of authoritative service records
#[async_trait]
pub trait RecordLookup: Send + Sync + 'static {
    /// Resolve a name or cluster alias to its current record
    async fn resolve(&self, network: &str, name: &str) -> Result<ServiceRecord>;
}

/// Looks records up through the registry's service API
pub struct HttpRecordLookup {
    http: Arc<TrellisHttpClient>,
}

impl HttpRecordLookup {
    pub fn new(http: Arc<TrellisHttpClient>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl RecordLookup for HttpRecordLookup {
    async fn resolve(&self, network: &str, name: &str) -> Result<ServiceRecord> {
        self.http
            .get(&format!("{}/resolve/{}/{}", API_PREFIX, network, name))
            .await
    }
}
