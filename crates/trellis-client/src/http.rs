//! HTTP client with bearer auth, registry failover and leader redirects
//!
//! Mutations sent to a registry follower come back NotLeader with the
//! leader's address; the client retries once against that leader.

use std::time::Duration;

use parking_lot::RwLock;
use reqwest::{Client, Method, Response};
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, warn};
use trellis_common::{ErrorInfo, ErrorKind, TrellisError};

use crate::error::{ClientError, Result};

/// Configuration for the HTTP client
#[derive(Clone, Debug)]
pub struct HttpClientConfig {
    /// Registry base URLs, e.g. `http://10.0.0.1:8848`
    pub server_addrs: Vec<String>,
    /// Bearer token sent with every request
    pub token: Option<String>,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            server_addrs: vec!["http://127.0.0.1:8848".to_string()],
            token: None,
            connect_timeout_ms: 5000,
            read_timeout_ms: 30000,
        }
    }
}

impl HttpClientConfig {
    pub fn new(server_addr: &str) -> Self {
        Self {
            server_addrs: vec![server_addr.to_string()],
            ..Default::default()
        }
    }

    pub fn with_servers(server_addrs: Vec<String>) -> Self {
        Self {
            server_addrs,
            ..Default::default()
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_timeouts(mut self, connect_ms: u64, read_ms: u64) -> Self {
        self.connect_timeout_ms = connect_ms;
        self.read_timeout_ms = read_ms;
        self
    }
}

pub struct TrellisHttpClient {
    client: Client,
    config: HttpClientConfig,
    current_server_index: RwLock<usize>,
    /// Leader learned from a NotLeader redirect
    leader: RwLock<Option<String>>,
}

impl TrellisHttpClient {
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        if config.server_addrs.is_empty() {
            return Err(TrellisError::bad_argument("no registry address configured").into());
        }
        let client = Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.read_timeout_ms))
            .build()?;

        Ok(Self {
            client,
            config,
            current_server_index: RwLock::new(0),
            leader: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }

    fn current_server(&self) -> String {
        if let Some(leader) = self.leader.read().as_ref() {
            return leader.clone();
        }
        let index = *self.current_server_index.read();
        self.config.server_addrs[index].trim_end_matches('/').to_string()
    }

    fn switch_to_next_server(&self) {
        self.leader.write().take();
        let mut index = self.current_server_index.write();
        *index = (*index + 1) % self.config.server_addrs.len();
        debug!("Switched to server index: {}", *index);
    }

    fn build_url(&self, path: &str) -> String {
        format!("{}{}", self.current_server(), path)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.request::<T, ()>(Method::GET, path, None, None).await
    }

    pub async fn get_with_query<T: DeserializeOwned, Q: Serialize + ?Sized>(
        &self,
        path: &str,
        query: &Q,
    ) -> Result<T> {
        let query = serde_json::to_value(query).map_err(TrellisError::from)?;
        self.request::<T, ()>(Method::GET, path, None, Some(&query)).await
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        self.request(Method::POST, path, Some(body), None).await
    }

    pub async fn put_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        self.request(Method::PUT, path, Some(body), None).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.request::<T, ()>(Method::DELETE, path, None, None).await
    }

    /// Send a request, failing over across registry addresses on transport
    /// errors and following one NotLeader redirect
    async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        query: Option<&serde_json::Value>,
    ) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let max_attempts = self.config.server_addrs.len() + 1;
        let mut last_error = None;
        let mut redirected = false;

        for _ in 0..max_attempts {
            let url = self.build_url(path);
            let mut builder = self.client.request(method.clone(), &url);
            if let Some(token) = &self.config.token {
                builder = builder.bearer_auth(token);
            }
            if let Some(query) = query {
                builder = builder.query(query);
            }
            if let Some(body) = body {
                builder = builder.json(body);
            }

            match builder.send().await {
                Ok(response) => match Self::handle_response(response).await {
                    Err(ClientError::Trellis(e)) if e.kind == ErrorKind::NotLeader && !redirected => {
                        let Some(leader) = e.leader_hint() else {
                            return Err(e.into());
                        };
                        debug!(%url, leader, "Following registry leader redirect");
                        *self.leader.write() = Some(format!("http://{}", leader));
                        redirected = true;
                        last_error = Some(ClientError::Trellis(e));
                    }
                    result => return result,
                },
                Err(e) => {
                    warn!("Request to {} failed: {}, switching to next server", url, e);
                    self.switch_to_next_server();
                    last_error = Some(e.into());
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| TrellisError::transport("all registry servers failed").into()))
    }

    /// Decode a success body, or the error document of a failure
    async fn handle_response<T: DeserializeOwned>(response: Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorInfo>(&body) {
            Ok(doc) => Err(doc.into()),
            Err(_) => Err(ClientError::Status {
                status: status.as_u16(),
                body,
            }),
        }
    }
}
