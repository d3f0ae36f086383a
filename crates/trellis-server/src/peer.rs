//! HTTP transport to consuming services
//!
//! Enrolled services expose a small control surface next to their own API:
//!
//! | Method | Path                       | Body / reply                    |
//! |--------|----------------------------|---------------------------------|
//! | POST   | `/_trellis/call/{method}`  | args → JSON value               |
//! | POST   | `/_trellis/stream/{method}`| args → JSON array, in order     |
//! | GET    | `/_trellis/offset`         | `{"offset": u64}`               |
//! | POST   | `/_trellis/freeze`         | `{"offset": u64}` once drained  |
//! | POST   | `/_trellis/thaw`           | `{}`                            |
//! | POST   | `/_trellis/role`           | `{"leader": name}` → `{}`       |
//!
//! Failures are answered with the `{code, message, info}` error document.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tracing::debug;
use trellis_common::{ErrorInfo, Result, ServiceRecord, TrellisError};
use trellis_registry::{PeerClient, PeerOp, ReplicaControl};

pub const CONTROL_PREFIX: &str = "/_trellis";

#[derive(Deserialize)]
struct Offset {
    offset: u64,
}

pub struct HttpPeerClient {
    client: Client,
}

impl HttpPeerClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| TrellisError::internal(format!("failed to build peer client: {}", e)))?;
        Ok(Self { client })
    }

    fn url(peer: &ServiceRecord, path: &str) -> String {
        let scheme = if peer.urlinfo.scheme == "https" {
            "https"
        } else {
            "http"
        };
        format!(
            "{}://{}{}{}",
            scheme,
            peer.urlinfo.authority(),
            CONTROL_PREFIX,
            path
        )
    }

    async fn send<T: DeserializeOwned>(&self, peer: &ServiceRecord, request: RequestBuilder) -> Result<T> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                TrellisError::timeout(format!("peer '{}' timed out: {}", peer.name, e))
            } else {
                TrellisError::transport(format!("peer '{}' unreachable: {}", peer.name, e))
            }
            .with_info("peer", peer.name.clone())
        })?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| TrellisError::transport(format!("peer '{}': {}", peer.name, e)))?;
        if status.is_success() {
            return Ok(serde_json::from_slice(&body)?);
        }
        match serde_json::from_slice::<ErrorInfo>(&body) {
            Ok(doc) => Err(doc.into()),
            Err(_) => Err(TrellisError::transport(format!(
                "peer '{}' answered {}",
                peer.name, status
            ))
            .with_info("peer", peer.name.clone())),
        }
    }

    async fn post<T: DeserializeOwned>(&self, peer: &ServiceRecord, path: &str, body: &Value) -> Result<T> {
        let url = Self::url(peer, path);
        debug!(peer = %peer.name, %url, "Peer control call");
        self.send(peer, self.client.post(url).json(body)).await
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn call(&self, peer: &ServiceRecord, op: &PeerOp) -> Result<Value> {
        self.post(peer, &format!("/call/{}", op.method), &op.args).await
    }

    async fn stream(
        &self,
        peer: &ServiceRecord,
        op: &PeerOp,
    ) -> Result<BoxStream<'static, Result<Value>>> {
        let items: Vec<Value> = self
            .post(peer, &format!("/stream/{}", op.method), &op.args)
            .await?;
        Ok(stream::iter(items.into_iter().map(Ok)).boxed())
    }
}

#[async_trait]
impl ReplicaControl for HttpPeerClient {
    async fn log_offset(&self, peer: &ServiceRecord) -> Result<u64> {
        let reply: Offset = self
            .send(peer, self.client.get(Self::url(peer, "/offset")))
            .await?;
        Ok(reply.offset)
    }

    async fn freeze(&self, peer: &ServiceRecord) -> Result<u64> {
        let reply: Offset = self.post(peer, "/freeze", &json!({})).await?;
        Ok(reply.offset)
    }

    async fn thaw(&self, peer: &ServiceRecord) -> Result<()> {
        let _: Value = self.post(peer, "/thaw", &json!({})).await?;
        Ok(())
    }

    async fn set_role(&self, peer: &ServiceRecord, leader: &str) -> Result<()> {
        let _: Value = self.post(peer, "/role", &json!({ "leader": leader })).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{App, HttpResponse, HttpServer, web};
    use trellis_common::{ErrorKind, UrlInfo};

    async fn echo(path: web::Path<String>, args: web::Json<Value>) -> HttpResponse {
        match path.as_str() {
            "fail" => HttpResponse::Conflict().json(TrellisError::busy("replica busy").to_info()),
            method => HttpResponse::Ok().json(json!({ "method": method, "args": args.into_inner() })),
        }
    }

    async fn items() -> HttpResponse {
        HttpResponse::Ok().json(json!([1, 2, 3]))
    }

    async fn offset() -> HttpResponse {
        HttpResponse::Ok().json(json!({ "offset": 42 }))
    }

    /// Start a fake replica and return its record
    fn replica() -> ServiceRecord {
        let server = HttpServer::new(|| {
            App::new()
                .route("/_trellis/call/{method}", web::post().to(echo))
                .route("/_trellis/stream/{method}", web::post().to(items))
                .route("/_trellis/offset", web::get().to(offset))
                .route("/_trellis/freeze", web::post().to(offset))
        })
        .workers(1)
        .bind(("127.0.0.1", 0))
        .unwrap();
        let port = server.addrs()[0].port();
        actix_rt::spawn(server.run());
        ServiceRecord::new("example", "db.0", UrlInfo::new("tcp", "127.0.0.1", port))
    }

    #[actix_web::test]
    async fn test_call_and_error_document() {
        let peer = replica();
        let client = HttpPeerClient::new(Duration::from_secs(5)).unwrap();

        let reply = client
            .call(&peer, &PeerOp::new("ping", json!({ "n": 1 })))
            .await
            .unwrap();
        assert_eq!(reply["method"], "ping");
        assert_eq!(reply["args"]["n"], 1);

        let err = client
            .call(&peer, &PeerOp::new("fail", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Busy);
    }

    #[actix_web::test]
    async fn test_stream_and_replica_control() {
        let peer = replica();
        let client = HttpPeerClient::new(Duration::from_secs(5)).unwrap();

        let items: Vec<Value> = client
            .stream(&peer, &PeerOp::new("scan", Value::Null))
            .await
            .unwrap()
            .map(|item| item.unwrap())
            .collect()
            .await;
        assert_eq!(items, vec![json!(1), json!(2), json!(3)]);

        assert_eq!(client.log_offset(&peer).await.unwrap(), 42);
        assert_eq!(client.freeze(&peer).await.unwrap(), 42);
        // the fake replica has no /role route
        assert_eq!(
            client.set_role(&peer, "db.1").await.unwrap_err().kind,
            ErrorKind::Transport
        );
    }

    #[actix_web::test]
    async fn test_unreachable_peer() {
        let peer = ServiceRecord::new("example", "db.9", UrlInfo::new("tcp", "127.0.0.1", 9));
        let client = HttpPeerClient::new(Duration::from_millis(300)).unwrap();
        let err = client.log_offset(&peer).await.unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Transport | ErrorKind::Timeout));
        assert_eq!(err.info["peer"], "db.9");
    }
}
