//! Per-request span and HTTP metrics
//!
//! Requests carrying `x-request-id` keep that id on their span.

use std::future::{Future, Ready, ready};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use actix_web::{
    Error,
    dev::{Service, ServiceRequest, ServiceResponse, Transform},
};
use tracing::{Instrument, Span, info_span};

pub const X_REQUEST_ID: &str = "x-request-id";

pub struct TracingMiddleware;

impl<S, B> Transform<S, ServiceRequest> for TracingMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = TracingMiddlewareService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(TracingMiddlewareService { service }))
    }
}

pub struct TracingMiddlewareService<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for TracingMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let method = req.method().to_string();
        // route pattern keeps the metric label set bounded
        let route = req
            .match_pattern()
            .unwrap_or_else(|| req.path().to_string());
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("none")
            .to_string();
        let peer_ip = req
            .connection_info()
            .realip_remote_addr()
            .unwrap_or("unknown")
            .to_string();

        let span = info_span!(
            "http_request",
            http.method = %method,
            http.route = %route,
            request_id = %request_id,
            net.peer.ip = %peer_ip,
            http.status_code = tracing::field::Empty,
        );

        let started = Instant::now();
        let fut = self.service.call(req);

        Box::pin(
            async move {
                let res = fut.await?;
                let status = res.status().as_u16();
                Span::current().record("http.status_code", status);
                crate::metrics::record_http_request(
                    &method,
                    &route,
                    status,
                    started.elapsed().as_secs_f64(),
                );
                if status >= 500 {
                    tracing::warn!(status, "Request failed");
                } else {
                    tracing::debug!(status, "Request served");
                }
                Ok(res)
            }
            .instrument(span),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{App, HttpResponse, test, web};

    #[actix_web::test]
    async fn test_passes_responses_through() {
        let app = test::init_service(
            App::new()
                .wrap(TracingMiddleware)
                .route("/ping/{id}", web::get().to(|| async { HttpResponse::Accepted().finish() })),
        )
        .await;
        let req = test::TestRequest::get()
            .uri("/ping/7")
            .insert_header((X_REQUEST_ID, "req-1"))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 202);
    }
}
