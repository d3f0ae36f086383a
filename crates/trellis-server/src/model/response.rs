//! HTTP response types
//!
//! Failures are rendered as the `{code, message, info}` error document with
//! the status of their error kind.

use actix_web::{HttpRequest, HttpResponse, ResponseError, error::JsonPayloadError, http::StatusCode};
use serde::Serialize;
use trellis_common::{ErrorKind, TrellisError};

/// Handler error carrying a typed Trellis error
#[derive(Debug)]
pub struct ApiError(pub TrellisError);

pub type ApiResult<T = HttpResponse> = Result<T, ApiError>;

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<TrellisError> for ApiError {
    fn from(err: TrellisError) -> Self {
        ApiError(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError(TrellisError::internal(err.to_string()))
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.0.kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        if self.0.kind == ErrorKind::Internal || self.0.kind == ErrorKind::Storage {
            tracing::error!(error = %self.0, "Request failed");
        }
        HttpResponse::build(self.status_code()).json(self.0.to_info())
    }
}

/// 200 with a JSON body
pub fn ok<T: Serialize>(body: T) -> ApiResult {
    Ok(HttpResponse::Ok().json(body))
}

/// Acknowledge a mutation without a body of its own
pub fn ok_empty() -> ApiResult {
    Ok(HttpResponse::Ok().json(serde_json::json!({})))
}

/// Malformed request bodies are schema violations
pub fn json_error_handler(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let message = match &err {
        JsonPayloadError::Deserialize(e) => e.to_string(),
        other => other.to_string(),
    };
    ApiError(TrellisError::new(ErrorKind::SchemaViolation, message)).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    #[actix_web::test]
    async fn test_error_document_and_status() {
        let err = ApiError(TrellisError::not_leader(Some("10.0.0.2:8848".to_string())));
        assert_eq!(err.status_code(), StatusCode::MISDIRECTED_REQUEST);

        let body = to_bytes(err.error_response().into_body()).await.unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(doc["code"], "NotLeader");
        assert_eq!(doc["info"]["leader"], "10.0.0.2:8848");
    }

    #[test]
    fn test_status_per_kind() {
        let cases = [
            (TrellisError::not_found("x"), StatusCode::NOT_FOUND),
            (TrellisError::busy("x"), StatusCode::CONFLICT),
            (TrellisError::auth_deny("x"), StatusCode::FORBIDDEN),
            (
                TrellisError::new(ErrorKind::SchemaViolation, "x"),
                StatusCode::BAD_REQUEST,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).status_code(), status);
        }
    }
}
