// Authentication middleware for Actix-web
// Decodes the bearer token once per request and leaves an AuthContext in
// the request extensions; handlers then demand a role through `require`.

use std::sync::Arc;

use actix_service::forward_ready;
use actix_utils::future::{Ready, ok};
use actix_web::{
    Error, HttpMessage, HttpRequest,
    dev::{Service, ServiceRequest, ServiceResponse, Transform},
    http::Method,
};
use futures::future::LocalBoxFuture;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use trellis_common::TrellisError;

use crate::model::ApiError;

const ACCESS_TOKEN: &str = "accessToken";
const AUTHORIZATION_HEADER: &str = "Authorization";
const BEARER_PREFIX: &str = "Bearer ";

/// Principal used for every request when auth is disabled
pub const ANONYMOUS: &str = "anonymous";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Service,
    /// Enrolled user; may only resolve
    User,
}

impl Role {
    /// Admins may call every surface, services every user surface
    pub fn satisfies(self, required: Role) -> bool {
        match self {
            Role::Admin => true,
            Role::Service => required != Role::Admin,
            Role::User => required == Role::User,
        }
    }
}

impl std::str::FromStr for Role {
    type Err = TrellisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "service" => Ok(Role::Service),
            "user" => Ok(Role::User),
            other => Err(TrellisError::bad_argument(format!("unknown role '{}'", other))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Admin user or the service name the token is bound to
    pub sub: String,
    /// Network of an enrolled principal; admin tokens carry none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net: Option<String>,
    pub role: Role,
    pub exp: i64,
}

/// HS256 token codec over a base64 secret
pub struct JwtAuthenticator {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl_seconds: i64,
}

impl JwtAuthenticator {
    pub fn new(secret_base64: &str, ttl_seconds: i64) -> Result<Self, TrellisError> {
        if secret_base64.is_empty() {
            return Err(TrellisError::bad_argument("auth.secret is not configured"));
        }
        let bad_secret = |e: jsonwebtoken::errors::Error| {
            TrellisError::bad_argument(format!("auth.secret is not valid base64: {}", e))
        };
        Ok(Self {
            encoding_key: EncodingKey::from_base64_secret(secret_base64).map_err(bad_secret)?,
            decoding_key: DecodingKey::from_base64_secret(secret_base64).map_err(bad_secret)?,
            ttl_seconds,
        })
    }

    pub fn encode(&self, sub: &str, role: Role) -> Result<String, TrellisError> {
        self.sign(sub, None, role)
    }

    /// Token of an enrolled principal, bound to (`network`, `sub`)
    pub fn encode_scoped(&self, sub: &str, network: &str, role: Role) -> Result<String, TrellisError> {
        self.sign(sub, Some(network), role)
    }

    fn sign(&self, sub: &str, network: Option<&str>, role: Role) -> Result<String, TrellisError> {
        let exp = chrono::Utc::now()
            .checked_add_signed(chrono::Duration::seconds(self.ttl_seconds))
            .unwrap_or_else(chrono::Utc::now)
            .timestamp();
        let claims = Claims {
            sub: sub.to_string(),
            net: network.map(str::to_string),
            role,
            exp,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| TrellisError::internal(format!("failed to sign token: {}", e)))
    }

    pub fn decode(&self, token: &str) -> Result<Claims, TrellisError> {
        decode::<Claims>(token, &self.decoding_key, &Validation::new(Algorithm::HS256))
            .map(|data| data.claims)
            .map_err(|e| TrellisError::auth_deny(format!("invalid token: {}", e)))
    }
}

/// Outcome of token inspection attached to every request
#[derive(Clone, Debug, Default)]
pub struct AuthContext {
    pub claims: Option<Claims>,
    pub token_provided: bool,
    pub error: Option<String>,
    /// Auth is disabled; every caller is an admin
    pub bypass: bool,
}

impl AuthContext {
    fn principal(&self, required: Role) -> Result<Claims, TrellisError> {
        if self.bypass {
            return Ok(Claims {
                sub: ANONYMOUS.to_string(),
                net: None,
                role: Role::Admin,
                exp: i64::MAX,
            });
        }
        let Some(claims) = &self.claims else {
            return Err(match &self.error {
                Some(error) => TrellisError::auth_deny(error.clone()),
                None => TrellisError::auth_deny("missing bearer token"),
            });
        };
        if !claims.role.satisfies(required) {
            return Err(TrellisError::auth_deny(format!(
                "'{}' lacks the {:?} role",
                claims.sub, required
            ))
            .with_info("required", format!("{:?}", required).to_lowercase()));
        }
        Ok(claims.clone())
    }
}

/// Demand `role` from the caller of `req`
pub fn require(req: &HttpRequest, role: Role) -> Result<Claims, ApiError> {
    let extensions = req.extensions();
    let context = extensions
        .get::<AuthContext>()
        .ok_or_else(|| TrellisError::auth_deny("request was not authenticated"))?;
    Ok(context.principal(role)?)
}

/// Demand an admin, or the service token bound to (`network`, `name`)
pub fn require_self_or_admin(
    req: &HttpRequest,
    network: &str,
    name: &str,
) -> Result<Claims, ApiError> {
    let claims = require(req, Role::Service)?;
    if claims.role != Role::Admin
        && (claims.sub != name || claims.net.as_deref() != Some(network))
    {
        return Err(TrellisError::auth_deny(format!(
            "token of '{}' cannot act for '{}/{}'",
            claims.sub, network, name
        ))
        .with_info("network", network)
        .into());
    }
    Ok(claims)
}

/// Authentication middleware transformer; `None` disables auth
pub struct Authentication {
    authenticator: Option<Arc<JwtAuthenticator>>,
}

impl Authentication {
    pub fn new(authenticator: Option<Arc<JwtAuthenticator>>) -> Self {
        Self { authenticator }
    }
}

impl<S, B> Transform<S, ServiceRequest> for Authentication
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = AuthenticationMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(AuthenticationMiddleware {
            service,
            authenticator: self.authenticator.clone(),
        })
    }
}

pub struct AuthenticationMiddleware<S> {
    service: S,
    authenticator: Option<Arc<JwtAuthenticator>>,
}

/// Extract token from request using 3 sources in priority order:
/// 1. `accessToken` HTTP header
/// 2. `Authorization: Bearer <token>` header
/// 3. `accessToken` query parameter
fn extract_token(req: &ServiceRequest) -> Option<String> {
    if let Some(header_val) = req.headers().get(ACCESS_TOKEN)
        && let Ok(s) = header_val.to_str()
    {
        let trimmed = s.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }

    if let Some(header_val) = req.headers().get(AUTHORIZATION_HEADER)
        && let Ok(s) = header_val.to_str()
        && let Some(token) = s.trim().strip_prefix(BEARER_PREFIX)
    {
        let token = token.trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }

    if let Some(query) = req.uri().query() {
        for pair in query.split('&') {
            if let Some((key, value)) = pair.split_once('=')
                && key == ACCESS_TOKEN
                && !value.is_empty()
            {
                return Some(value.to_string());
            }
        }
    }

    None
}

impl<S, B> Service<ServiceRequest> for AuthenticationMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        if Method::OPTIONS != *req.method() {
            let mut auth_context = AuthContext::default();
            match &self.authenticator {
                None => auth_context.bypass = true,
                Some(authenticator) => {
                    if let Some(token) = extract_token(&req) {
                        auth_context.token_provided = true;
                        match authenticator.decode(&token) {
                            Ok(claims) => auth_context.claims = Some(claims),
                            Err(err) => {
                                tracing::debug!(path = req.path(), error = %err, "Rejected token");
                                auth_context.error = Some(err.message);
                            }
                        }
                    }
                }
            }
            req.extensions_mut().insert(auth_context);
        }

        let res = self.service.call(req);
        Box::pin(res)
    }
}
