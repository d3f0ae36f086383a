// HTTP middleware: bearer authentication and request tracing

pub mod auth;
pub mod tracing;

pub use auth::{Authentication, AuthContext, Claims, JwtAuthenticator, Role, require, require_self_or_admin};
pub use self::tracing::TracingMiddleware;
