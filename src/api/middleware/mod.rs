//! API middleware module
//!
//! Authentication and admission rate limiting for the end-user surface.

pub mod auth;
pub mod rate_limit;
pub mod service;

pub use auth::{extract_bearer, rate_limit_identity, AuthContext, AuthContextExt};
pub use rate_limit::AdmissionLimiter;
pub use service::ApiMiddleware;
