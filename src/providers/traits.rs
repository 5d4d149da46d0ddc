//! Provider trait definitions for LLM upstreams
//!
//! This module defines the contract both upstream integrations implement,
//! plus the unified request and response shapes the gateway exposes to its
//! callers. Each provider (OpenAI, Anthropic) adapts these to its own wire
//! format.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Provider error types
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Upstream API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Rate limited, retry after {retry_after_secs} seconds")]
    RateLimited { retry_after_secs: u64 },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("No provider available")]
    NoProviderAvailable,

    #[error("Model not allowed: {model}")]
    ModelNotAllowed { model: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ProviderError {
    /// Whether a retry can help: rate limits, transport faults, timeouts,
    /// and 5xx responses. Other 4xx are terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::RateLimited { .. } => true,
            ProviderError::Http(_) => true,
            ProviderError::Timeout(_) => true,
            ProviderError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Result type for provider operations
pub type ProviderResult<T> = Result<T, ProviderError>;

// ============================================================================
// Unified Request / Response Shapes
// ============================================================================

/// Which upstream a request is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
        }
    }
}

/// Chat message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One chat message
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

/// Requested output shape. JSON mode maps to the OpenAI JSON-object mode
/// and is a no-op on Anthropic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    Text,
    Json,
}

/// The unified, already-validated completion request handed to a provider.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<i64>,
    pub response_format: Option<ResponseFormat>,
}

/// Uniform response envelope across both upstreams.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionEnvelope {
    pub provider: String,
    pub model: String,
    /// First textual completion; empty if the upstream produced no text.
    pub content: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    /// Upstream value passed through; `unknown` if absent.
    pub finish_reason: String,
}

// ============================================================================
// Provider Trait
// ============================================================================

/// Contract implemented by each upstream integration.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Which upstream this is.
    fn kind(&self) -> ProviderKind;

    /// Lightweight model used when the caller does not name one.
    fn default_model(&self) -> &str;

    /// Static allowlist of models this gateway will forward to.
    fn models(&self) -> &[String];

    /// Perform one completion against the upstream. Retries and rate
    /// limiting happen inside; the caller sees only the terminal result.
    async fn complete(
        &self,
        model: &str,
        request: &CompletionRequest,
    ) -> ProviderResult<CompletionEnvelope>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_status_class() {
        assert!(ProviderError::Api { status: 500, message: String::new() }.is_retryable());
        assert!(ProviderError::Api { status: 503, message: String::new() }.is_retryable());
        assert!(ProviderError::RateLimited { retry_after_secs: 1 }.is_retryable());
        assert!(!ProviderError::Api { status: 400, message: String::new() }.is_retryable());
        assert!(!ProviderError::ModelNotAllowed { model: "x".into() }.is_retryable());
    }

    #[test]
    fn roles_deserialize_lowercase() {
        let msg: Message = serde_json::from_str(r#"{"role":"user","content":"hi"}"#).unwrap();
        assert_eq!(msg.role, Role::User);
        assert!(serde_json::from_str::<Message>(r#"{"role":"tool","content":"x"}"#).is_err());
    }
}
