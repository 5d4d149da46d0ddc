//! Provider integrations for LLM upstreams
//!
//! Two upstream shapes are supported: OpenAI chat completions and Anthropic
//! messages. The router normalizes a unified request onto either and their
//! responses back into one envelope.

pub mod anthropic;
pub mod http_client;
pub mod openai;
pub mod router;
pub mod traits;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;
pub use router::{ProviderCatalogEntry, ProviderRouter, ProviderTag};
pub use traits::{
    CompletionEnvelope, CompletionRequest, LlmProvider, Message, ProviderError, ProviderKind,
    ProviderResult, ResponseFormat, Role,
};
