//! Anthropic-compatible upstream integration
//!
//! Speaks the `/v1/messages` wire format. The single system message is
//! lifted into the request's `system` field; `max_tokens` is mandatory on
//! this upstream, so a default applies when the caller omits it. The
//! unified JSON response format is a no-op here; callers are responsible
//! for prompt-level JSON discipline.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ProviderSettings;

use super::http_client::RateLimitedClient;
use super::traits::{
    CompletionEnvelope, CompletionRequest, LlmProvider, ProviderError, ProviderKind,
    ProviderResult, Role,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";
/// Applied when the caller leaves max_tokens unset.
const DEFAULT_MAX_TOKENS: i64 = 1024;

pub struct AnthropicProvider {
    settings: ProviderSettings,
    client: RateLimitedClient,
    retry_attempts: u32,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: i64,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    usage: Option<Usage>,
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Default)]
struct Usage {
    #[serde(default)]
    input_tokens: i64,
    #[serde(default)]
    output_tokens: i64,
}

impl AnthropicProvider {
    pub fn new(settings: ProviderSettings, rate_limit_per_minute: u32, retry_attempts: u32) -> Self {
        AnthropicProvider {
            settings,
            client: RateLimitedClient::new(rate_limit_per_minute),
            retry_attempts,
        }
    }

    fn api_key(&self) -> &str {
        self.settings.api_key.as_deref().unwrap_or_default()
    }

    /// Split out the system message. More than one is a caller error.
    fn split_system(request: &CompletionRequest) -> ProviderResult<(Option<&str>, Vec<WireMessage<'_>>)> {
        let mut system = None;
        let mut wire = Vec::with_capacity(request.messages.len());

        for message in &request.messages {
            match message.role {
                Role::System => {
                    if system.is_some() {
                        return Err(ProviderError::InvalidRequest(
                            "at most one system message is supported".to_string(),
                        ));
                    }
                    system = Some(message.content.as_str());
                }
                Role::User => wire.push(WireMessage {
                    role: "user",
                    content: &message.content,
                }),
                Role::Assistant => wire.push(WireMessage {
                    role: "assistant",
                    content: &message.content,
                }),
            }
        }

        Ok((system, wire))
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn default_model(&self) -> &str {
        &self.settings.default_model
    }

    fn models(&self) -> &[String] {
        &self.settings.models
    }

    async fn complete(
        &self,
        model: &str,
        request: &CompletionRequest,
    ) -> ProviderResult<CompletionEnvelope> {
        let (system, messages) = Self::split_system(request)?;
        let body = MessagesRequest {
            model,
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages,
            system,
            temperature: request.temperature,
        };

        let builder = self
            .client
            .post(&format!("{}/v1/messages", self.settings.base_url))
            .header("x-api-key", self.api_key())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body);

        let response = self
            .client
            .execute_with_retry(builder, self.retry_attempts)
            .await?;
        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        let usage = parsed.usage.unwrap_or_default();
        let content = parsed
            .content
            .into_iter()
            .find(|block| block.kind == "text")
            .map(|block| block.text)
            .unwrap_or_default();

        Ok(CompletionEnvelope {
            provider: ProviderKind::Anthropic.as_str().to_string(),
            model: model.to_string(),
            content,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            finish_reason: parsed.stop_reason.unwrap_or_else(|| "unknown".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::traits::Message;
    use httpmock::prelude::*;

    fn provider(base_url: String) -> AnthropicProvider {
        AnthropicProvider::new(
            ProviderSettings {
                api_key: Some("sk-ant-test".to_string()),
                base_url,
                default_model: "claude-3-5-haiku-latest".to_string(),
                models: vec!["claude-3-5-haiku-latest".to_string()],
            },
            600,
            1,
        )
    }

    fn message(role: Role, content: &str) -> Message {
        Message {
            role,
            content: content.to_string(),
        }
    }

    #[tokio::test]
    async fn lifts_system_message_into_field() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/messages")
                    .header("x-api-key", "sk-ant-test")
                    .header("anthropic-version", ANTHROPIC_VERSION)
                    .json_body_partial(
                        r#"{"system":"be terse","messages":[{"role":"user","content":"hi"}]}"#,
                    );
                then.status(200).json_body(serde_json::json!({
                    "content": [{"type": "text", "text": "ok"}],
                    "usage": {"input_tokens": 12, "output_tokens": 3},
                    "stop_reason": "end_turn"
                }));
            })
            .await;

        let request = CompletionRequest {
            messages: vec![
                message(Role::System, "be terse"),
                message(Role::User, "hi"),
            ],
            temperature: None,
            max_tokens: Some(256),
            response_format: None,
        };
        let envelope = provider(server.base_url())
            .complete("claude-3-5-haiku-latest", &request)
            .await
            .unwrap();
        mock.assert_async().await;

        assert_eq!(envelope.provider, "anthropic");
        assert_eq!(envelope.content, "ok");
        assert_eq!(envelope.input_tokens, 12);
        assert_eq!(envelope.output_tokens, 3);
        assert_eq!(envelope.finish_reason, "end_turn");
    }

    #[tokio::test]
    async fn two_system_messages_are_rejected_before_dispatch() {
        let request = CompletionRequest {
            messages: vec![
                message(Role::System, "one"),
                message(Role::System, "two"),
                message(Role::User, "hi"),
            ],
            temperature: None,
            max_tokens: None,
            response_format: None,
        };
        // No server needed; the request never leaves the process.
        let err = provider("http://127.0.0.1:1".to_string())
            .complete("claude-3-5-haiku-latest", &request)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn missing_max_tokens_gets_default() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/messages")
                    .json_body_partial(r#"{"max_tokens":1024}"#);
                then.status(200).json_body(serde_json::json!({
                    "content": [{"type": "text", "text": "hi"}],
                    "usage": {"input_tokens": 1, "output_tokens": 1}
                }));
            })
            .await;

        let request = CompletionRequest {
            messages: vec![message(Role::User, "hi")],
            temperature: None,
            max_tokens: None,
            response_format: None,
        };
        let envelope = provider(server.base_url())
            .complete("claude-3-5-haiku-latest", &request)
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(envelope.finish_reason, "unknown");
    }
}
