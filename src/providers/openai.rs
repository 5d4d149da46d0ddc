//! OpenAI-compatible upstream integration
//!
//! Speaks the `/v1/chat/completions` wire format. Messages forward as-is;
//! the unified JSON response format maps to the upstream's JSON-object
//! mode.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ProviderSettings;

use super::http_client::RateLimitedClient;
use super::traits::{
    CompletionEnvelope, CompletionRequest, LlmProvider, Message, ProviderError, ProviderKind,
    ProviderResult, ResponseFormat,
};

pub struct OpenAiProvider {
    settings: ProviderSettings,
    client: RateLimitedClient,
    retry_attempts: u32,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<JsonObjectMode>,
}

#[derive(Serialize)]
struct JsonObjectMode {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct Usage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
}

impl OpenAiProvider {
    pub fn new(settings: ProviderSettings, rate_limit_per_minute: u32, retry_attempts: u32) -> Self {
        OpenAiProvider {
            settings,
            client: RateLimitedClient::new(rate_limit_per_minute),
            retry_attempts,
        }
    }

    fn api_key(&self) -> &str {
        self.settings.api_key.as_deref().unwrap_or_default()
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
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
        let body = ChatRequest {
            model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: match request.response_format {
                Some(ResponseFormat::Json) => Some(JsonObjectMode { kind: "json_object" }),
                _ => None,
            },
        };

        let builder = self
            .client
            .post(&format!("{}/v1/chat/completions", self.settings.base_url))
            .bearer_auth(self.api_key())
            .json(&body);

        let response = self
            .client
            .execute_with_retry(builder, self.retry_attempts)
            .await?;
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        let usage = parsed.usage.unwrap_or_default();
        let (content, finish_reason) = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| (c.message.content.unwrap_or_default(), c.finish_reason))
            .unwrap_or((String::new(), None));

        Ok(CompletionEnvelope {
            provider: ProviderKind::OpenAi.as_str().to_string(),
            model: model.to_string(),
            content,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            finish_reason: finish_reason.unwrap_or_else(|| "unknown".to_string()),
        })
    }
}
