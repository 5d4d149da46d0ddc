//! Provider selection
//!
//! Resolves the caller's optional provider tag and model against the set of
//! configured upstreams and their static allowlists.

use serde::{Deserialize, Serialize};

use crate::config::ProvidersSettings;

use super::anthropic::AnthropicProvider;
use super::openai::OpenAiProvider;
use super::traits::{
    CompletionEnvelope, CompletionRequest, LlmProvider, ProviderError, ProviderKind,
    ProviderResult,
};

/// Provider tag as it appears in request bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ProviderTag {
    OpenAi,
    Anthropic,
    Auto,
}

impl ProviderTag {
    fn into_kind(self) -> Option<ProviderKind> {
        match self {
            ProviderTag::OpenAi => Some(ProviderKind::OpenAi),
            ProviderTag::Anthropic => Some(ProviderKind::Anthropic),
            ProviderTag::Auto => None,
        }
    }
}

/// One row of the `/v1/llm/models` listing.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct ProviderCatalogEntry {
    pub provider: String,
    pub default_model: String,
    pub models: Vec<String>,
}

/// Holds the configured upstreams in {openai, anthropic} preference order.
pub struct ProviderRouter {
    providers: Vec<Box<dyn LlmProvider>>,
}

impl ProviderRouter {
    pub fn from_settings(settings: &ProvidersSettings) -> Self {
        let mut providers: Vec<Box<dyn LlmProvider>> = Vec::new();
        if settings.openai.is_configured() {
            providers.push(Box::new(OpenAiProvider::new(
                settings.openai.clone(),
                settings.rate_limit_per_minute,
                settings.retry_attempts,
            )));
        }
        if settings.anthropic.is_configured() {
            providers.push(Box::new(AnthropicProvider::new(
                settings.anthropic.clone(),
                settings.rate_limit_per_minute,
                settings.retry_attempts,
            )));
        }
        ProviderRouter { providers }
    }

    pub fn has_providers(&self) -> bool {
        !self.providers.is_empty()
    }

    /// Pick the upstream and model for a request. `auto` (or no tag) takes
    /// the first configured provider; a named model must be on the selected
    /// provider's allowlist.
    pub fn resolve(
        &self,
        tag: Option<ProviderTag>,
        model: Option<&str>,
    ) -> ProviderResult<(&dyn LlmProvider, String)> {
        let provider = match tag.and_then(ProviderTag::into_kind) {
            None => self
                .providers
                .first()
                .ok_or(ProviderError::NoProviderAvailable)?,
            Some(kind) => self
                .providers
                .iter()
                .find(|p| p.kind() == kind)
                .ok_or(ProviderError::NoProviderAvailable)?,
        };

        let model = match model {
            Some(name) => {
                if provider.models().iter().any(|m| m == name) {
                    name.to_string()
                } else {
                    return Err(ProviderError::ModelNotAllowed {
                        model: name.to_string(),
                    });
                }
            }
            None => provider.default_model().to_string(),
        };

        Ok((provider.as_ref(), model))
    }

    /// Resolve and dispatch in one step.
    pub async fn complete(
        &self,
        tag: Option<ProviderTag>,
        model: Option<&str>,
        request: &CompletionRequest,
    ) -> ProviderResult<CompletionEnvelope> {
        let (provider, model) = self.resolve(tag, model)?;
        provider.complete(&model, request).await
    }

    /// Available providers and their allowlisted models.
    pub fn catalog(&self) -> Vec<ProviderCatalogEntry> {
        self.providers
            .iter()
            .map(|p| ProviderCatalogEntry {
                provider: p.kind().as_str().to_string(),
                default_model: p.default_model().to_string(),
                models: p.models().to_vec(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::test_settings;

    fn router_openai_only() -> ProviderRouter {
        ProviderRouter::from_settings(&test_settings().providers)
    }

    #[test]
    fn auto_selects_first_configured_provider() {
        let router = router_openai_only();
        let (provider, model) = router.resolve(Some(ProviderTag::Auto), None).unwrap();
        assert_eq!(provider.kind(), ProviderKind::OpenAi);
        assert_eq!(model, "gpt-4o-mini");

        let (provider, _) = router.resolve(None, None).unwrap();
        assert_eq!(provider.kind(), ProviderKind::OpenAi);
    }

    #[test]
    fn named_but_unconfigured_provider_is_unavailable() {
        let router = router_openai_only();
        assert!(matches!(
            router.resolve(Some(ProviderTag::Anthropic), None),
            Err(ProviderError::NoProviderAvailable)
        ));
    }

    #[test]
    fn nothing_configured_is_unavailable() {
        let mut settings = test_settings().providers;
        settings.openai.api_key = None;
        settings.anthropic.api_key = None;
        let router = ProviderRouter::from_settings(&settings);
        assert!(!router.has_providers());
        assert!(matches!(
            router.resolve(None, None),
            Err(ProviderError::NoProviderAvailable)
        ));
    }

    #[test]
    fn model_allowlist_is_enforced() {
        let router = router_openai_only();
        let (_, model) = router.resolve(None, Some("gpt-4o")).unwrap();
        assert_eq!(model, "gpt-4o");

        assert!(matches!(
            router.resolve(None, Some("gpt-3.5-turbo")),
            Err(ProviderError::ModelNotAllowed { .. })
        ));
    }

    #[test]
    fn catalog_lists_configured_providers() {
        let catalog = router_openai_only().catalog();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0].provider, "openai");
        assert!(catalog[0].models.contains(&"gpt-4o".to_string()));
    }
}
