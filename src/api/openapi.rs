//! OpenAPI 3.0 specification definition

use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::api::handlers::health::{HealthResponse, ReadyChecks, ReadyResponse};
use crate::api::handlers::llm::{CompleteRequest, CompleteResponse, ModelsResponse, UsageInfo};
use crate::providers::router::{ProviderCatalogEntry, ProviderTag};
use crate::providers::traits::{Message, ResponseFormat, Role};
use crate::quota::{QuotaStatus, QuotaWindow, SpendWindow};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "LLM Gateway API",
        version = "0.1.0",
        description = "Multi-tenant gateway brokering chat completions to LLM providers \
                       with per-user keys, quotas, and usage accounting"
    ),
    servers(
        (url = "/", description = "Current server")
    ),
    tags(
        (name = "system", description = "Health and readiness endpoints"),
        (name = "llm", description = "Authenticated completion endpoints")
    ),
    paths(
        crate::api::handlers::health::health_check,
        crate::api::handlers::health::readiness_check,
        crate::api::handlers::llm::complete,
        crate::api::handlers::llm::models,
        crate::api::handlers::llm::quota,
    ),
    components(
        schemas(
            HealthResponse,
            ReadyResponse,
            ReadyChecks,
            CompleteRequest,
            CompleteResponse,
            UsageInfo,
            ModelsResponse,
            ProviderCatalogEntry,
            ProviderTag,
            Message,
            Role,
            ResponseFormat,
            QuotaStatus,
            QuotaWindow,
            SpendWindow,
        )
    ),
    modifiers(&BearerAuth)
)]
pub struct ApiDoc;

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_token",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("opaque")
                        .build(),
                ),
            );
        }
    }
}
