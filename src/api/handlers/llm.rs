//! LLM completion endpoints
//!
//! The admitted path: validate -> admit -> dispatch -> record. Recording
//! runs on success and failure alike; the concurrency slot is released
//! inside the quota engine.

use actix_web::{web, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use utoipa::ToSchema;

use crate::api::error::ApiError;
use crate::api::middleware::AuthContextExt;
use crate::db::models::UsageStatus;
use crate::providers::{
    CompletionRequest, Message, ProviderCatalogEntry, ProviderTag, ResponseFormat,
};
use crate::quota::{QuotaStatus, UsageEvent};
use crate::Gateway;

const MAX_MESSAGES: usize = 100;
const MAX_CONTENT_CHARS: usize = 100_000;
const MAX_TOKENS_CEILING: i64 = 16_000;

/// Request body for a completion
#[derive(Debug, Deserialize, ToSchema)]
pub struct CompleteRequest {
    /// Upstream selection; omitted or `auto` picks the first configured.
    pub provider: Option<ProviderTag>,
    /// Must be on the selected provider's allowlist when present.
    pub model: Option<String>,
    pub messages: Vec<Message>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<i64>,
    pub response_format: Option<ResponseFormat>,
}

impl CompleteRequest {
    fn validate(&self) -> Result<(), ApiError> {
        if self.messages.is_empty() {
            return Err(ApiError::Validation("messages must not be empty".to_string()));
        }
        if self.messages.len() > MAX_MESSAGES {
            return Err(ApiError::Validation(format!(
                "messages must contain at most {} entries",
                MAX_MESSAGES
            )));
        }
        for (index, message) in self.messages.iter().enumerate() {
            if message.content.chars().take(MAX_CONTENT_CHARS + 1).count() > MAX_CONTENT_CHARS {
                return Err(ApiError::Validation(format!(
                    "messages[{}].content exceeds {} characters",
                    index, MAX_CONTENT_CHARS
                )));
            }
        }
        if let Some(temperature) = self.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(ApiError::Validation(
                    "temperature must be between 0 and 2".to_string(),
                ));
            }
        }
        if let Some(max_tokens) = self.max_tokens {
            if !(1..=MAX_TOKENS_CEILING).contains(&max_tokens) {
                return Err(ApiError::Validation(format!(
                    "max_tokens must be between 1 and {}",
                    MAX_TOKENS_CEILING
                )));
            }
        }
        Ok(())
    }
}

/// Token usage block in the response envelope
#[derive(Debug, Serialize, ToSchema)]
pub struct UsageInfo {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
}

/// Successful completion response
#[derive(Debug, Serialize, ToSchema)]
pub struct CompleteResponse {
    pub id: String,
    pub provider: String,
    pub model: String,
    pub content: String,
    pub usage: UsageInfo,
    pub finish_reason: String,
}

/// Available providers and their models
#[derive(Debug, Serialize, ToSchema)]
pub struct ModelsResponse {
    pub providers: Vec<ProviderCatalogEntry>,
}

/// POST /v1/llm/complete - broker one chat completion
#[utoipa::path(
    post,
    path = "/v1/llm/complete",
    tag = "llm",
    request_body = CompleteRequest,
    responses(
        (status = 200, description = "Normalized completion", body = CompleteResponse),
        (status = 400, description = "Request body shape violated"),
        (status = 401, description = "Missing or unverifiable bearer"),
        (status = 429, description = "Quota or rate limit refusal"),
        (status = 502, description = "Upstream failed after retries")
    ),
    security(("bearer_token" = []))
)]
pub async fn complete(
    gateway: web::Data<Gateway>,
    req: HttpRequest,
    body: web::Json<CompleteRequest>,
) -> Result<HttpResponse, ApiError> {
    let auth = req
        .auth_context()
        .ok_or_else(|| ApiError::Unauthorized("bearer token required".to_string()))?;
    let request_id = auth.request_id.clone();

    body.validate()?;

    if gateway.settings.logging.log_prompts {
        debug!(
            request_id = %request_id,
            messages = ?body.messages,
            "Dispatching completion"
        );
    } else {
        debug!(
            request_id = %request_id,
            message_count = body.messages.len(),
            "Dispatching completion"
        );
    }

    // Admission: first refusal wins, nothing recorded on refusal.
    let in_flight = gateway.engine.admit(&auth.user_id, &request_id).await?;

    let unified = CompletionRequest {
        messages: body.messages.clone(),
        temperature: body.temperature,
        max_tokens: body.max_tokens,
        response_format: body.response_format,
    };

    // Selection failures are post-admission and therefore recorded, with
    // provider/model unknown.
    let (provider, model) = match gateway.router.resolve(body.provider, body.model.as_deref()) {
        Ok(resolved) => resolved,
        Err(e) => {
            let event = UsageEvent::failure(None, None, &short_message(&e.to_string()));
            if let Err(db_err) = gateway.engine.record(in_flight, event).await {
                error!(request_id = %request_id, error = %db_err, "Failed to record refused dispatch");
            }
            return Err(ApiError::from_provider(e, &request_id));
        }
    };

    match provider.complete(&model, &unified).await {
        Ok(envelope) => {
            let event = UsageEvent {
                provider: envelope.provider.clone(),
                model: envelope.model.clone(),
                input_tokens: envelope.input_tokens,
                output_tokens: envelope.output_tokens,
                status: UsageStatus::Success,
                error_message: None,
            };
            // The client already has its answer; a recording failure is an
            // operator problem, not theirs.
            if let Err(db_err) = gateway.engine.record(in_flight, event).await {
                error!(
                    request_id = %request_id,
                    error = %db_err,
                    "Usage recording failed after successful completion"
                );
            }

            info!(
                request_id = %request_id,
                provider = %envelope.provider,
                model = %envelope.model,
                input_tokens = envelope.input_tokens,
                output_tokens = envelope.output_tokens,
                "Completion served"
            );

            Ok(HttpResponse::Ok().json(CompleteResponse {
                id: request_id,
                provider: envelope.provider,
                model: envelope.model,
                content: envelope.content,
                usage: UsageInfo {
                    input_tokens: envelope.input_tokens,
                    output_tokens: envelope.output_tokens,
                    total_tokens: envelope.input_tokens + envelope.output_tokens,
                },
                finish_reason: envelope.finish_reason,
            }))
        }
        Err(e) => {
            let event = UsageEvent::failure(
                Some(provider.kind().as_str()),
                Some(&model),
                &short_message(&e.to_string()),
            );
            if let Err(db_err) = gateway.engine.record(in_flight, event).await {
                error!(request_id = %request_id, error = %db_err, "Failed to record upstream failure");
            }
            error!(request_id = %request_id, error = %e, "Upstream completion failed");
            Err(ApiError::from_provider(e, &request_id))
        }
    }
}

/// GET /v1/llm/models - enumerate providers and allowlisted models
#[utoipa::path(
    get,
    path = "/v1/llm/models",
    tag = "llm",
    responses(
        (status = 200, description = "Configured providers", body = ModelsResponse)
    ),
    security(("bearer_token" = []))
)]
pub async fn models(gateway: web::Data<Gateway>) -> HttpResponse {
    HttpResponse::Ok().json(ModelsResponse {
        providers: gateway.router.catalog(),
    })
}

/// GET /v1/llm/quota - current quota standing for the caller
#[utoipa::path(
    get,
    path = "/v1/llm/quota",
    tag = "llm",
    responses(
        (status = 200, description = "Quota standing", body = QuotaStatus)
    ),
    security(("bearer_token" = []))
)]
pub async fn quota(
    gateway: web::Data<Gateway>,
    req: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    let auth = req
        .auth_context()
        .ok_or_else(|| ApiError::Unauthorized("bearer token required".to_string()))?;
    let status = gateway.engine.inspect(&auth.user_id).await?;
    Ok(HttpResponse::Ok().json(status))
}

fn short_message(message: &str) -> String {
    const MAX: usize = 200;
    if message.len() <= MAX {
        message.to_string()
    } else {
        let mut end = MAX;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message[..end].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::configure_routes;
    use crate::api::test_helpers::seeded_gateway;
    use crate::providers::Role;
    use actix_web::{test, App};
    use httpmock::prelude::*;

    fn user_message(content: &str) -> serde_json::Value {
        serde_json::json!({"role": "user", "content": content})
    }

    fn complete_body(messages: Vec<serde_json::Value>) -> serde_json::Value {
        serde_json::json!({"provider": "auto", "messages": messages})
    }

    async fn openai_success(server: &MockServer) -> httpmock::Mock<'_> {
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(200).json_body(serde_json::json!({
                    "choices": [{
                        "message": {"role": "assistant", "content": "hello!"},
                        "finish_reason": "stop"
                    }],
                    "usage": {"prompt_tokens": 7, "completion_tokens": 5}
                }));
            })
            .await
    }

    fn complete_req(token: &str, body: &serde_json::Value) -> test::TestRequest {
        test::TestRequest::post()
            .uri("/v1/llm/complete")
            .insert_header(("Authorization", format!("Bearer {}", token)))
            .set_json(body)
    }

    fn bearer_get(uri: &str, token: &str) -> test::TestRequest {
        test::TestRequest::get()
            .uri(uri)
            .insert_header(("Authorization", format!("Bearer {}", token)))
    }

    #[actix_web::test]
    async fn happy_path_serves_completion_and_updates_aggregate() {
        let server = MockServer::start_async().await;
        let seeded = seeded_gateway(&server.base_url()).await;
        let app = test::init_service(
            App::new().configure(|cfg| configure_routes(cfg, &seeded.gateway)),
        )
        .await;
        openai_success(&server).await;

        let resp = test::call_service(
            &app,
            complete_req(&seeded.plaintext_key, &complete_body(vec![user_message("hi")]))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["provider"], "openai");
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["content"], "hello!");
        assert_eq!(body["usage"]["total_tokens"], 12);
        assert!(body["id"].is_string());

        // The daily aggregate now reflects exactly this one request.
        let today = crate::quota::today_string();
        let aggregate = seeded
            .gateway
            .aggregates
            .daily(&seeded.user_id, &today)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(aggregate.request_count, 1);
        assert_eq!(aggregate.total_tokens, 12);
    }

    #[actix_web::test]
    async fn missing_bearer_is_unauthorized() {
        let server = MockServer::start_async().await;
        let seeded = seeded_gateway(&server.base_url()).await;
        let app = test::init_service(
            App::new().configure(|cfg| configure_routes(cfg, &seeded.gateway)),
        )
        .await;

        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/v1/llm/complete")
                .set_json(complete_body(vec![user_message("hi")]))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), 401);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "unauthorized");
    }

    #[actix_web::test]
    async fn foreign_token_shape_is_rejected_without_lookup() {
        let server = MockServer::start_async().await;
        let seeded = seeded_gateway(&server.base_url()).await;
        let app = test::init_service(
            App::new().configure(|cfg| configure_routes(cfg, &seeded.gateway)),
        )
        .await;

        let resp = test::call_service(
            &app,
            complete_req(
                "sk-notours0123456789012345678901234",
                &complete_body(vec![user_message("hi")]),
            )
            .to_request(),
        )
        .await;
        assert_eq!(resp.status(), 401);
    }

    #[actix_web::test]
    async fn validation_boundaries() {
        let server = MockServer::start_async().await;
        let seeded = seeded_gateway(&server.base_url()).await;
        let app = test::init_service(
            App::new().configure(|cfg| configure_routes(cfg, &seeded.gateway)),
        )
        .await;

        // Empty messages.
        let resp = test::call_service(
            &app,
            complete_req(&seeded.plaintext_key, &complete_body(vec![])).to_request(),
        )
        .await;
        assert_eq!(resp.status(), 400);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "validation_error");

        // 101 messages.
        let many = (0..101).map(|_| user_message("x")).collect();
        let resp = test::call_service(
            &app,
            complete_req(&seeded.plaintext_key, &complete_body(many)).to_request(),
        )
        .await;
        assert_eq!(resp.status(), 400);

        // Oversized content.
        let resp = test::call_service(
            &app,
            complete_req(
                &seeded.plaintext_key,
                &complete_body(vec![user_message(&"x".repeat(100_001))]),
            )
            .to_request(),
        )
        .await;
        assert_eq!(resp.status(), 400);

        // Out-of-range temperature and max_tokens.
        for body in [
            serde_json::json!({"messages": [user_message("hi")], "temperature": -0.01}),
            serde_json::json!({"messages": [user_message("hi")], "temperature": 2.01}),
            serde_json::json!({"messages": [user_message("hi")], "max_tokens": 0}),
            serde_json::json!({"messages": [user_message("hi")], "max_tokens": 16001}),
        ] {
            let resp = test::call_service(
                &app,
                complete_req(&seeded.plaintext_key, &body).to_request(),
            )
            .await;
            assert_eq!(resp.status(), 400, "body: {}", body);
        }

        // No usage records were written for refused validation.
        let records = seeded
            .gateway
            .usage
            .recent_for_user(&seeded.user_id, 50)
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[actix_web::test]
    async fn disallowed_model_is_rejected_but_recorded() {
        let server = MockServer::start_async().await;
        let seeded = seeded_gateway(&server.base_url()).await;
        let app = test::init_service(
            App::new().configure(|cfg| configure_routes(cfg, &seeded.gateway)),
        )
        .await;

        let body = serde_json::json!({
            "model": "gpt-3.5-turbo",
            "messages": [user_message("hi")]
        });
        let resp = test::call_service(
            &app,
            complete_req(&seeded.plaintext_key, &body).to_request(),
        )
        .await;
        assert_eq!(resp.status(), 400);
        let json: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(json["error"], "model_not_allowed");

        // Admitted, then refused at selection: recorded with provider unknown.
        let records = seeded
            .gateway
            .usage
            .recent_for_user(&seeded.user_id, 10)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].provider, "unknown");
        assert_eq!(records[0].status, crate::db::UsageStatus::Error);
    }

    #[actix_web::test]
    async fn upstream_failure_returns_502_and_is_recorded() {
        let server = MockServer::start_async().await;
        let seeded = seeded_gateway(&server.base_url()).await;
        let app = test::init_service(
            App::new().configure(|cfg| configure_routes(cfg, &seeded.gateway)),
        )
        .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(500).body("upstream exploded");
            })
            .await;

        let resp = test::call_service(
            &app,
            complete_req(&seeded.plaintext_key, &complete_body(vec![user_message("hi")]))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), 502);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "llm_error");
        assert!(body["request_id"].is_string());

        let records = seeded
            .gateway
            .usage
            .recent_for_user(&seeded.user_id, 10)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, crate::db::UsageStatus::Error);
        assert_eq!(records[0].provider, "openai");
        assert_eq!(records[0].model, "gpt-4o-mini");
        assert_eq!(records[0].input_tokens, 0);
        assert!(records[0].error_message.is_some());

        // The failure still counts one request, zero tokens, zero cost.
        let today = crate::quota::today_string();
        let aggregate = seeded
            .gateway
            .aggregates
            .daily(&seeded.user_id, &today)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(aggregate.request_count, 1);
        assert_eq!(aggregate.total_tokens, 0);
        assert!(aggregate.total_cost_usd.abs() < 1e-9);
    }

    #[actix_web::test]
    async fn daily_request_exhaustion_returns_quota_exceeded() {
        let server = MockServer::start_async().await;
        let seeded = seeded_gateway(&server.base_url()).await;
        let app = test::init_service(
            App::new().configure(|cfg| configure_routes(cfg, &seeded.gateway)),
        )
        .await;
        openai_success(&server).await;

        seeded
            .gateway
            .quotas
            .update(
                &seeded.user_id,
                &crate::db::QuotaPatch {
                    daily_requests: Some(3),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        for _ in 0..3 {
            let resp = test::call_service(
                &app,
                complete_req(&seeded.plaintext_key, &complete_body(vec![user_message("hi")]))
                    .to_request(),
            )
            .await;
            assert_eq!(resp.status(), 200);
        }

        let resp = test::call_service(
            &app,
            complete_req(&seeded.plaintext_key, &complete_body(vec![user_message("hi")]))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), 429);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "quota_exceeded");
        assert_eq!(body["dimension"], "daily_requests");
        assert_eq!(body["limit"], 3);
        assert_eq!(body["used"], 3);
        assert!(body["resets_at"].is_string());

        // The refused request wrote no record.
        let records = seeded
            .gateway
            .usage
            .recent_for_user(&seeded.user_id, 50)
            .await
            .unwrap();
        assert_eq!(records.len(), 3);
    }

    #[actix_web::test]
    async fn models_lists_configured_providers() {
        let server = MockServer::start_async().await;
        let seeded = seeded_gateway(&server.base_url()).await;
        let app = test::init_service(
            App::new().configure(|cfg| configure_routes(cfg, &seeded.gateway)),
        )
        .await;

        let resp = test::call_service(
            &app,
            bearer_get("/v1/llm/models", &seeded.plaintext_key).to_request(),
        )
        .await;
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["providers"][0]["provider"], "openai");
    }

    #[actix_web::test]
    async fn quota_endpoint_reports_standing() {
        let server = MockServer::start_async().await;
        let seeded = seeded_gateway(&server.base_url()).await;
        let app = test::init_service(
            App::new().configure(|cfg| configure_routes(cfg, &seeded.gateway)),
        )
        .await;
        openai_success(&server).await;

        test::call_service(
            &app,
            complete_req(&seeded.plaintext_key, &complete_body(vec![user_message("hi")]))
                .to_request(),
        )
        .await;

        let resp = test::call_service(
            &app,
            bearer_get("/v1/llm/quota", &seeded.plaintext_key).to_request(),
        )
        .await;
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["user_id"], serde_json::json!(seeded.user_id));
        assert_eq!(body["daily_requests"]["used"], 1);
        assert_eq!(body["daily_tokens"]["used"], 12);
        assert!(body["monthly_spend"]["cap_usd"].is_number());
    }

    #[actix_web::test]
    async fn global_rate_limit_fires_before_authentication() {
        let mut settings = crate::config::test_support::test_settings();
        settings.rate_limit.max = 2;
        let gateway = crate::api::test_helpers::test_gateway_with(settings).await;
        let app = test::init_service(
            App::new().configure(|cfg| configure_routes(cfg, &gateway)),
        )
        .await;

        // Unauthenticated requests share the source-IP identity. The first
        // two fail authentication; the third never gets that far.
        for _ in 0..2 {
            let resp = test::call_service(
                &app,
                test::TestRequest::get().uri("/v1/llm/models").to_request(),
            )
            .await;
            assert_eq!(resp.status(), 401);
        }
        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri("/v1/llm/models").to_request(),
        )
        .await;
        assert_eq!(resp.status(), 429);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "rate_limit_exceeded");
    }

    #[::std::prelude::v1::test]
    fn validate_accepts_boundary_values() {
        let request = CompleteRequest {
            provider: None,
            model: None,
            messages: vec![Message {
                role: Role::User,
                content: "x".repeat(100_000),
            }],
            temperature: Some(2.0),
            max_tokens: Some(16_000),
            response_format: Some(ResponseFormat::Json),
        };
        assert!(request.validate().is_ok());

        let request = CompleteRequest {
            provider: None,
            model: None,
            messages: vec![Message {
                role: Role::User,
                content: "hi".to_string(),
            }],
            temperature: Some(0.0),
            max_tokens: Some(1),
            response_format: None,
        };
        assert!(request.validate().is_ok());
    }
}
