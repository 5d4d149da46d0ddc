//! API module - HTTP routes and handlers

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod openapi;

use actix_web::web;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::api::error::ApiError;
use crate::api::middleware::ApiMiddleware;
use crate::api::openapi::ApiDoc;
use crate::Gateway;

/// Configure all API routes. The `/v1/llm` scope carries the bearer
/// pipeline; `/admin` does its own operator-token check; health and docs
/// are public.
pub fn configure_routes(cfg: &mut web::ServiceConfig, gateway: &Gateway) {
    cfg.app_data(web::Data::new(gateway.clone()))
        // Body deserialization failures speak the same error envelope as
        // everything else. The limit leaves headroom for 100 messages of
        // 100k characters.
        .app_data(
            web::JsonConfig::default()
                .limit(48 * 1024 * 1024)
                .error_handler(|err, _req| ApiError::Validation(err.to_string()).into()),
        )
        .service(
            web::scope("/v1/llm")
                .wrap(ApiMiddleware::new(gateway.clone()))
                .route("/complete", web::post().to(handlers::llm::complete))
                .route("/models", web::get().to(handlers::llm::models))
                .route("/quota", web::get().to(handlers::llm::quota)),
        )
        .service(
            web::scope("/admin")
                .route("/users", web::post().to(handlers::admin::create_user))
                .route("/users", web::get().to(handlers::admin::list_users))
                .route("/users/{id}", web::get().to(handlers::admin::get_user))
                .route(
                    "/users/{id}/suspend",
                    web::post().to(handlers::admin::suspend_user),
                )
                .route(
                    "/users/{id}/activate",
                    web::post().to(handlers::admin::activate_user),
                )
                .route(
                    "/users/{id}/keys",
                    web::post().to(handlers::admin::create_key),
                )
                .route(
                    "/users/{id}/quota",
                    web::put().to(handlers::admin::update_quota),
                )
                .route(
                    "/users/{id}/usage",
                    web::get().to(handlers::admin::user_usage),
                )
                .route("/keys/{id}", web::delete().to(handlers::admin::revoke_key)),
        )
        .route("/health", web::get().to(handlers::health::health_check))
        .route(
            "/health/ready",
            web::get().to(handlers::health::readiness_check),
        )
        .service(
            SwaggerUi::new("/swagger-ui/{_:.*}").url("/api-docs/openapi.json", ApiDoc::openapi()),
        );
}
