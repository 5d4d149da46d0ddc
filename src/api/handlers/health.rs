//! Health check endpoints

use actix_web::{web, HttpResponse};
use serde::Serialize;
use utoipa::ToSchema;

use crate::Gateway;

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: String,
}

#[derive(Serialize, ToSchema)]
pub struct ReadyResponse {
    pub status: &'static str,
    pub checks: ReadyChecks,
}

#[derive(Serialize, ToSchema)]
pub struct ReadyChecks {
    pub database: &'static str,
    pub providers: &'static str,
}

/// GET /health - liveness probe
#[utoipa::path(
    get,
    path = "/health",
    tag = "system",
    responses(
        (status = 200, description = "Service is running", body = HealthResponse)
    )
)]
pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok",
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// GET /health/ready - readiness probe
///
/// Ready when persistence answers and at least one upstream is configured.
#[utoipa::path(
    get,
    path = "/health/ready",
    tag = "system",
    responses(
        (status = 200, description = "Ready to serve traffic", body = ReadyResponse),
        (status = 503, description = "One or more checks failing", body = ReadyResponse)
    )
)]
pub async fn readiness_check(gateway: web::Data<Gateway>) -> HttpResponse {
    let database_ok = gateway.db.ping().await.is_ok();
    let providers_ok = gateway.router.has_providers();

    let checks = ReadyChecks {
        database: if database_ok { "ok" } else { "unreachable" },
        providers: if providers_ok { "ok" } else { "none_configured" },
    };

    if database_ok && providers_ok {
        HttpResponse::Ok().json(ReadyResponse {
            status: "ready",
            checks,
        })
    } else {
        HttpResponse::ServiceUnavailable().json(ReadyResponse {
            status: "degraded",
            checks,
        })
    }
}
