//! LLM Gateway
//!
//! Multi-tenant HTTP gateway that brokers chat-completion requests to LLM
//! providers on behalf of authenticated end users: per-user bearer keys,
//! request/token/spend quotas, append-only usage accounting, and an
//! operator-token admin surface.

use actix_web::{App, HttpServer};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;

mod api;
mod auth;
mod config;
mod db;
mod providers;
mod quota;

use crate::api::middleware::AdmissionLimiter;
use crate::auth::KeyStore;
use crate::config::Settings;
use crate::db::{
    AggregateRepository, Db, KeyRepository, QuotaRepository, UsageRepository, UserRepository,
};
use crate::providers::ProviderRouter;
use crate::quota::QuotaEngine;

/// Application context threaded through the pipeline. No module globals;
/// everything a handler needs hangs off this.
#[derive(Clone)]
pub struct Gateway {
    pub settings: Settings,
    pub db: Db,
    pub users: UserRepository,
    pub quotas: QuotaRepository,
    pub usage: UsageRepository,
    pub aggregates: AggregateRepository,
    pub key_rows: KeyRepository,
    pub keys: KeyStore,
    pub engine: QuotaEngine,
    pub router: Arc<ProviderRouter>,
    pub admission: Arc<AdmissionLimiter>,
}

impl Gateway {
    pub fn new(settings: Settings, db: Db) -> Self {
        let users = UserRepository::new(db.clone());
        let quotas = QuotaRepository::new(db.clone());
        let usage = UsageRepository::new(db.clone());
        let aggregates = AggregateRepository::new(db.clone());
        let key_rows = KeyRepository::new(db.clone());
        let keys = KeyStore::new(key_rows.clone());
        let engine = QuotaEngine::new(quotas.clone(), aggregates.clone(), usage.clone());
        let router = Arc::new(ProviderRouter::from_settings(&settings.providers));
        let admission = Arc::new(AdmissionLimiter::new(
            settings.rate_limit.max,
            settings.rate_limit.window_ms,
        ));

        Gateway {
            settings,
            db,
            users,
            quotas,
            usage,
            aggregates,
            key_rows,
            keys,
            engine,
            router,
            admission,
        }
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Load environment variables from a .env file if present
    dotenvy::dotenv().ok();

    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    // Structured JSON logging, level driven by LOG_LEVEL
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&settings.logging.level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .init();

    let db = match db::connect(&settings.database).await {
        Ok(db) => db,
        Err(e) => {
            error!(error = %e, "Failed to initialize persistence");
            std::process::exit(1);
        }
    };

    let gateway = Gateway::new(settings.clone(), db);
    if !gateway.router.has_providers() {
        warn!("No upstream provider configured; completion requests will fail");
    }

    let bind_addr = format!("{}:{}", settings.server.host, settings.server.port);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        backend = gateway.db.backend_name(),
        addr = %bind_addr,
        "Starting llm-gateway"
    );

    let app_gateway = gateway.clone();
    HttpServer::new(move || {
        let gateway = app_gateway.clone();
        App::new()
            .wrap(TracingLogger::default())
            .configure(move |cfg| api::configure_routes(cfg, &gateway))
    })
    .workers(num_cpus::get() * 2)
    // Stop accepting, then drain in-flight requests for up to 30s
    .shutdown_timeout(30)
    .bind(&bind_addr)?
    .run()
    .await
}
