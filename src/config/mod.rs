//! Configuration module for the gateway
//!
//! All settings come from environment variables (flat keys, e.g. `PORT`,
//! `DATABASE_URL`, `ADMIN_TOKEN`) layered over built-in defaults.

use config::{Config, ConfigError, Environment};
use serde::Deserialize;

/// Fixed prefix of every bearer token minted by this gateway.
pub const TOKEN_PREFIX: &str = "gwk_";

/// Flat view of the recognized environment keys.
#[derive(Debug, Deserialize)]
struct RawSettings {
    host: String,
    port: u16,
    #[serde(default)]
    database_url: Option<String>,
    sqlite_path: String,
    #[serde(default)]
    openai_api_key: Option<String>,
    #[serde(default)]
    anthropic_api_key: Option<String>,
    #[serde(default)]
    admin_token: Option<String>,
    rate_limit_max: u32,
    rate_limit_window_ms: u64,
    default_daily_requests: i64,
    default_daily_tokens: i64,
    default_monthly_spend_cap_usd: Option<f64>,
    log_level: String,
    log_prompts: bool,
}

/// Main application settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub providers: ProvidersSettings,
    pub admin: AdminSettings,
    pub rate_limit: RateLimitSettings,
    pub quota_defaults: QuotaDefaults,
    pub logging: LoggingSettings,
}

/// HTTP server configuration
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Persistence backend selection
#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    /// Server backend connection string; when set it wins over SQLite.
    pub url: Option<String>,
    /// Embedded backend path, used when `url` is absent.
    pub sqlite_path: String,
}

/// Upstream provider configuration
#[derive(Debug, Clone)]
pub struct ProvidersSettings {
    pub openai: ProviderSettings,
    pub anthropic: ProviderSettings,
    /// Token-bucket refill rate towards each upstream, per process.
    pub rate_limit_per_minute: u32,
    pub retry_attempts: u32,
}

/// Per-upstream settings: credential, endpoint, allowlisted models.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub api_key: Option<String>,
    pub base_url: String,
    pub default_model: String,
    pub models: Vec<String>,
}

impl ProviderSettings {
    pub fn is_configured(&self) -> bool {
        self.api_key.as_deref().map(|k| !k.is_empty()).unwrap_or(false)
    }
}

/// Operator token guarding the admin surface
#[derive(Debug, Clone)]
pub struct AdminSettings {
    pub token: String,
}

/// Global admission rate limit (per key prefix, else per source IP)
#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub max: u32,
    pub window_ms: u64,
}

/// Quota row defaults applied when an admin creates a user
#[derive(Debug, Clone)]
pub struct QuotaDefaults {
    pub daily_requests: i64,
    pub daily_tokens: i64,
    pub monthly_spend_cap_usd: Option<f64>,
    pub max_concurrent_requests: i64,
}

/// Logging behavior
#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: String,
    /// When false, message contents never reach the logs.
    pub log_prompts: bool,
}

impl Settings {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let raw: RawSettings = Config::builder()
            .set_default("host", "0.0.0.0")?
            .set_default("port", 3100)?
            .set_default("sqlite_path", "gateway.db")?
            .set_default("rate_limit_max", 60)?
            .set_default("rate_limit_window_ms", 60_000)?
            .set_default("default_daily_requests", 1000)?
            .set_default("default_daily_tokens", 100_000)?
            .set_default("default_monthly_spend_cap_usd", 50.0)?
            .set_default("log_level", "info")?
            .set_default("log_prompts", false)?
            .add_source(Environment::default().try_parsing(true))
            .build()?
            .try_deserialize()?;

        let admin_token = raw
            .admin_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ConfigError::Message("ADMIN_TOKEN is required".into()))?;
        if admin_token.len() < 16 {
            return Err(ConfigError::Message(
                "ADMIN_TOKEN must be at least 16 characters".into(),
            ));
        }
        if raw.rate_limit_max == 0 || raw.rate_limit_window_ms == 0 {
            return Err(ConfigError::Message(
                "RATE_LIMIT_MAX and RATE_LIMIT_WINDOW_MS must be positive".into(),
            ));
        }
        if let Some(ref db_url) = raw.database_url {
            if !db_url.is_empty() {
                url::Url::parse(db_url)
                    .map_err(|e| ConfigError::Message(format!("Invalid DATABASE_URL: {}", e)))?;
            }
        }

        Ok(Settings {
            server: ServerSettings {
                host: raw.host,
                port: raw.port,
            },
            database: DatabaseSettings {
                url: raw.database_url.filter(|u| !u.is_empty()),
                sqlite_path: raw.sqlite_path,
            },
            providers: ProvidersSettings {
                openai: ProviderSettings {
                    api_key: raw.openai_api_key.filter(|k| !k.is_empty()),
                    base_url: "https://api.openai.com".to_string(),
                    default_model: "gpt-4o-mini".to_string(),
                    models: vec![
                        "gpt-4o".to_string(),
                        "gpt-4o-mini".to_string(),
                        "gpt-4.1".to_string(),
                        "gpt-4.1-mini".to_string(),
                    ],
                },
                anthropic: ProviderSettings {
                    api_key: raw.anthropic_api_key.filter(|k| !k.is_empty()),
                    base_url: "https://api.anthropic.com".to_string(),
                    default_model: "claude-3-5-haiku-latest".to_string(),
                    models: vec![
                        "claude-3-5-haiku-latest".to_string(),
                        "claude-sonnet-4-20250514".to_string(),
                        "claude-opus-4-20250514".to_string(),
                    ],
                },
                rate_limit_per_minute: 300,
                retry_attempts: 3,
            },
            admin: AdminSettings { token: admin_token },
            rate_limit: RateLimitSettings {
                max: raw.rate_limit_max,
                window_ms: raw.rate_limit_window_ms,
            },
            quota_defaults: QuotaDefaults {
                daily_requests: raw.default_daily_requests,
                daily_tokens: raw.default_daily_tokens,
                monthly_spend_cap_usd: raw.default_monthly_spend_cap_usd,
                max_concurrent_requests: 4,
            },
            logging: LoggingSettings {
                level: raw.log_level,
                log_prompts: raw.log_prompts,
            },
        })
    }

    /// True when at least one upstream credential is present.
    pub fn any_provider_configured(&self) -> bool {
        self.providers.openai.is_configured() || self.providers.anthropic.is_configured()
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    /// Settings for in-process tests: in-memory SQLite, providers pointed
    /// at unreachable endpoints until a test overrides them.
    pub fn test_settings() -> Settings {
        Settings {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            database: DatabaseSettings {
                url: None,
                sqlite_path: ":memory:".to_string(),
            },
            providers: ProvidersSettings {
                openai: ProviderSettings {
                    api_key: Some("test-openai-key".to_string()),
                    base_url: "http://127.0.0.1:1".to_string(),
                    default_model: "gpt-4o-mini".to_string(),
                    models: vec!["gpt-4o".to_string(), "gpt-4o-mini".to_string()],
                },
                anthropic: ProviderSettings {
                    api_key: None,
                    base_url: "http://127.0.0.1:1".to_string(),
                    default_model: "claude-3-5-haiku-latest".to_string(),
                    models: vec!["claude-3-5-haiku-latest".to_string()],
                },
                rate_limit_per_minute: 600,
                retry_attempts: 1,
            },
            admin: AdminSettings {
                token: "test-admin-token-0123456789".to_string(),
            },
            rate_limit: RateLimitSettings {
                max: 10_000,
                window_ms: 60_000,
            },
            quota_defaults: QuotaDefaults {
                daily_requests: 1000,
                daily_tokens: 100_000,
                monthly_spend_cap_usd: Some(50.0),
                max_concurrent_requests: 4,
            },
            logging: LoggingSettings {
                level: "debug".to_string(),
                log_prompts: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_without_key_is_not_configured() {
        let mut settings = test_support::test_settings();
        assert!(settings.providers.openai.is_configured());
        assert!(settings.any_provider_configured());
        settings.providers.openai.api_key = None;
        assert!(!settings.providers.openai.is_configured());
        assert!(!settings.any_provider_configured());
    }
}
