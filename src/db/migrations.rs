//! Versioned schema migrations
//!
//! The schema is identical in shape on both backends; only the column type
//! names differ. The applied version is recorded in `schema_version`; a
//! binary that finds a version newer than it knows refuses to start.

use tracing::info;

use super::driver::Db;
use super::pool::DbError;

struct Migration {
    version: i64,
    postgres: &'static [&'static str],
    sqlite: &'static [&'static str],
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    postgres: &[
        "CREATE TABLE users (
            id TEXT PRIMARY KEY,
            email TEXT UNIQUE,
            name TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL
        )",
        "CREATE TABLE api_keys (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            key_hash TEXT NOT NULL,
            key_prefix TEXT NOT NULL,
            label TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            created_at BIGINT NOT NULL,
            last_used_at BIGINT
        )",
        "CREATE INDEX idx_api_keys_prefix ON api_keys (key_prefix)",
        "CREATE INDEX idx_api_keys_user ON api_keys (user_id)",
        "CREATE TABLE user_quotas (
            user_id TEXT PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
            daily_requests BIGINT NOT NULL,
            daily_tokens BIGINT NOT NULL,
            monthly_spend_cap_usd DOUBLE PRECISION,
            max_concurrent_requests BIGINT NOT NULL,
            updated_at BIGINT NOT NULL
        )",
        "CREATE TABLE usage_records (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            request_id TEXT NOT NULL UNIQUE,
            provider TEXT NOT NULL,
            model TEXT NOT NULL,
            input_tokens BIGINT NOT NULL,
            output_tokens BIGINT NOT NULL,
            cost_estimate_usd DOUBLE PRECISION NOT NULL,
            latency_ms BIGINT NOT NULL,
            status TEXT NOT NULL,
            error_message TEXT,
            created_at BIGINT NOT NULL
        )",
        "CREATE INDEX idx_usage_user ON usage_records (user_id)",
        "CREATE INDEX idx_usage_user_created ON usage_records (user_id, created_at)",
        "CREATE TABLE daily_aggregates (
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            date TEXT NOT NULL,
            request_count BIGINT NOT NULL DEFAULT 0,
            total_tokens BIGINT NOT NULL DEFAULT 0,
            total_cost_usd DOUBLE PRECISION NOT NULL DEFAULT 0,
            PRIMARY KEY (user_id, date)
        )",
    ],
    sqlite: &[
        "CREATE TABLE users (
            id TEXT PRIMARY KEY,
            email TEXT UNIQUE,
            name TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        "CREATE TABLE api_keys (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            key_hash TEXT NOT NULL,
            key_prefix TEXT NOT NULL,
            label TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            created_at INTEGER NOT NULL,
            last_used_at INTEGER
        )",
        "CREATE INDEX idx_api_keys_prefix ON api_keys (key_prefix)",
        "CREATE INDEX idx_api_keys_user ON api_keys (user_id)",
        "CREATE TABLE user_quotas (
            user_id TEXT PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
            daily_requests INTEGER NOT NULL,
            daily_tokens INTEGER NOT NULL,
            monthly_spend_cap_usd REAL,
            max_concurrent_requests INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        "CREATE TABLE usage_records (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            request_id TEXT NOT NULL UNIQUE,
            provider TEXT NOT NULL,
            model TEXT NOT NULL,
            input_tokens INTEGER NOT NULL,
            output_tokens INTEGER NOT NULL,
            cost_estimate_usd REAL NOT NULL,
            latency_ms INTEGER NOT NULL,
            status TEXT NOT NULL,
            error_message TEXT,
            created_at INTEGER NOT NULL
        )",
        "CREATE INDEX idx_usage_user ON usage_records (user_id)",
        "CREATE INDEX idx_usage_user_created ON usage_records (user_id, created_at)",
        "CREATE TABLE daily_aggregates (
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            date TEXT NOT NULL,
            request_count INTEGER NOT NULL DEFAULT 0,
            total_tokens INTEGER NOT NULL DEFAULT 0,
            total_cost_usd REAL NOT NULL DEFAULT 0,
            PRIMARY KEY (user_id, date)
        )",
    ],
}];

/// Apply all pending migrations. Fails if the recorded schema version is
/// newer than this binary understands.
pub async fn run(db: &Db) -> Result<(), DbError> {
    db.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version BIGINT NOT NULL)",
        vec![],
    )
    .await?;

    let current = db
        .query_opt("SELECT version FROM schema_version", vec![])
        .await?
        .map(|row| row.get_i64("version"))
        .transpose()?
        .unwrap_or(0);

    let latest = MIGRATIONS.last().map(|m| m.version).unwrap_or(0);
    if current > latest {
        return Err(DbError::Migration(format!(
            "database schema version {} is newer than this binary supports ({})",
            current, latest
        )));
    }

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        let ddl = match db {
            Db::Postgres(_) => migration.postgres,
            Db::Sqlite(_) => migration.sqlite,
        };
        let mut statements: Vec<(String, Vec<super::driver::SqlParam>)> = ddl
            .iter()
            .map(|sql| (sql.to_string(), vec![]))
            .collect();
        statements.push(("DELETE FROM schema_version".to_string(), vec![]));
        statements.push((
            format!("INSERT INTO schema_version (version) VALUES ({})", migration.version),
            vec![],
        ));
        db.execute_tx(statements).await?;
        info!(version = migration.version, "Applied schema migration");
    }

    Ok(())
}
