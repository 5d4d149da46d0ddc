//! Persistence layer
//!
//! Typed repositories over a dialect-neutral query driver. Two backends:
//! PostgreSQL (DATABASE_URL) for production, embedded SQLite otherwise.

pub mod driver;
pub mod keys;
pub mod migrations;
pub mod models;
pub mod pool;
pub mod usage;
pub mod users;

pub use driver::{Db, SqliteDb};
pub use keys::KeyRepository;
pub use models::{
    ApiKey, DailyAggregate, KeyStatus, UsageRecord, UsageStatus, UsageTotals, User, UserQuota,
    UserStatus,
};
pub use pool::{DbError, DbPool};
pub use usage::{AggregateRepository, UsageRepository};
pub use users::{QuotaPatch, QuotaRepository, UserRepository};

use crate::config::DatabaseSettings;

/// Current wall-clock time as milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Open the backend selected by configuration and bring the schema up to
/// date.
pub async fn connect(settings: &DatabaseSettings) -> Result<Db, DbError> {
    let db = match &settings.url {
        Some(url) => {
            let pool = DbPool::new(url)?;
            pool.test_connection().await?;
            Db::Postgres(pool)
        }
        None => Db::Sqlite(SqliteDb::open(&settings.sqlite_path)?),
    };
    migrations::run(&db).await?;
    Ok(db)
}
