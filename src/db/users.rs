//! User and quota database operations

use tracing::info;
use uuid::Uuid;

use crate::config::QuotaDefaults;
use crate::sql_params;

use super::driver::Db;
use super::models::{User, UserQuota, UserStatus};
use super::now_millis;
use super::pool::DbError;

/// Repository for user rows
#[derive(Clone)]
pub struct UserRepository {
    db: Db,
}

impl UserRepository {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Create a user together with its default quota row, atomically.
    pub async fn create(
        &self,
        email: Option<String>,
        name: Option<String>,
        defaults: &QuotaDefaults,
    ) -> Result<(User, UserQuota), DbError> {
        let now = now_millis();
        let user = User {
            id: Uuid::new_v4().to_string(),
            email,
            name,
            status: UserStatus::Active,
            created_at: now,
            updated_at: now,
        };
        let quota = UserQuota {
            user_id: user.id.clone(),
            daily_requests: defaults.daily_requests,
            daily_tokens: defaults.daily_tokens,
            monthly_spend_cap_usd: defaults.monthly_spend_cap_usd,
            max_concurrent_requests: defaults.max_concurrent_requests,
            updated_at: now,
        };

        self.db
            .execute_tx(vec![
                (
                    "INSERT INTO users (id, email, name, status, created_at, updated_at)
                     VALUES (?, ?, ?, ?, ?, ?)"
                        .to_string(),
                    sql_params![
                        &user.id,
                        user.email.clone(),
                        user.name.clone(),
                        user.status.as_str(),
                        now,
                        now
                    ],
                ),
                (
                    "INSERT INTO user_quotas
                     (user_id, daily_requests, daily_tokens, monthly_spend_cap_usd,
                      max_concurrent_requests, updated_at)
                     VALUES (?, ?, ?, ?, ?, ?)"
                        .to_string(),
                    sql_params![
                        &quota.user_id,
                        quota.daily_requests,
                        quota.daily_tokens,
                        quota.monthly_spend_cap_usd,
                        quota.max_concurrent_requests,
                        now
                    ],
                ),
            ])
            .await?;

        info!(user_id = %user.id, "Created user");
        Ok((user, quota))
    }

    pub async fn get(&self, id: &str) -> Result<Option<User>, DbError> {
        let row = self
            .db
            .query_opt(
                "SELECT id, email, name, status, created_at, updated_at
                 FROM users WHERE id = ?",
                sql_params![id],
            )
            .await?;
        row.as_ref().map(User::from_row).transpose()
    }

    pub async fn list(&self, offset: i64, limit: i64) -> Result<Vec<User>, DbError> {
        let rows = self
            .db
            .query(
                "SELECT id, email, name, status, created_at, updated_at
                 FROM users ORDER BY created_at DESC LIMIT ? OFFSET ?",
                sql_params![limit, offset],
            )
            .await?;
        rows.iter().map(User::from_row).collect()
    }

    /// Update a user's status, returning false for a missing user.
    pub async fn set_status(&self, id: &str, status: UserStatus) -> Result<bool, DbError> {
        let updated = self
            .db
            .execute(
                "UPDATE users SET status = ?, updated_at = ? WHERE id = ?",
                sql_params![status.as_str(), now_millis(), id],
            )
            .await?;
        Ok(updated > 0)
    }
}

/// Partial quota update; absent fields keep their current value.
#[derive(Debug, Default, Clone)]
pub struct QuotaPatch {
    pub daily_requests: Option<i64>,
    pub daily_tokens: Option<i64>,
    /// `Some(None)` clears the cap to unlimited.
    pub monthly_spend_cap_usd: Option<Option<f64>>,
    pub max_concurrent_requests: Option<i64>,
}

impl QuotaPatch {
    pub fn is_empty(&self) -> bool {
        self.daily_requests.is_none()
            && self.daily_tokens.is_none()
            && self.monthly_spend_cap_usd.is_none()
            && self.max_concurrent_requests.is_none()
    }
}

/// Repository for quota rows
#[derive(Clone)]
pub struct QuotaRepository {
    db: Db,
}

impl QuotaRepository {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn get(&self, user_id: &str) -> Result<Option<UserQuota>, DbError> {
        let row = self
            .db
            .query_opt(
                "SELECT user_id, daily_requests, daily_tokens, monthly_spend_cap_usd,
                        max_concurrent_requests, updated_at
                 FROM user_quotas WHERE user_id = ?",
                sql_params![user_id],
            )
            .await?;
        row.as_ref().map(UserQuota::from_row).transpose()
    }

    /// Apply a partial update, returning the new quota row.
    pub async fn update(
        &self,
        user_id: &str,
        patch: &QuotaPatch,
    ) -> Result<Option<UserQuota>, DbError> {
        let current = match self.get(user_id).await? {
            Some(quota) => quota,
            None => return Ok(None),
        };

        let daily_requests = patch.daily_requests.unwrap_or(current.daily_requests);
        let daily_tokens = patch.daily_tokens.unwrap_or(current.daily_tokens);
        let monthly_cap = match patch.monthly_spend_cap_usd {
            Some(cap) => cap,
            None => current.monthly_spend_cap_usd,
        };
        let max_concurrent = patch
            .max_concurrent_requests
            .unwrap_or(current.max_concurrent_requests);
        let now = now_millis();

        self.db
            .execute(
                "UPDATE user_quotas
                 SET daily_requests = ?, daily_tokens = ?, monthly_spend_cap_usd = ?,
                     max_concurrent_requests = ?, updated_at = ?
                 WHERE user_id = ?",
                sql_params![
                    daily_requests,
                    daily_tokens,
                    monthly_cap,
                    max_concurrent,
                    now,
                    user_id
                ],
            )
            .await?;

        info!(user_id = %user_id, "Updated user quota");
        self.get(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::driver::SqliteDb;
    use crate::db::migrations;

    async fn test_db() -> Db {
        let db = Db::Sqlite(SqliteDb::open(":memory:").unwrap());
        migrations::run(&db).await.unwrap();
        db
    }

    fn defaults() -> QuotaDefaults {
        QuotaDefaults {
            daily_requests: 1000,
            daily_tokens: 100_000,
            monthly_spend_cap_usd: Some(50.0),
            max_concurrent_requests: 4,
        }
    }

    #[tokio::test]
    async fn create_user_creates_quota_row() {
        let db = test_db().await;
        let users = UserRepository::new(db.clone());
        let quotas = QuotaRepository::new(db);

        let (user, quota) = users
            .create(Some("a@example.com".to_string()), None, &defaults())
            .await
            .unwrap();
        assert_eq!(quota.user_id, user.id);
        assert_eq!(quota.daily_requests, 1000);

        let loaded = quotas.get(&user.id).await.unwrap().unwrap();
        assert_eq!(loaded.monthly_spend_cap_usd, Some(50.0));
        assert!(users.get(&user.id).await.unwrap().unwrap().is_active());
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected() {
        let db = test_db().await;
        let users = UserRepository::new(db);
        users
            .create(Some("dup@example.com".to_string()), None, &defaults())
            .await
            .unwrap();
        let err = users
            .create(Some("dup@example.com".to_string()), None, &defaults())
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn quota_patch_clears_monthly_cap() {
        let db = test_db().await;
        let users = UserRepository::new(db.clone());
        let quotas = QuotaRepository::new(db);
        let (user, _) = users.create(None, None, &defaults()).await.unwrap();

        let patch = QuotaPatch {
            monthly_spend_cap_usd: Some(None),
            daily_requests: Some(5),
            ..Default::default()
        };
        let updated = quotas.update(&user.id, &patch).await.unwrap().unwrap();
        assert_eq!(updated.monthly_spend_cap_usd, None);
        assert_eq!(updated.daily_requests, 5);
        assert_eq!(updated.daily_tokens, 100_000);
    }

    #[tokio::test]
    async fn set_status_suspends_user() {
        let db = test_db().await;
        let users = UserRepository::new(db);
        let (user, _) = users.create(None, None, &defaults()).await.unwrap();

        assert!(users
            .set_status(&user.id, UserStatus::Suspended)
            .await
            .unwrap());
        let loaded = users.get(&user.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, UserStatus::Suspended);
        assert!(!users.set_status("missing", UserStatus::Active).await.unwrap());
    }
}
