//! API key database operations
//!
//! Rows only: hashing and token generation live in the key store.

use tracing::{info, warn};

use crate::sql_params;

use super::driver::Db;
use super::models::{ApiKey, KeyStatus};
use super::now_millis;
use super::pool::DbError;

const KEY_COLUMNS: &str =
    "id, user_id, key_hash, key_prefix, label, status, created_at, last_used_at";

/// Repository for API key rows
#[derive(Clone)]
pub struct KeyRepository {
    db: Db,
}

impl KeyRepository {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn insert(&self, key: &ApiKey) -> Result<(), DbError> {
        self.db
            .execute(
                "INSERT INTO api_keys
                 (id, user_id, key_hash, key_prefix, label, status, created_at, last_used_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                sql_params![
                    &key.id,
                    &key.user_id,
                    &key.key_hash,
                    &key.key_prefix,
                    key.label.clone(),
                    key.status.as_str(),
                    key.created_at,
                    key.last_used_at
                ],
            )
            .await?;

        info!(key_id = %key.id, key_prefix = %key.key_prefix, "Created API key");
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<ApiKey>, DbError> {
        let row = self
            .db
            .query_opt(
                &format!("SELECT {} FROM api_keys WHERE id = ?", KEY_COLUMNS),
                sql_params![id],
            )
            .await?;
        row.as_ref().map(ApiKey::from_row).transpose()
    }

    /// All active keys whose stored prefix matches; the verifier checks each
    /// candidate's hash. Revoked keys never come back from here.
    pub async fn active_by_prefix(&self, prefix: &str) -> Result<Vec<ApiKey>, DbError> {
        let rows = self
            .db
            .query(
                &format!(
                    "SELECT {} FROM api_keys WHERE key_prefix = ? AND status = 'active'",
                    KEY_COLUMNS
                ),
                sql_params![prefix],
            )
            .await?;
        rows.iter().map(ApiKey::from_row).collect()
    }

    pub async fn list_by_user(&self, user_id: &str) -> Result<Vec<ApiKey>, DbError> {
        let rows = self
            .db
            .query(
                &format!(
                    "SELECT {} FROM api_keys WHERE user_id = ? ORDER BY created_at DESC",
                    KEY_COLUMNS
                ),
                sql_params![user_id],
            )
            .await?;
        rows.iter().map(ApiKey::from_row).collect()
    }

    /// Update last_used_at after a successful verification.
    pub async fn touch(&self, id: &str) -> Result<(), DbError> {
        self.db
            .execute(
                "UPDATE api_keys SET last_used_at = ? WHERE id = ?",
                sql_params![now_millis(), id],
            )
            .await?;
        Ok(())
    }

    /// Revoke a single key, returning false for a missing key.
    pub async fn revoke(&self, id: &str) -> Result<bool, DbError> {
        let updated = self
            .db
            .execute(
                "UPDATE api_keys SET status = ? WHERE id = ?",
                sql_params![KeyStatus::Revoked.as_str(), id],
            )
            .await?;
        if updated > 0 {
            warn!(key_id = %id, "API key revoked");
        }
        Ok(updated > 0)
    }

    /// Revoke every key belonging to a user (used when suspending).
    pub async fn revoke_for_user(&self, user_id: &str) -> Result<u64, DbError> {
        let updated = self
            .db
            .execute(
                "UPDATE api_keys SET status = ? WHERE user_id = ? AND status = 'active'",
                sql_params![KeyStatus::Revoked.as_str(), user_id],
            )
            .await?;
        if updated > 0 {
            warn!(user_id = %user_id, count = updated, "Revoked all keys for user");
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuotaDefaults;
    use crate::db::driver::SqliteDb;
    use crate::db::migrations;
    use crate::db::users::UserRepository;

    async fn seeded() -> (Db, String) {
        let db = Db::Sqlite(SqliteDb::open(":memory:").unwrap());
        migrations::run(&db).await.unwrap();
        let (user, _) = UserRepository::new(db.clone())
            .create(
                None,
                None,
                &QuotaDefaults {
                    daily_requests: 10,
                    daily_tokens: 1000,
                    monthly_spend_cap_usd: None,
                    max_concurrent_requests: 2,
                },
            )
            .await
            .unwrap();
        (db, user.id)
    }

    fn sample_key(user_id: &str, prefix: &str) -> ApiKey {
        ApiKey {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            key_hash: "$argon2id$v=19$m=19456,t=2,p=1$abc$def".to_string(),
            key_prefix: prefix.to_string(),
            label: Some("test".to_string()),
            status: KeyStatus::Active,
            created_at: now_millis(),
            last_used_at: None,
        }
    }

    #[tokio::test]
    async fn prefix_lookup_excludes_revoked_keys() {
        let (db, user_id) = seeded().await;
        let keys = KeyRepository::new(db);

        let key = sample_key(&user_id, "gwk_aaaaaaaa");
        keys.insert(&key).await.unwrap();
        assert_eq!(keys.active_by_prefix("gwk_aaaaaaaa").await.unwrap().len(), 1);

        assert!(keys.revoke(&key.id).await.unwrap());
        assert!(keys.active_by_prefix("gwk_aaaaaaaa").await.unwrap().is_empty());

        // The row itself remains, marked revoked.
        let loaded = keys.get(&key.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, KeyStatus::Revoked);
    }

    #[tokio::test]
    async fn revoke_for_user_hits_all_active_keys() {
        let (db, user_id) = seeded().await;
        let keys = KeyRepository::new(db);

        keys.insert(&sample_key(&user_id, "gwk_11111111")).await.unwrap();
        keys.insert(&sample_key(&user_id, "gwk_22222222")).await.unwrap();

        assert_eq!(keys.revoke_for_user(&user_id).await.unwrap(), 2);
        for key in keys.list_by_user(&user_id).await.unwrap() {
            assert_eq!(key.status, KeyStatus::Revoked);
        }
        // Second pass is a no-op.
        assert_eq!(keys.revoke_for_user(&user_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn touch_sets_last_used() {
        let (db, user_id) = seeded().await;
        let keys = KeyRepository::new(db);
        let key = sample_key(&user_id, "gwk_33333333");
        keys.insert(&key).await.unwrap();

        keys.touch(&key.id).await.unwrap();
        let loaded = keys.get(&key.id).await.unwrap().unwrap();
        assert!(loaded.last_used_at.is_some());
    }
}
