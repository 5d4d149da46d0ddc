//! Key store: bearer token lifecycle
//!
//! Tokens look like `gwk_<32 random chars>`. Only an Argon2id verifier hash
//! and the first 12 characters (the lookup prefix) are persisted; the
//! plaintext is returned exactly once, at creation.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use rand::Rng;
use thiserror::Error;
use tracing::warn;

use crate::config::TOKEN_PREFIX;
use crate::db::models::{ApiKey, KeyStatus};
use crate::db::{now_millis, DbError, KeyRepository};

/// Length of the random token body.
const TOKEN_BODY_LEN: usize = 32;
/// Characters stored in the clear as the lookup index.
pub const PREFIX_LEN: usize = 12;

/// Key store errors
#[derive(Debug, Error)]
pub enum KeyStoreError {
    /// Deliberately carries no detail about which check failed.
    #[error("invalid API key")]
    InvalidKey,
    #[error("Database error: {0}")]
    Db(#[from] DbError),
    #[error("Hashing error: {0}")]
    Hash(String),
    #[error("Blocking task error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Returned to the caller exactly once, at creation time.
#[derive(Debug)]
pub struct CreatedKey {
    pub key_id: String,
    pub plaintext: String,
    pub prefix: String,
}

/// Generates, verifies, and revokes opaque bearer tokens.
#[derive(Clone)]
pub struct KeyStore {
    keys: KeyRepository,
}

impl KeyStore {
    pub fn new(keys: KeyRepository) -> Self {
        Self { keys }
    }

    /// Generate a new token plaintext: `gwk_` + 32 chars of [a-zA-Z0-9].
    fn generate_token() -> String {
        const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
        let mut rng = rand::thread_rng();

        let body: String = (0..TOKEN_BODY_LEN)
            .map(|_| {
                let idx = rng.gen_range(0..CHARSET.len());
                CHARSET[idx] as char
            })
            .collect();

        format!("{}{}", TOKEN_PREFIX, body)
    }

    /// Cheap shape check done before any hashing or I/O.
    pub fn looks_like_token(token: &str) -> bool {
        token.len() == TOKEN_PREFIX.len() + TOKEN_BODY_LEN
            && token.starts_with(TOKEN_PREFIX)
            && token[TOKEN_PREFIX.len()..]
                .bytes()
                .all(|b| b.is_ascii_alphanumeric())
    }

    /// Mint a key for a user. The returned plaintext is irrecoverable after
    /// this call; it is never logged or persisted.
    pub async fn create(
        &self,
        user_id: &str,
        label: Option<String>,
    ) -> Result<CreatedKey, KeyStoreError> {
        let plaintext = Self::generate_token();
        let prefix = plaintext[..PREFIX_LEN].to_string();

        let to_hash = plaintext.clone();
        let key_hash = tokio::task::spawn_blocking(move || -> Result<String, KeyStoreError> {
            let salt = SaltString::generate(&mut OsRng);
            Ok(Argon2::default()
                .hash_password(to_hash.as_bytes(), &salt)
                .map_err(|e| KeyStoreError::Hash(e.to_string()))?
                .to_string())
        })
        .await??;

        let key = ApiKey {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            key_hash,
            key_prefix: prefix.clone(),
            label,
            status: KeyStatus::Active,
            created_at: now_millis(),
            last_used_at: None,
        };
        self.keys.insert(&key).await?;

        Ok(CreatedKey {
            key_id: key.id,
            plaintext,
            prefix,
        })
    }

    /// Verify a presented token. On success returns (user_id, key_id) and
    /// updates the key's last_used_at. Every failure mode that is not an
    /// infrastructure fault collapses into the same `InvalidKey`.
    pub async fn verify(&self, token: &str) -> Result<(String, String), KeyStoreError> {
        if !Self::looks_like_token(token) {
            return Err(KeyStoreError::InvalidKey);
        }

        let candidates = self.keys.active_by_prefix(&token[..PREFIX_LEN]).await?;

        for candidate in candidates {
            let hash = candidate.key_hash.clone();
            let presented = token.to_string();
            let matched =
                tokio::task::spawn_blocking(move || match PasswordHash::new(&hash) {
                    Ok(parsed) => Argon2::default()
                        .verify_password(presented.as_bytes(), &parsed)
                        .is_ok(),
                    Err(e) => {
                        // A corrupt hash on one row must not mask a valid
                        // sibling row with the same prefix.
                        warn!(error = %e, "Unparseable key hash, skipping candidate");
                        false
                    }
                })
                .await?;

            if matched {
                self.keys.touch(&candidate.id).await?;
                return Ok((candidate.user_id, candidate.id));
            }
        }

        Err(KeyStoreError::InvalidKey)
    }

    pub async fn revoke(&self, key_id: &str) -> Result<bool, KeyStoreError> {
        Ok(self.keys.revoke(key_id).await?)
    }

    /// Revoke every key of a user (suspension side effect).
    pub async fn revoke_all_for_user(&self, user_id: &str) -> Result<u64, KeyStoreError> {
        Ok(self.keys.revoke_for_user(user_id).await?)
    }
}

/// Constant-time byte comparison for the operator token.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuotaDefaults;
    use crate::db::driver::SqliteDb;
    use crate::db::users::UserRepository;
    use crate::db::{migrations, Db};

    async fn store() -> (KeyStore, String) {
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
        (KeyStore::new(KeyRepository::new(db)), user.id)
    }

    #[test]
    fn token_shape() {
        let token = KeyStore::generate_token();
        assert_eq!(token.len(), 36);
        assert!(token.starts_with("gwk_"));
        assert!(KeyStore::looks_like_token(&token));

        assert!(!KeyStore::looks_like_token("gwk_short"));
        assert!(!KeyStore::looks_like_token(
            "sk-0123456789abcdef0123456789abcdef"
        ));
        assert!(!KeyStore::looks_like_token(""));
    }

    #[tokio::test]
    async fn create_then_verify_round_trip() {
        let (store, user_id) = store().await;
        let created = store.create(&user_id, Some("ci".to_string())).await.unwrap();
        assert_eq!(created.prefix, &created.plaintext[..12]);

        let (verified_user, verified_key) = store.verify(&created.plaintext).await.unwrap();
        assert_eq!(verified_user, user_id);
        assert_eq!(verified_key, created.key_id);
    }

    #[tokio::test]
    async fn random_negatives_are_rejected() {
        let (store, user_id) = store().await;
        let created = store.create(&user_id, None).await.unwrap();

        for _ in 0..8 {
            // Same valid shape, same prefix space, different body.
            let fake = KeyStore::generate_token();
            if fake == created.plaintext {
                continue;
            }
            assert!(matches!(
                store.verify(&fake).await,
                Err(KeyStoreError::InvalidKey)
            ));
        }
    }

    #[tokio::test]
    async fn revoked_key_fails_with_generic_error() {
        let (store, user_id) = store().await;
        let created = store.create(&user_id, None).await.unwrap();
        assert!(store.revoke(&created.key_id).await.unwrap());

        // Prefix still matches a stored row, but verification must not
        // reveal that.
        assert!(matches!(
            store.verify(&created.plaintext).await,
            Err(KeyStoreError::InvalidKey)
        ));
    }

    #[tokio::test]
    async fn two_keys_get_distinct_prefixes() {
        let (store, user_id) = store().await;
        let first = store.create(&user_id, None).await.unwrap();
        let second = store.create(&user_id, None).await.unwrap();
        assert_ne!(first.plaintext, second.plaintext);
        assert_ne!(first.prefix, second.prefix);
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq("operator-token-123", "operator-token-123"));
        assert!(!constant_time_eq("operator-token-123", "operator-token-124"));
        assert!(!constant_time_eq("short", "longer-than-short"));
    }
}
