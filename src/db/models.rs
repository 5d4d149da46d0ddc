//! Database row models for users, keys, quotas, and usage

use serde::{Deserialize, Serialize};

use super::driver::SqlRow;
use super::pool::DbError;

/// User account status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Suspended,
    Deleted,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Active => "active",
            UserStatus::Suspended => "suspended",
            UserStatus::Deleted => "deleted",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "suspended" => UserStatus::Suspended,
            "deleted" => UserStatus::Deleted,
            _ => UserStatus::Active,
        }
    }
}

/// API key status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Active,
    Revoked,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Active => "active",
            KeyStatus::Revoked => "revoked",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "revoked" => KeyStatus::Revoked,
            _ => KeyStatus::Active,
        }
    }
}

/// Database model for a user
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub status: UserStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

impl User {
    pub fn is_active(&self) -> bool {
        self.status == UserStatus::Active
    }

    pub fn from_row(row: &SqlRow) -> Result<Self, DbError> {
        Ok(User {
            id: row.get_string("id")?,
            email: row.get_opt_string("email")?,
            name: row.get_opt_string("name")?,
            status: UserStatus::from_str(&row.get_string("status")?),
            created_at: row.get_i64("created_at")?,
            updated_at: row.get_i64("updated_at")?,
        })
    }
}

/// Database model for an API key. The plaintext never appears here; only
/// the verifier hash and the non-secret lookup prefix are stored.
#[derive(Debug, Clone)]
pub struct ApiKey {
    pub id: String,
    pub user_id: String,
    pub key_hash: String,
    pub key_prefix: String,
    pub label: Option<String>,
    pub status: KeyStatus,
    pub created_at: i64,
    pub last_used_at: Option<i64>,
}

impl ApiKey {
    pub fn from_row(row: &SqlRow) -> Result<Self, DbError> {
        Ok(ApiKey {
            id: row.get_string("id")?,
            user_id: row.get_string("user_id")?,
            key_hash: row.get_string("key_hash")?,
            key_prefix: row.get_string("key_prefix")?,
            label: row.get_opt_string("label")?,
            status: KeyStatus::from_str(&row.get_string("status")?),
            created_at: row.get_i64("created_at")?,
            last_used_at: row.get_opt_i64("last_used_at")?,
        })
    }
}

/// Per-user quota limits, 1:1 with users
#[derive(Debug, Clone, Serialize)]
pub struct UserQuota {
    pub user_id: String,
    pub daily_requests: i64,
    pub daily_tokens: i64,
    /// None means unlimited monthly spend.
    pub monthly_spend_cap_usd: Option<f64>,
    pub max_concurrent_requests: i64,
    pub updated_at: i64,
}

impl UserQuota {
    pub fn from_row(row: &SqlRow) -> Result<Self, DbError> {
        Ok(UserQuota {
            user_id: row.get_string("user_id")?,
            daily_requests: row.get_i64("daily_requests")?,
            daily_tokens: row.get_i64("daily_tokens")?,
            monthly_spend_cap_usd: row.get_opt_f64("monthly_spend_cap_usd")?,
            max_concurrent_requests: row.get_i64("max_concurrent_requests")?,
            updated_at: row.get_i64("updated_at")?,
        })
    }
}

/// Outcome of a completed request, as recorded in the usage log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageStatus {
    Success,
    Error,
}

impl UsageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageStatus::Success => "success",
            UsageStatus::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "error" => UsageStatus::Error,
            _ => UsageStatus::Success,
        }
    }
}

/// Append-only usage record, one per admitted request
#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub id: String,
    pub user_id: String,
    pub request_id: String,
    pub provider: String,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_estimate_usd: f64,
    pub latency_ms: i64,
    pub status: UsageStatus,
    pub error_message: Option<String>,
    pub created_at: i64,
}

impl UsageRecord {
    pub fn from_row(row: &SqlRow) -> Result<Self, DbError> {
        Ok(UsageRecord {
            id: row.get_string("id")?,
            user_id: row.get_string("user_id")?,
            request_id: row.get_string("request_id")?,
            provider: row.get_string("provider")?,
            model: row.get_string("model")?,
            input_tokens: row.get_i64("input_tokens")?,
            output_tokens: row.get_i64("output_tokens")?,
            cost_estimate_usd: row.get_f64("cost_estimate_usd")?,
            latency_ms: row.get_i64("latency_ms")?,
            status: UsageStatus::from_str(&row.get_string("status")?),
            error_message: row.get_opt_string("error_message")?,
            created_at: row.get_i64("created_at")?,
        })
    }
}

/// Materialized per-(user, day) usage summary
#[derive(Debug, Clone, Serialize)]
pub struct DailyAggregate {
    pub user_id: String,
    pub date: String,
    pub request_count: i64,
    pub total_tokens: i64,
    pub total_cost_usd: f64,
}

impl DailyAggregate {
    pub fn zero(user_id: &str, date: &str) -> Self {
        DailyAggregate {
            user_id: user_id.to_string(),
            date: date.to_string(),
            request_count: 0,
            total_tokens: 0,
            total_cost_usd: 0.0,
        }
    }

    pub fn from_row(row: &SqlRow) -> Result<Self, DbError> {
        Ok(DailyAggregate {
            user_id: row.get_string("user_id")?,
            date: row.get_string("date")?,
            request_count: row.get_i64("request_count")?,
            total_tokens: row.get_i64("total_tokens")?,
            total_cost_usd: row.get_f64("total_cost_usd")?,
        })
    }
}

/// Summed usage over an arbitrary date range
#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageTotals {
    pub request_count: i64,
    pub total_tokens: i64,
    pub total_cost_usd: f64,
}
