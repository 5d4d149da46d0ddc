//! Usage record and daily aggregate operations
//!
//! The record insert and the aggregate upsert always travel in one
//! transaction: an aggregate never counts a record that was not persisted,
//! and no record exists without being counted.

use crate::sql_params;

use super::driver::Db;
use super::models::{DailyAggregate, UsageRecord, UsageTotals};
use super::pool::DbError;

const RECORD_COLUMNS: &str = "id, user_id, request_id, provider, model, input_tokens, \
     output_tokens, cost_estimate_usd, latency_ms, status, error_message, created_at";

/// Repository for the append-only usage log
#[derive(Clone)]
pub struct UsageRepository {
    db: Db,
}

impl UsageRepository {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Insert a usage record and fold it into the day's aggregate, atomically.
    /// A duplicate request_id fails the whole transaction.
    pub async fn insert_with_aggregate(
        &self,
        record: &UsageRecord,
        date: &str,
    ) -> Result<(), DbError> {
        let total_tokens = record.input_tokens + record.output_tokens;
        self.db
            .execute_tx(vec![
                (
                    format!(
                        "INSERT INTO usage_records ({})
                         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                        RECORD_COLUMNS
                    ),
                    sql_params![
                        &record.id,
                        &record.user_id,
                        &record.request_id,
                        &record.provider,
                        &record.model,
                        record.input_tokens,
                        record.output_tokens,
                        record.cost_estimate_usd,
                        record.latency_ms,
                        record.status.as_str(),
                        record.error_message.clone(),
                        record.created_at
                    ],
                ),
                (
                    "INSERT INTO daily_aggregates
                     (user_id, date, request_count, total_tokens, total_cost_usd)
                     VALUES (?, ?, 1, ?, ?)
                     ON CONFLICT (user_id, date) DO UPDATE SET
                        request_count = daily_aggregates.request_count + 1,
                        total_tokens = daily_aggregates.total_tokens + excluded.total_tokens,
                        total_cost_usd = daily_aggregates.total_cost_usd + excluded.total_cost_usd"
                        .to_string(),
                    sql_params![
                        &record.user_id,
                        date,
                        total_tokens,
                        record.cost_estimate_usd
                    ],
                ),
            ])
            .await
    }

    /// Most recent records for a user, newest first.
    pub async fn recent_for_user(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<UsageRecord>, DbError> {
        let rows = self
            .db
            .query(
                &format!(
                    "SELECT {} FROM usage_records
                     WHERE user_id = ? ORDER BY created_at DESC LIMIT ?",
                    RECORD_COLUMNS
                ),
                sql_params![user_id, limit],
            )
            .await?;
        rows.iter().map(UsageRecord::from_row).collect()
    }
}

/// Read-side repository for daily aggregates. Writes go exclusively
/// through [`UsageRepository::insert_with_aggregate`].
#[derive(Clone)]
pub struct AggregateRepository {
    db: Db,
}

impl AggregateRepository {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn daily(
        &self,
        user_id: &str,
        date: &str,
    ) -> Result<Option<DailyAggregate>, DbError> {
        let row = self
            .db
            .query_opt(
                "SELECT user_id, date, request_count, total_tokens, total_cost_usd
                 FROM daily_aggregates WHERE user_id = ? AND date = ?",
                sql_params![user_id, date],
            )
            .await?;
        row.as_ref().map(DailyAggregate::from_row).transpose()
    }

    /// Summed usage over an inclusive date range. Dates compare
    /// lexicographically because they are stored as YYYY-MM-DD.
    pub async fn totals_between(
        &self,
        user_id: &str,
        from_date: &str,
        to_date: &str,
    ) -> Result<UsageTotals, DbError> {
        let row = self
            .db
            .query_one(
                "SELECT CAST(COALESCE(SUM(request_count), 0) AS BIGINT) AS request_count,
                        CAST(COALESCE(SUM(total_tokens), 0) AS BIGINT) AS total_tokens,
                        CAST(COALESCE(SUM(total_cost_usd), 0) AS DOUBLE PRECISION) AS total_cost_usd
                 FROM daily_aggregates
                 WHERE user_id = ? AND date >= ? AND date <= ?",
                sql_params![user_id, from_date, to_date],
            )
            .await?;
        Ok(UsageTotals {
            request_count: row.get_i64("request_count")?,
            total_tokens: row.get_i64("total_tokens")?,
            total_cost_usd: row.get_f64("total_cost_usd")?,
        })
    }

    pub async fn all_time(&self, user_id: &str) -> Result<UsageTotals, DbError> {
        let row = self
            .db
            .query_one(
                "SELECT CAST(COALESCE(SUM(request_count), 0) AS BIGINT) AS request_count,
                        CAST(COALESCE(SUM(total_tokens), 0) AS BIGINT) AS total_tokens,
                        CAST(COALESCE(SUM(total_cost_usd), 0) AS DOUBLE PRECISION) AS total_cost_usd
                 FROM daily_aggregates WHERE user_id = ?",
                sql_params![user_id],
            )
            .await?;
        Ok(UsageTotals {
            request_count: row.get_i64("request_count")?,
            total_tokens: row.get_i64("total_tokens")?,
            total_cost_usd: row.get_f64("total_cost_usd")?,
        })
    }
}
