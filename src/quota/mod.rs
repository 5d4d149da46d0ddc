//! Quota engine: pre-flight admission and post-flight usage accounting
//!
//! Admission combines persisted daily aggregates with a process-local
//! concurrency counter. Aggregates only reflect completed requests, so a
//! burst can overshoot the daily token cap by up to
//! `max_concurrent_requests x per-request-tokens`; the concurrency cap is
//! the bounding mechanism for that overshoot.
//!
//! Day boundaries and `resets_at` timestamps use the server's local
//! timezone.

pub mod pricing;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Datelike, Duration, Local, NaiveDate};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};
use uuid::Uuid;

use crate::db::models::{UsageRecord, UsageStatus};
use crate::db::{now_millis, AggregateRepository, DbError, QuotaRepository, UsageRepository};

/// Admission refusals and engine faults
#[derive(Debug, Error)]
pub enum AdmitError {
    #[error("daily request quota exceeded")]
    DailyRequests {
        limit: i64,
        used: i64,
        resets_at: DateTime<Local>,
    },
    #[error("daily token quota exceeded")]
    DailyTokens {
        limit: i64,
        used: i64,
        resets_at: DateTime<Local>,
    },
    #[error("monthly spend cap exceeded")]
    MonthlySpend {
        cap_usd: f64,
        used_usd: f64,
        resets_at: DateTime<Local>,
    },
    #[error("too many concurrent requests")]
    TooManyConcurrent { limit: i64 },
    /// Every user has a quota row; its absence is an invariant violation.
    #[error("quota row missing for user {0}")]
    MissingQuota(String),
    #[error("Database error: {0}")]
    Db(#[from] DbError),
}

/// Process-local in-flight request counter, keyed by user id. Not
/// persisted; resets on restart.
#[derive(Clone, Default)]
pub struct ConcurrencyTracker {
    inner: Arc<Mutex<HashMap<String, i64>>>,
}

impl ConcurrencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the counter if it is below `max`. The check and the
    /// increment happen under one lock acquisition.
    fn try_acquire(&self, user_id: &str, max: i64) -> bool {
        let mut counts = self.inner.lock();
        let count = counts.entry(user_id.to_string()).or_insert(0);
        if *count >= max {
            return false;
        }
        *count += 1;
        true
    }

    /// Decrement with a floor of zero, tolerating double release.
    fn release(&self, user_id: &str) {
        let mut counts = self.inner.lock();
        if let Some(count) = counts.get_mut(user_id) {
            *count = (*count - 1).max(0);
            if *count == 0 {
                counts.remove(user_id);
            }
        }
    }

    pub fn in_flight(&self, user_id: &str) -> i64 {
        *self.inner.lock().get(user_id).unwrap_or(&0)
    }
}

/// What the pipeline reports when a dispatched request finishes.
#[derive(Debug, Clone)]
pub struct UsageEvent {
    pub provider: String,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub status: UsageStatus,
    pub error_message: Option<String>,
}

impl UsageEvent {
    /// Event for a failure before or during dispatch.
    pub fn failure(provider: Option<&str>, model: Option<&str>, message: &str) -> Self {
        UsageEvent {
            provider: provider.unwrap_or("unknown").to_string(),
            model: model.unwrap_or("unknown").to_string(),
            input_tokens: 0,
            output_tokens: 0,
            status: UsageStatus::Error,
            error_message: Some(message.to_string()),
        }
    }
}

/// RAII handle for an admitted request. Exactly one release happens per
/// admission: either inside [`QuotaEngine::record`], or - if the request
/// future is dropped first (client disconnect, handler panic) - in `Drop`,
/// which also files a best-effort `client_canceled` usage record.
pub struct InFlight {
    engine: QuotaEngine,
    user_id: String,
    request_id: String,
    started: Instant,
    armed: bool,
}

impl InFlight {
    pub fn latency_ms(&self) -> i64 {
        self.started.elapsed().as_millis() as i64
    }

    fn release(&mut self) {
        if self.armed {
            self.armed = false;
            self.engine.tracker.release(&self.user_id);
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let latency_ms = self.latency_ms();
        self.release();

        let engine = self.engine.clone();
        let user_id = self.user_id.clone();
        let request_id = self.request_id.clone();
        warn!(request_id = %request_id, "Request dropped before recording; filing canceled record");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let event = UsageEvent::failure(None, None, "client_canceled");
                if let Err(e) = engine.write_record(&user_id, &request_id, latency_ms, event).await
                {
                    error!(request_id = %request_id, error = %e, "Failed to record canceled request");
                }
            });
        }
    }
}

/// A (limit, used, remaining) view of one quota dimension.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct QuotaWindow {
    pub limit: i64,
    pub used: i64,
    pub remaining: i64,
}

/// Monthly spend view; a null cap means unlimited.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct SpendWindow {
    pub cap_usd: Option<f64>,
    pub used_usd: f64,
    pub remaining_usd: Option<f64>,
}

/// Read-only quota inspection for `/v1/llm/quota` and the admin surface.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct QuotaStatus {
    pub user_id: String,
    pub daily_requests: QuotaWindow,
    pub daily_tokens: QuotaWindow,
    pub monthly_spend: SpendWindow,
}

/// The quota engine. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct QuotaEngine {
    quotas: QuotaRepository,
    aggregates: AggregateRepository,
    usage: UsageRepository,
    tracker: ConcurrencyTracker,
}

impl QuotaEngine {
    pub fn new(
        quotas: QuotaRepository,
        aggregates: AggregateRepository,
        usage: UsageRepository,
    ) -> Self {
        Self {
            quotas,
            aggregates,
            usage,
            tracker: ConcurrencyTracker::new(),
        }
    }

    pub fn tracker(&self) -> &ConcurrencyTracker {
        &self.tracker
    }

    /// Pre-flight admission. Checks run in a fixed order and the first
    /// failure wins; on success the concurrency counter is incremented and
    /// the returned guard owns the matching release.
    pub async fn admit(&self, user_id: &str, request_id: &str) -> Result<InFlight, AdmitError> {
        let quota = self
            .quotas
            .get(user_id)
            .await?
            .ok_or_else(|| AdmitError::MissingQuota(user_id.to_string()))?;

        let today = today_local();
        let aggregate = self
            .aggregates
            .daily(user_id, &date_str(today))
            .await?
            .unwrap_or_else(|| crate::db::DailyAggregate::zero(user_id, &date_str(today)));

        if aggregate.request_count >= quota.daily_requests {
            return Err(AdmitError::DailyRequests {
                limit: quota.daily_requests,
                used: aggregate.request_count,
                resets_at: next_local_midnight(today),
            });
        }

        if aggregate.total_tokens >= quota.daily_tokens {
            return Err(AdmitError::DailyTokens {
                limit: quota.daily_tokens,
                used: aggregate.total_tokens,
                resets_at: next_local_midnight(today),
            });
        }

        if let Some(cap) = quota.monthly_spend_cap_usd {
            let month_spend = self
                .aggregates
                .totals_between(user_id, &date_str(month_start(today)), &date_str(today))
                .await?
                .total_cost_usd;
            if month_spend >= cap {
                return Err(AdmitError::MonthlySpend {
                    cap_usd: cap,
                    used_usd: month_spend,
                    resets_at: next_month_start(today),
                });
            }
        }

        if !self
            .tracker
            .try_acquire(user_id, quota.max_concurrent_requests)
        {
            return Err(AdmitError::TooManyConcurrent {
                limit: quota.max_concurrent_requests,
            });
        }

        Ok(InFlight {
            engine: self.clone(),
            user_id: user_id.to_string(),
            request_id: request_id.to_string(),
            started: Instant::now(),
            armed: true,
        })
    }

    /// Post-flight accounting. Runs on success and failure alike; the
    /// concurrency counter is released even when the transaction fails.
    pub async fn record(
        &self,
        mut in_flight: InFlight,
        event: UsageEvent,
    ) -> Result<UsageRecord, DbError> {
        let latency_ms = in_flight.latency_ms();
        let user_id = in_flight.user_id.clone();
        let request_id = in_flight.request_id.clone();

        let result = self
            .write_record(&user_id, &request_id, latency_ms, event)
            .await;
        in_flight.release();
        result
    }

    async fn write_record(
        &self,
        user_id: &str,
        request_id: &str,
        latency_ms: i64,
        event: UsageEvent,
    ) -> Result<UsageRecord, DbError> {
        let cost_estimate_usd = pricing::estimate_cost(
            &event.provider,
            &event.model,
            event.input_tokens,
            event.output_tokens,
        );
        let record = UsageRecord {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            request_id: request_id.to_string(),
            provider: event.provider,
            model: event.model,
            input_tokens: event.input_tokens,
            output_tokens: event.output_tokens,
            cost_estimate_usd,
            latency_ms,
            status: event.status,
            error_message: event.error_message,
            created_at: now_millis(),
        };
        self.usage
            .insert_with_aggregate(&record, &date_str(today_local()))
            .await?;
        Ok(record)
    }

    /// Current (limit, used, remaining) per dimension for one user.
    pub async fn inspect(&self, user_id: &str) -> Result<QuotaStatus, AdmitError> {
        let quota = self
            .quotas
            .get(user_id)
            .await?
            .ok_or_else(|| AdmitError::MissingQuota(user_id.to_string()))?;

        let today = today_local();
        let aggregate = self
            .aggregates
            .daily(user_id, &date_str(today))
            .await?
            .unwrap_or_else(|| crate::db::DailyAggregate::zero(user_id, &date_str(today)));
        let month = self
            .aggregates
            .totals_between(user_id, &date_str(month_start(today)), &date_str(today))
            .await?;

        Ok(QuotaStatus {
            user_id: user_id.to_string(),
            daily_requests: QuotaWindow {
                limit: quota.daily_requests,
                used: aggregate.request_count,
                remaining: (quota.daily_requests - aggregate.request_count).max(0),
            },
            daily_tokens: QuotaWindow {
                limit: quota.daily_tokens,
                used: aggregate.total_tokens,
                remaining: (quota.daily_tokens - aggregate.total_tokens).max(0),
            },
            monthly_spend: SpendWindow {
                cap_usd: quota.monthly_spend_cap_usd,
                used_usd: month.total_cost_usd,
                remaining_usd: quota
                    .monthly_spend_cap_usd
                    .map(|cap| (cap - month.total_cost_usd).max(0.0)),
            },
        })
    }
}

/// Today's aggregate key (`YYYY-MM-DD`), in the server's local timezone.
pub fn today_string() -> String {
    date_str(today_local())
}

/// First day of the current local month, as an aggregate key.
pub fn month_start_string() -> String {
    date_str(month_start(today_local()))
}

fn today_local() -> NaiveDate {
    Local::now().date_naive()
}

fn date_str(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// Midnight at the start of the day after `date`, in local time.
fn next_local_midnight(date: NaiveDate) -> DateTime<Local> {
    let next = date + Duration::days(1);
    next.and_hms_opt(0, 0, 0)
        .and_then(|dt| dt.and_local_timezone(Local).earliest())
        .unwrap_or_else(Local::now)
}

/// Midnight on the first day of the month after `date`, in local time.
fn next_month_start(date: NaiveDate) -> DateTime<Local> {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .and_then(|dt| dt.and_local_timezone(Local).earliest())
        .unwrap_or_else(Local::now)
}
