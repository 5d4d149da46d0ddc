//! Rate-limited HTTP client for upstream provider APIs
//!
//! Wraps a shared `reqwest` client with a per-process token bucket and a
//! bounded retry loop. The bucket is acquired inside the loop, once per
//! attempt, so a long backoff never sits on a token.

use governor::{
    clock::DefaultClock, middleware::NoOpMiddleware, state::NotKeyed, Quota, RateLimiter,
};
use rand::Rng;
use reqwest::{Client, RequestBuilder, Response};
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::{debug, warn};

use super::traits::ProviderError;

/// Time allowed for the upstream to produce response headers.
const HEADER_TIMEOUT: Duration = Duration::from_secs(30);
/// Time allowed for the whole call including the body.
const BODY_TIMEOUT: Duration = Duration::from_secs(120);
/// First backoff delay; doubles per attempt up to [`BACKOFF_CAP`].
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Rate-limited HTTP client shared by all requests to one upstream.
pub struct RateLimitedClient {
    client: Client,
    limiter: RateLimiter<NotKeyed, governor::state::InMemoryState, DefaultClock, NoOpMiddleware>,
}

impl RateLimitedClient {
    /// Create a client allowing `rate_limit_per_minute` upstream calls.
    pub fn new(rate_limit_per_minute: u32) -> Self {
        let rate = NonZeroU32::new(rate_limit_per_minute.max(1))
            .unwrap_or(NonZeroU32::MIN);
        let limiter = RateLimiter::direct(Quota::per_minute(rate));

        let client = Client::builder()
            .timeout(BODY_TIMEOUT)
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .user_agent(concat!("llm-gateway/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("Failed to create HTTP client");

        RateLimitedClient { client, limiter }
    }

    /// Build a POST request against an upstream endpoint.
    pub fn post(&self, url: &str) -> RequestBuilder {
        self.client.post(url)
    }

    /// One attempt: wait for a bucket token, send, enforce the header
    /// timeout, and classify the response status.
    async fn execute(&self, builder: RequestBuilder) -> Result<Response, ProviderError> {
        self.limiter.until_ready().await;

        debug!("Executing rate-limited upstream request");
        let response = tokio::time::timeout(HEADER_TIMEOUT, builder.send())
            .await
            .map_err(|_| ProviderError::Timeout("upstream response headers".to_string()))??;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(1);
            warn!(retry_after_secs = retry_after, "Rate limited by upstream");
            return Err(ProviderError::RateLimited {
                retry_after_secs: retry_after,
            });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message: truncate(&message, 512),
            });
        }

        Ok(response)
    }

    /// Execute with bounded retries and exponential backoff plus jitter.
    /// Only retryable failures (429, 5xx, transport, timeout) loop; the
    /// rest surface immediately.
    pub async fn execute_with_retry(
        &self,
        builder: RequestBuilder,
        attempts: u32,
    ) -> Result<Response, ProviderError> {
        let attempts = attempts.max(1);
        let mut backoff = BACKOFF_BASE;
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
                let delay = backoff + jitter;
                debug!(attempt, delay_ms = delay.as_millis() as u64, "Retrying upstream request");
                tokio::time::sleep(delay).await;
                backoff = (backoff * 2).min(BACKOFF_CAP);
            }

            let cloned = match builder.try_clone() {
                Some(b) => b,
                None => {
                    return Err(ProviderError::InvalidRequest(
                        "request body is not replayable".to_string(),
                    ))
                }
            };

            match self.execute(cloned).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() => {
                    warn!(attempt, error = %e, "Upstream attempt failed");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or(ProviderError::Timeout("retries exhausted".to_string())))
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello world", 5), "hello");
        // Multibyte character straddling the cut point is dropped whole.
        let s = "ab\u{00e9}cd";
        assert_eq!(truncate(s, 3), "ab");
    }

    #[tokio::test]
    async fn retry_gives_up_after_bounded_attempts() {
        // Nothing listens on this port; every attempt is a transport error.
        let client = RateLimitedClient::new(600);
        let builder = client.post("http://127.0.0.1:1/v1/chat/completions");
        let err = client.execute_with_retry(builder, 2).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
