//! Upstream fetching with bounded retries.
//!
//! One pooled `reqwest` client serves every fetch, so connections to a target
//! are reused across requests. Transient failures (connection errors and the
//! retriable status codes) are retried a bounded number of times with
//! exponential backoff; any other status is treated as payload, not as a
//! failure, and its body is returned to the caller.

use bytes::Bytes;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};
use url::Url;

use crate::http::Method;
use crate::params::ParamMap;

/// Retry policy for upstream fetches: a bounded number of retries after the
/// initial attempt, with exponential backoff between attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries allowed after the initial attempt.
    pub max_retries: u32,
    /// Backoff before the first retry; doubles for each retry after it.
    pub base_backoff_ms: u64,
    /// Upper bound any single backoff is clamped to.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    /// Three retries with 1 s, 2 s, 4 s pauses.
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Status codes that trigger a retry. Anything else, errors included, is
    /// payload for the caller.
    pub fn is_retriable_status(status: u16) -> bool {
        matches!(status, 500 | 502 | 503 | 504)
    }

    /// Backoff before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> std::time::Duration {
        let exponent = retry.saturating_sub(1).min(63);
        let ms = self
            .base_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms);
        std::time::Duration::from_millis(ms)
    }
}

/// Errors surfaced when the upstream could not be fetched. Both variants mean
/// the retry budget is spent; neither may ever be turned into a cache entry.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The last allowed attempt failed at the connection level.
    #[error("upstream unavailable after {attempts} attempts: {source}")]
    Transport {
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },

    /// Every allowed attempt drew a retriable status.
    #[error("upstream unavailable after {attempts} attempts: last status {status}")]
    Status { attempts: u32, status: u16 },
}

impl UpstreamError {
    /// Total attempts made before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Transport { attempts, .. } | Self::Status { attempts, .. } => *attempts,
        }
    }
}

/// Connection-reusing upstream HTTP client.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl UpstreamClient {
    /// Builds the client.
    ///
    /// # Errors
    ///
    /// `reqwest` initialization failures (TLS backend setup).
    pub fn new(policy: RetryPolicy) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self { client, policy })
    }

    /// Fetches the target and returns the response body.
    ///
    /// GET parameters already ride the target URL; POST sends `params` as an
    /// `application/x-www-form-urlencoded` body. Callers gate methods to GET
    /// and POST before calling.
    ///
    /// # Errors
    ///
    /// [`UpstreamError`] once the retry budget is spent on connection-level
    /// failures or retriable statuses.
    pub async fn fetch(
        &self,
        method: &Method,
        target: &Url,
        params: &ParamMap,
    ) -> Result<Bytes, UpstreamError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.send_once(method, target, params).await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if !RetryPolicy::is_retriable_status(status) {
                        if attempts > 1 {
                            debug!(url = %target, attempts, "upstream recovered after retry");
                        }
                        return response
                            .bytes()
                            .await
                            .map_err(|source| UpstreamError::Transport { attempts, source });
                    }
                    if attempts > self.policy.max_retries {
                        return Err(UpstreamError::Status { attempts, status });
                    }
                    let delay = self.policy.backoff(attempts);
                    warn!(
                        url = %target,
                        status,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "retriable upstream status, backing off"
                    );
                    sleep(delay).await;
                }
                Err(source) => {
                    if attempts > self.policy.max_retries {
                        return Err(UpstreamError::Transport { attempts, source });
                    }
                    let delay = self.policy.backoff(attempts);
                    warn!(
                        url = %target,
                        error = %source,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "upstream request failed, backing off"
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    async fn send_once(
        &self,
        method: &Method,
        target: &Url,
        params: &ParamMap,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let request = match method {
            Method::Post => self.client.post(target.clone()).form(params),
            _ => self.client.get(target.clone()),
        };
        request.send().await
    }
}
