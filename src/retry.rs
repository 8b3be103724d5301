//! Retry layer for sink requests: exponential backoff, retryable status codes.
//! On 429, waits for Retry-After when the server sends it.

use crate::config::RetryConfig;
use reqwest::header::HeaderMap;
use reqwest::{Client, Request, Response};
use std::time::Duration;
use tracing::warn;

/// Failed sink call. Callers branch on the kind: retryable failures may be redelivered,
/// permanent ones never succeed as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// Transport error or 408/429/5xx, after all attempts.
    Retryable(String),
    /// Any other non-success status, or a request that could not be built.
    Permanent(String),
}

impl SinkError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SinkError::Retryable(_))
    }
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkError::Retryable(msg) => write!(f, "retryable sink error: {}", msg),
            SinkError::Permanent(msg) => write!(f, "permanent sink error: {}", msg),
        }
    }
}

impl std::error::Error for SinkError {}

/// HTTP status codes that are retried: 408 Request Timeout, 429 Too Many Requests, 5xx.
pub fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    let code = status.as_u16();
    code == 408 || code == 429 || (500..600).contains(&code)
}

/// Compute backoff duration for the given attempt (0 = first retry).
pub fn backoff_duration(retry: &RetryConfig, attempt: u32) -> Duration {
    let secs = (retry.initial_backoff_secs as f64) * retry.multiplier.powi(attempt as i32);
    let capped = retry
        .max_backoff_secs
        .map(|max| secs.min(max as f64))
        .unwrap_or(secs);
    Duration::from_secs_f64(capped.min(u64::MAX as f64))
}

/// Parse Retry-After as delta-seconds or HTTP-date. Caps duration by max_cap_secs when given.
pub fn retry_after_from_headers(
    headers: &HeaderMap,
    max_cap_secs: Option<u64>,
) -> Option<Duration> {
    let s = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = s.parse::<u64>() {
        return Some(cap_duration(Duration::from_secs(secs), max_cap_secs));
    }
    let until = chrono::DateTime::parse_from_rfc2822(s).ok()?;
    let secs = (until.with_timezone(&chrono::Utc) - chrono::Utc::now())
        .num_seconds()
        .max(0) as u64;
    Some(cap_duration(Duration::from_secs(secs), max_cap_secs))
}

fn cap_duration(d: Duration, max_secs: Option<u64>) -> Duration {
    match max_secs {
        Some(cap) if d.as_secs() > cap => Duration::from_secs(cap),
        _ => d,
    }
}

/// Execute a request with retries. `build` is called once per attempt with the attempt
/// index, so callers can rotate through endpoints.
pub async fn execute_with_retry<F>(
    client: &Client,
    retry: &RetryConfig,
    mut build: F,
) -> Result<Response, SinkError>
where
    F: FnMut(u32) -> Result<Request, SinkError>,
{
    let max_attempts = retry.max_attempts.max(1);
    let mut last_err = SinkError::Retryable("no attempts".to_string());
    for attempt in 0..max_attempts {
        let req = build(attempt)?;
        let url = req.url().to_string();
        let delay = match client.execute(req).await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }
                if !is_retryable_status(status) {
                    let body = response.text().await.unwrap_or_default();
                    return Err(SinkError::Permanent(format!(
                        "http {} {} (url: {})",
                        status,
                        truncate(&body),
                        url
                    )));
                }
                let delay = if status.as_u16() == 429 {
                    retry_after_from_headers(response.headers(), retry.max_backoff_secs)
                        .filter(|d| !d.is_zero())
                        .unwrap_or_else(|| backoff_duration(retry, attempt))
                } else {
                    backoff_duration(retry, attempt)
                };
                let body = response.text().await.unwrap_or_default();
                last_err = SinkError::Retryable(format!(
                    "http {} {} (url: {})",
                    status,
                    truncate(&body),
                    url
                ));
                delay
            }
            Err(e) => {
                last_err = SinkError::Retryable(format!("{} (url: {})", e, url));
                backoff_duration(retry, attempt)
            }
        };
        if attempt + 1 < max_attempts {
            warn!(
                error = %last_err,
                attempt = attempt + 1,
                max_attempts,
                delay_secs = delay.as_secs_f64(),
                "sink request failed, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }
    Err(last_err)
}

/// Keep error bodies short in logs.
fn truncate(body: &str) -> &str {
    const MAX: usize = 512;
    if body.len() <= MAX {
        return body;
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}
