//! Bulk sink: Elasticsearch `_bulk` and single-document index over HTTP.
//!
//! Attempts rotate through the configured URLs; the last URL that answered is tried first
//! on the next call.

use crate::client::{auth_header, build_client};
use crate::config::{RetryConfig, SinkConfig};
use crate::record::Operation;
use crate::retry::{SinkError, execute_with_retry, is_retryable_status};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue};
use reqwest::{Client, Method, Request, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Result of a bulk write the sink accepted (2xx).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    pub indexed: usize,
    /// Failed items, retryable ones included.
    pub failed: usize,
    /// Reason of the first failed item, for logging.
    pub first_error: Option<String>,
    /// Positions (in request order) of items that failed with a retryable status (408, 429, 5xx).
    pub retry: Vec<usize>,
}

/// Where batches and stats documents go.
#[async_trait]
pub trait BulkSink: Send + Sync {
    async fn bulk_index(&self, ops: &[Operation]) -> Result<BulkOutcome, SinkError>;

    async fn index_single(&self, index: &str, body: &Value) -> Result<(), SinkError>;

    /// Reachability check at startup.
    async fn ping(&self) -> Result<(), SinkError>;
}

pub struct ElasticsearchSink {
    client: Client,
    urls: Vec<String>,
    doc_type: Option<String>,
    auth: Option<HeaderValue>,
    retry: RetryConfig,
    active: AtomicUsize,
}

impl ElasticsearchSink {
    pub fn from_config(config: &SinkConfig) -> anyhow::Result<Self> {
        if config.urls.is_empty() {
            anyhow::bail!("sink needs at least one url");
        }
        Ok(Self {
            client: build_client(config)?,
            urls: config
                .urls
                .iter()
                .map(|u| u.trim_end_matches('/').to_string())
                .collect(),
            doc_type: config.doc_type.clone().filter(|t| !t.is_empty()),
            auth: auth_header(config.auth.as_ref())?,
            retry: config.retries.clone(),
            active: AtomicUsize::new(0),
        })
    }

    /// Send to `{url}{path}`, failing over to the next URL on each retry.
    async fn send(
        &self,
        method: Method,
        path: &str,
        content_type: &'static str,
        body: Option<Bytes>,
    ) -> Result<reqwest::Response, SinkError> {
        let start = self.active.load(Ordering::Relaxed);
        let mut used = start;
        let response = execute_with_retry(&self.client, &self.retry, |attempt| {
            used = (start + attempt as usize) % self.urls.len();
            self.build(method.clone(), &self.urls[used], path, content_type, body.clone())
        })
        .await;
        if used != start {
            tracing::info!(url = %self.urls[used], "sink failed over");
            self.active.store(used, Ordering::Relaxed);
        }
        response
    }

    fn build(
        &self,
        method: Method,
        base: &str,
        path: &str,
        content_type: &'static str,
        body: Option<Bytes>,
    ) -> Result<Request, SinkError> {
        let mut req = self
            .client
            .request(method, format!("{}{}", base, path))
            .header(CONTENT_TYPE, content_type);
        if let Some(auth) = &self.auth {
            req = req.header(AUTHORIZATION, auth.clone());
        }
        if let Some(body) = body {
            req = req.body(body);
        }
        req.build()
            .map_err(|e| SinkError::Permanent(format!("build request: {}", e)))
    }
}

/// NDJSON `_bulk` body: one action line plus one source line per operation.
pub fn bulk_body(ops: &[Operation], doc_type: Option<&str>) -> String {
    let mut out = String::with_capacity(ops.len() * 256);
    for op in ops {
        let action = match doc_type {
            Some(t) => json!({"index": {"_index": op.index, "_type": t}}),
            None => json!({"index": {"_index": op.index}}),
        };
        out.push_str(&action.to_string());
        out.push('\n');
        out.push_str(&op.body.to_string());
        out.push('\n');
    }
    out
}

#[derive(Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Deserialize)]
struct BulkItem {
    #[serde(default)]
    status: u16,
    #[serde(default)]
    error: Option<Value>,
}

fn bulk_outcome(total: usize, body: &str) -> BulkOutcome {
    let resp: BulkResponse = match serde_json::from_str(body) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "unreadable bulk response; assuming all indexed");
            return BulkOutcome {
                indexed: total,
                ..Default::default()
            };
        }
    };
    if !resp.errors {
        return BulkOutcome {
            indexed: total,
            ..Default::default()
        };
    }
    let mut outcome = BulkOutcome::default();
    // one single-key map per request item, in request order
    for (pos, item) in resp
        .items
        .iter()
        .enumerate()
        .flat_map(|(pos, m)| m.values().map(move |item| (pos, item)))
    {
        if item.error.is_none() && item.status < 300 {
            continue;
        }
        outcome.failed += 1;
        if StatusCode::from_u16(item.status).is_ok_and(is_retryable_status) {
            outcome.retry.push(pos);
        }
        if outcome.first_error.is_none() {
            outcome.first_error = item.error.as_ref().map(|e| {
                e.get("reason")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| e.to_string())
            });
        }
    }
    outcome.indexed = total.saturating_sub(outcome.failed);
    outcome
}

#[async_trait]
impl BulkSink for ElasticsearchSink {
    async fn bulk_index(&self, ops: &[Operation]) -> Result<BulkOutcome, SinkError> {
        if ops.is_empty() {
            return Ok(BulkOutcome::default());
        }
        let body = Bytes::from(bulk_body(ops, self.doc_type.as_deref()));
        let response = self
            .send(Method::POST, "/_bulk", "application/x-ndjson", Some(body))
            .await?;
        let text = response
            .text()
            .await
            .map_err(|e| SinkError::Retryable(format!("read bulk response: {}", e)))?;
        Ok(bulk_outcome(ops.len(), &text))
    }

    async fn index_single(&self, index: &str, body: &Value) -> Result<(), SinkError> {
        let path = format!("/{}/{}", index, self.doc_type.as_deref().unwrap_or("_doc"));
        let body = Bytes::from(body.to_string());
        self.send(Method::POST, &path, "application/json", Some(body))
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), SinkError> {
        self.send(Method::GET, "/", "application/json", None).await?;
        Ok(())
    }
}

/// In-process sink for dispatcher and stats tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Records every call. Bulk results are scripted; an empty script means full success.
    #[derive(Default)]
    pub struct RecordingSink {
        pub bulks: Mutex<Vec<Vec<Operation>>>,
        pub singles: Mutex<Vec<(String, Value)>>,
        pub script: Mutex<VecDeque<Result<BulkOutcome, SinkError>>>,
    }

    impl RecordingSink {
        pub fn scripted(results: Vec<Result<BulkOutcome, SinkError>>) -> Self {
            Self {
                script: Mutex::new(results.into()),
                ..Default::default()
            }
        }

        pub fn bulk_sizes(&self) -> Vec<usize> {
            self.bulks.lock().unwrap().iter().map(Vec::len).collect()
        }
    }

    #[async_trait]
    impl BulkSink for RecordingSink {
        async fn bulk_index(&self, ops: &[Operation]) -> Result<BulkOutcome, SinkError> {
            self.bulks.lock().unwrap().push(ops.to_vec());
            let scripted = self.script.lock().unwrap().pop_front();
            scripted.unwrap_or_else(|| {
                Ok(BulkOutcome {
                    indexed: ops.len(),
                    ..Default::default()
                })
            })
        }

        async fn index_single(&self, index: &str, body: &Value) -> Result<(), SinkError> {
            self.singles
                .lock()
                .unwrap()
                .push((index.to_string(), body.clone()));
            Ok(())
        }

        async fn ping(&self) -> Result<(), SinkError> {
            Ok(())
        }
    }
}
