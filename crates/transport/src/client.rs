use std::sync::Arc;
use std::time::{Duration, Instant};

use mcpsync_core::ResourceData;
use metrics::{counter, histogram};
use reqwest::header::CONTENT_TYPE;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Backoff, SyncError, SyncRequest, SyncResponse, SyncTransport, TokenSource};

/// Path appended to configured endpoints that do not already end with it.
pub const SYNC_PATH: &str = "/api/v1/resources/sync";

const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Clone)]
pub struct SyncClientConfig {
    pub endpoint: String,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub request_timeout: Duration,
}

impl SyncClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
        }
    }
}

pub fn normalize_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim().trim_end_matches('/');
    if trimmed.ends_with(SYNC_PATH) { trimmed.to_string() } else { format!("{}{}", trimmed, SYNC_PATH) }
}

/// HTTP client for the sync endpoint.
///
/// Retries transport errors, non-2xx statuses and whole-batch rejections with
/// exponential backoff. Partial failures and credential errors are returned
/// immediately. Backoff sleeps end early when `cancel` fires.
pub struct SyncClient {
    http: reqwest::Client,
    url: String,
    max_retries: u32,
    backoff: Backoff,
    token: Option<Arc<dyn TokenSource>>,
    cancel: CancellationToken,
}

impl SyncClient {
    pub fn new(cfg: SyncClientConfig) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder().timeout(cfg.request_timeout).build()?;
        Ok(Self {
            http,
            url: normalize_endpoint(&cfg.endpoint),
            max_retries: cfg.max_retries,
            backoff: Backoff::new(cfg.initial_backoff, cfg.max_backoff),
            token: None,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_token_source(mut self, token: Arc<dyn TokenSource>) -> Self {
        self.token = Some(token);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Replace the backoff schedule, e.g. with a seeded one in tests.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn url(&self) -> &str { &self.url }

    async fn post(&self, req: &SyncRequest) -> Result<SyncResponse, SyncError> {
        let body = serde_json::to_vec(req).map_err(SyncError::Encode)?;
        let mut retries = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let token = match &self.token {
                Some(src) => Some(src.token().await?),
                None => None,
            };
            let t0 = Instant::now();
            let outcome = self.attempt(&body, token.as_deref()).await;
            histogram!("sync_http_ms", t0.elapsed().as_secs_f64() * 1000.0);
            let err = match outcome {
                Ok(resp) => {
                    counter!("sync_http_attempts_total", 1u64, "outcome" => "ok");
                    return Ok(resp);
                }
                Err(e) if !e.is_retryable() => {
                    counter!("sync_http_attempts_total", 1u64, "outcome" => "final");
                    return Err(e);
                }
                Err(e) => e,
            };
            counter!("sync_http_attempts_total", 1u64, "outcome" => "retryable");
            if retries >= self.max_retries {
                return Err(err);
            }
            retries += 1;
            let delay = self.backoff.delay(retries);
            warn!(url = %self.url, error = %err, retry = retries, delay_ms = delay.as_millis() as u64, "sync request failed; backing off");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => return Err(SyncError::Cancelled),
            }
        }
    }

    async fn attempt(&self, body: &[u8], token: Option<&str>) -> Result<SyncResponse, SyncError> {
        let mut rb = self.http.post(&self.url).header(CONTENT_TYPE, "application/json").body(body.to_vec());
        if let Some(t) = token {
            rb = rb.bearer_auth(t);
        }
        let resp = rb.send().await?;
        let status = resp.status();
        let bytes = resp.bytes().await?;
        let parsed = serde_json::from_slice::<SyncResponse>(&bytes);

        if let Ok(r) = &parsed {
            if r.has_partial_failures() {
                return Err(SyncError::PartialFailure(Box::new(r.clone())));
            }
        }
        if !status.is_success() {
            let mut text = String::from_utf8_lossy(&bytes).into_owned();
            if text.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !text.is_char_boundary(cut) {
                    cut -= 1;
                }
                text.truncate(cut);
            }
            return Err(SyncError::Status { status: status.as_u16(), body: text });
        }
        let r = parsed.map_err(SyncError::Decode)?;
        if !r.success {
            let (code, message) = r.error.map(|e| (e.code, e.message)).unwrap_or_default();
            return Err(SyncError::Rejected { code, message });
        }
        debug!(upserted = r.upserted(), deleted = r.deleted(), "sync request accepted");
        Ok(r)
    }
}

#[async_trait::async_trait]
impl SyncTransport for SyncClient {
    async fn sync_resources(&self, upserts: Vec<ResourceData>, deletes: Vec<String>) -> Result<SyncResponse, SyncError> {
        self.post(&SyncRequest { upserts, deletes, is_resync: false }).await
    }

    async fn resync(&self, all: Vec<ResourceData>) -> Result<SyncResponse, SyncError> {
        self.post(&SyncRequest { upserts: all, deletes: Vec::new(), is_resync: true }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_gets_sync_path_once() {
        assert_eq!(normalize_endpoint("http://mcp:8080"), "http://mcp:8080/api/v1/resources/sync");
        assert_eq!(normalize_endpoint("http://mcp:8080/"), "http://mcp:8080/api/v1/resources/sync");
        assert_eq!(
            normalize_endpoint("http://mcp:8080/api/v1/resources/sync"),
            "http://mcp:8080/api/v1/resources/sync"
        );
        assert_eq!(
            normalize_endpoint("http://mcp:8080/api/v1/resources/sync/"),
            "http://mcp:8080/api/v1/resources/sync"
        );
    }

    #[test]
    fn retry_classification() {
        assert!(SyncError::Status { status: 500, body: String::new() }.is_retryable());
        assert!(SyncError::Rejected { code: "X".into(), message: String::new() }.is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(!SyncError::PartialFailure(Box::default()).is_retryable());
        assert!(SyncError::PartialFailure(Box::default()).partial_response().is_some());
    }
}
