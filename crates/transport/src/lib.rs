//! mcpsync transport: ships batched upserts/deletes and full resync snapshots
//! to the external sync endpoint.

#![forbid(unsafe_code)]

use mcpsync_core::ResourceData;

mod backoff;
mod client;
mod wire;

pub use backoff::Backoff;
pub use client::{normalize_endpoint, SyncClient, SyncClientConfig, SYNC_PATH};
pub use wire::{FailureDetails, SyncCounts, SyncErrorBody, SyncFailure, SyncRequest, SyncResponse};

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("secret {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },
    #[error("key {key:?} missing or empty in secret {namespace}/{name}")]
    KeyMissing { namespace: String, name: String, key: String },
    #[error("reading secret: {0}")]
    Backend(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("credential: {0}")]
    Credential(#[from] CredentialError),
    #[error("encoding request: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("endpoint returned an unreadable body: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("sync rejected ({code}): {message}")]
    Rejected { code: String, message: String },
    #[error("partial failure: {} item(s) rejected", .0.get_failures().len())]
    PartialFailure(Box<SyncResponse>),
    #[error("cancelled")]
    Cancelled,
}

impl SyncError {
    /// Whether the whole request may be sent again as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Http(_) | Self::Status { .. } | Self::Decode(_) | Self::Rejected { .. })
    }

    /// The response carried by a partial failure, if this is one.
    pub fn partial_response(&self) -> Option<&SyncResponse> {
        match self {
            Self::PartialFailure(resp) => Some(resp),
            _ => None,
        }
    }
}

/// Resolves the bearer token sent with every request.
#[async_trait::async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> Result<String, CredentialError>;
}

/// Fixed token, mostly useful for tests and local runs.
#[derive(Clone)]
pub struct StaticToken(pub String);

#[async_trait::async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> Result<String, CredentialError> { Ok(self.0.clone()) }
}

/// Downstream sink for batches. [`SyncClient`] is the HTTP implementation.
#[async_trait::async_trait]
pub trait SyncTransport: Send + Sync {
    async fn sync_resources(&self, upserts: Vec<ResourceData>, deletes: Vec<String>) -> Result<SyncResponse, SyncError>;

    /// Authoritative full-state snapshot; carries no deletes.
    async fn resync(&self, all: Vec<ResourceData>) -> Result<SyncResponse, SyncError>;
}
