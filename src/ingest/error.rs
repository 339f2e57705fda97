//! Error types for the ingestion core.
//!
//! - [`RunError`]: the only failures that abort a run before any work starts.
//! - [`ProviderError`]: what a provider returns for one batch attempt; always
//!   converted into a soft [`IngestError`](crate::ingest::types::IngestError).

use thiserror::Error;

use crate::ingest::types::IngestError;

/// Fatal, synchronous run failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunError {
    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    #[error("Provider disabled: {id} ({reason})")]
    ProviderDisabled { id: String, reason: String },
}

/// Failure of a single provider ingest attempt.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// Network hiccup, upstream 5xx or similar. Retried with backoff.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Upstream answered 429.
    #[error("Rate limited by upstream: {provider}")]
    RateLimited { provider: String },

    /// Bad symbol, bad request, missing key. Never retried.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Payload could not be understood. Never retried.
    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Network error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ProviderError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient(_) | Self::RateLimited { .. } => true,
            Self::Validation(_) | Self::Decode(_) => false,
            Self::Http(e) => {
                if e.is_timeout() || e.is_connect() {
                    return true;
                }
                match e.status() {
                    Some(s) => s.is_server_error() || s.as_u16() == 429,
                    // body/request errors without a status are usually I/O
                    None => e.is_request() || e.is_body(),
                }
            }
        }
    }

    /// Convert into a soft error attached to a batch.
    pub fn into_soft(self, batch_index: usize) -> IngestError {
        let transient = self.is_transient();
        IngestError::new(self.to_string())
            .in_batch(batch_index)
            .transient(transient)
    }
}
