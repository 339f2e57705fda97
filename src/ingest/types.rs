// src/ingest/types.rs
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ingest::config::ProviderConfigEntry;
use crate::ingest::error::ProviderError;
use crate::ingest::retry::RetryPolicy;

/// One OHLCV bar for a symbol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PriceBar {
    pub symbol: String,
    /// unix millis of the bar open
    pub ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewsItem {
    pub symbol: String,
    pub title: String,
    #[serde(default)]
    pub url: Option<String>,
    /// unix millis
    pub published_at: i64,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

/// Derived text document destined for the retrieval index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RagDoc {
    pub id: String,
    pub symbol: String,
    pub text: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Provider-specific row (fundamentals, indicator values, option chains...).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRow {
    pub symbol: String,
    pub kind: String,
    /// unix millis
    pub captured_at: i64,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// A soft failure recorded on a result. Never aborts the run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngestError {
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub batch_index: Option<usize>,
    pub message: String,
    #[serde(default)]
    pub transient: bool,
}

impl IngestError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            symbol: None,
            batch_index: None,
            message: message.into(),
            transient: false,
        }
    }

    pub fn for_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn in_batch(mut self, batch_index: usize) -> Self {
        self.batch_index = Some(batch_index);
        self
    }

    pub fn transient(mut self, transient: bool) -> Self {
        self.transient = transient;
        self
    }
}

/// Input to a single provider call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionOptions {
    pub symbols: Vec<String>,
    pub rag_enabled: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    /// High-water mark for incremental pulls.
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
}

/// Append-only accumulator. Batches are merged by concatenating every array.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngestionResult {
    pub provider_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub symbols_tried: Vec<String>,
    pub prices: Vec<PriceBar>,
    pub news: Vec<NewsItem>,
    pub docs: Vec<RagDoc>,
    pub provider_data: Vec<ProviderRow>,
    pub errors: Vec<IngestError>,
    #[serde(default)]
    pub meta: serde_json::Map<String, serde_json::Value>,
}

impl IngestionResult {
    pub fn empty(provider_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            provider_id: provider_id.into(),
            started_at,
            finished_at: None,
            symbols_tried: Vec::new(),
            prices: Vec::new(),
            news: Vec::new(),
            docs: Vec::new(),
            provider_data: Vec::new(),
            errors: Vec::new(),
            meta: serde_json::Map::new(),
        }
    }

    /// Total data items (errors excluded).
    pub fn item_count(&self) -> usize {
        self.prices.len() + self.news.len() + self.docs.len() + self.provider_data.len()
    }

    pub fn counts(&self, batches: usize) -> AggregateCounts {
        AggregateCounts {
            prices: self.prices.len(),
            news: self.news.len(),
            provider_data: self.provider_data.len(),
            errors: self.errors.len(),
            batches,
        }
    }
}

/// One record per executed batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchMeta {
    pub batch_index: usize,
    pub batch_size: usize,
    pub duration_ms: u64,
    pub symbols: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AggregateCounts {
    pub prices: usize,
    pub news: usize,
    pub provider_data: usize,
    pub errors: usize,
    pub batches: usize,
}

/// Emitted to the progress callback after every batch and once more at the end.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressInfo {
    pub provider_id: String,
    pub batch_index: usize,
    pub total_batches: Option<usize>,
    pub batch_size: usize,
    pub duration_ms: u64,
    pub symbols: Vec<String>,
    pub aggregate: AggregateCounts,
    #[serde(default)]
    pub finished: bool,
    #[serde(default)]
    pub aborted: bool,
}

/// Counts returned by the persistence layer.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PersistSummary {
    pub prices: usize,
    pub news: usize,
    pub provider_data: usize,
    pub rag_docs: usize,
    pub duration_ms: u64,
}

/// Everything a caller gets back from a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    #[serde(flatten)]
    pub result: IngestionResult,
    pub batches: Vec<BatchMeta>,
    pub symbol_timings: BTreeMap<String, f64>,
    pub persisted: Option<PersistSummary>,
    /// Set when this run tipped the provider into auto-disable.
    pub disabled: Option<String>,
    #[serde(default)]
    pub aborted: bool,
}

/// Caller-side request for `IngestionManager::run`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub provider_id: String,
    #[serde(default)]
    pub symbols: Option<Vec<String>>,
    #[serde(default)]
    pub rag: Option<bool>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
}

impl RunRequest {
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            ..Default::default()
        }
    }

    pub fn symbols<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.symbols = Some(symbols.into_iter().map(Into::into).collect());
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// Batch-granular cancellation flag. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a provider gets to work with besides its options. Pacing is done by
/// the manager before every attempt.
#[derive(Clone)]
pub struct ProviderContext {
    /// Config entry the provider was registered with, as of run start.
    pub config: Arc<ProviderConfigEntry>,
    pub retry: RetryPolicy,
    /// Zero-based index of the current retry attempt.
    pub attempt: u32,
}

impl ProviderContext {
    pub fn new(config: Arc<ProviderConfigEntry>) -> Self {
        let retry = config.retry_policy();
        Self {
            config,
            retry,
            attempt: 0,
        }
    }

    pub fn provider_id(&self) -> &str {
        &self.config.id
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }
}

/// Capability contract for every data source.
#[async_trait]
pub trait Provider: Send + Sync {
    fn id(&self) -> &str;

    /// Produce a normalized result for `opts.symbols`. Must not persist anything.
    async fn ingest(
        &self,
        ctx: &ProviderContext,
        opts: &IngestionOptions,
    ) -> Result<IngestionResult, ProviderError>;
}
