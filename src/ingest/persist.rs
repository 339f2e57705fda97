// src/ingest/persist.rs
//! Persistence contracts used by the orchestrator, the shared upsert tables
//! behind both stores, and an in-memory store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::ingest::types::{IngestionResult, NewsItem, PersistSummary, PriceBar, ProviderRow, RagDoc};

/// Outcome class of one persisted run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    /// Errors, but some data arrived.
    Partial,
    /// Errors and nothing else.
    Failed,
    /// Stopped at a batch boundary; some symbols were never asked for.
    Aborted,
}

impl RunStatus {
    pub fn classify(result: &IngestionResult) -> Self {
        if result.errors.is_empty() {
            RunStatus::Success
        } else if result.item_count() > 0 {
            RunStatus::Partial
        } else {
            RunStatus::Failed
        }
    }

    /// Status of a finished run, aborted or not.
    pub fn of_run(result: &IngestionResult, aborted: bool) -> Self {
        if aborted {
            RunStatus::Aborted
        } else {
            Self::classify(result)
        }
    }

    pub fn is_failure(self) -> bool {
        self == RunStatus::Failed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub provider_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub items: usize,
    pub errors: usize,
    #[serde(default)]
    pub first_error: Option<String>,
}

impl RunRecord {
    pub fn from_result(result: &IngestionResult, aborted: bool) -> Self {
        Self {
            provider_id: result.provider_id.clone(),
            started_at: result.started_at,
            finished_at: result.finished_at.unwrap_or_else(Utc::now),
            status: RunStatus::of_run(result, aborted),
            items: result.item_count(),
            errors: result.errors.len(),
            first_error: result.errors.first().map(|e| e.message.clone()),
        }
    }
}

/// Count leading failures in a most-recent-first slice. Aborted runs neither
/// count nor break the streak.
pub fn consecutive_failures(recent: &[RunRecord]) -> u32 {
    recent
        .iter()
        .filter(|r| r.status != RunStatus::Aborted)
        .take_while(|r| r.status.is_failure())
        .count() as u32
}

/// Retrieval index collaborator.
#[async_trait]
pub trait RagIndexer: Send + Sync {
    async fn index(&self, symbol: &str, docs: &[RagDoc]) -> Result<()>;
}

#[derive(Clone, Default)]
pub struct ApplyOptions {
    pub enable_rag: bool,
    pub rag: Option<Arc<dyn RagIndexer>>,
}

/// Commits a merged result to durable storage. Replaying the same aggregate
/// must not duplicate rows.
#[async_trait]
pub trait PersistenceApplier: Send + Sync {
    async fn apply(
        &self,
        result: &IngestionResult,
        started_at_ms: i64,
        opts: &ApplyOptions,
    ) -> Result<PersistSummary>;
}

/// Durable run history; source of truth for auto-disable and `since`.
#[async_trait]
pub trait RunLog: Send + Sync {
    async fn record(&self, rec: RunRecord) -> Result<()>;

    /// Most recent first, at most `limit` entries.
    async fn recent(&self, provider_id: &str, limit: usize) -> Result<Vec<RunRecord>>;

    /// Start time of the latest run that covered every symbol without error.
    async fn last_success(&self, provider_id: &str) -> Result<Option<DateTime<Utc>>>;
}

/// Upsert tables shared by the memory and file stores.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tables {
    /// symbol -> ts -> bar
    #[serde(default)]
    pub prices: BTreeMap<String, BTreeMap<i64, PriceBar>>,
    /// content hash -> item
    #[serde(default)]
    pub news: BTreeMap<String, NewsItem>,
    /// "provider|symbol|kind" -> latest row
    #[serde(default)]
    pub provider_data: BTreeMap<String, ProviderRow>,
}

impl Tables {
    /// Merge a result in. Returns (prices, news, provider_data) rows touched.
    pub fn upsert(&mut self, result: &IngestionResult) -> (usize, usize, usize) {
        let mut prices = 0;
        for bar in &result.prices {
            self.prices
                .entry(bar.symbol.clone())
                .or_default()
                .insert(bar.ts, bar.clone());
            prices += 1;
        }

        let mut news = 0;
        for item in &result.news {
            let key = news_key(item);
            if !self.news.contains_key(&key) {
                self.news.insert(key, item.clone());
                news += 1;
            }
        }

        let mut rows = 0;
        for row in &result.provider_data {
            let key = format!("{}|{}|{}", result.provider_id, row.symbol, row.kind);
            let newer = self
                .provider_data
                .get(&key)
                .map(|old| row.captured_at >= old.captured_at)
                .unwrap_or(true);
            if newer {
                self.provider_data.insert(key, row.clone());
                rows += 1;
            }
        }
        (prices, news, rows)
    }

    pub fn latest_price(&self, symbol: &str) -> Option<&PriceBar> {
        self.prices.get(symbol).and_then(|m| m.values().next_back())
    }
}

/// Stable key for a news item: url when present, else symbol + title.
pub fn news_key(item: &NewsItem) -> String {
    let basis = match item.url.as_deref().filter(|u| !u.trim().is_empty()) {
        Some(u) => u.trim().to_string(),
        None => format!("{}\n{}", item.symbol, item.title.trim()),
    };
    let digest = Sha256::digest(basis.as_bytes());
    let mut out = String::with_capacity(64);
    for b in digest.iter() {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

/// Hand docs to the indexer grouped by symbol. Returns docs indexed.
pub async fn index_docs(docs: &[RagDoc], opts: &ApplyOptions) -> usize {
    if !opts.enable_rag || docs.is_empty() {
        return 0;
    }
    let Some(rag) = &opts.rag else {
        return 0;
    };
    let mut by_symbol: BTreeMap<&str, Vec<RagDoc>> = BTreeMap::new();
    for d in docs {
        by_symbol.entry(d.symbol.as_str()).or_default().push(d.clone());
    }
    let mut indexed = 0;
    for (symbol, group) in by_symbol {
        match rag.index(symbol, &group).await {
            Ok(()) => indexed += group.len(),
            Err(e) => warn!(target: "ingest", %symbol, error = ?e, "rag index failed"),
        }
    }
    indexed
}

/// In-memory store implementing every persistence contract.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    runs: Mutex<Vec<RunRecord>>,
    rag: Mutex<BTreeMap<String, Vec<RagDoc>>>,
    apply_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_calls(&self) -> usize {
        self.apply_calls.load(Ordering::SeqCst)
    }

    pub fn tables(&self) -> Tables {
        self.tables.lock().clone()
    }

    pub fn runs(&self) -> Vec<RunRecord> {
        self.runs.lock().clone()
    }

    pub fn indexed_docs(&self, symbol: &str) -> Vec<RagDoc> {
        self.rag.lock().get(symbol).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl PersistenceApplier for MemoryStore {
    async fn apply(
        &self,
        result: &IngestionResult,
        _started_at_ms: i64,
        opts: &ApplyOptions,
    ) -> Result<PersistSummary> {
        let t0 = Instant::now();
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        let (prices, news, provider_data) = self.tables.lock().upsert(result);
        let rag_docs = index_docs(&result.docs, opts).await;
        Ok(PersistSummary {
            prices,
            news,
            provider_data,
            rag_docs,
            duration_ms: t0.elapsed().as_millis() as u64,
        })
    }
}

#[async_trait]
impl RunLog for MemoryStore {
    async fn record(&self, rec: RunRecord) -> Result<()> {
        self.runs.lock().push(rec);
        Ok(())
    }

    async fn recent(&self, provider_id: &str, limit: usize) -> Result<Vec<RunRecord>> {
        Ok(recent_of(&self.runs.lock(), provider_id, limit))
    }

    async fn last_success(&self, provider_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(last_success_of(&self.runs.lock(), provider_id))
    }
}

#[async_trait]
impl RagIndexer for MemoryStore {
    async fn index(&self, symbol: &str, docs: &[RagDoc]) -> Result<()> {
        let mut rag = self.rag.lock();
        let slot = rag.entry(symbol.to_string()).or_default();
        for d in docs {
            if !slot.iter().any(|x| x.id == d.id) {
                slot.push(d.clone());
            }
        }
        Ok(())
    }
}

/// Most-recent-first view over an append-ordered run list.
pub(crate) fn recent_of(runs: &[RunRecord], provider_id: &str, limit: usize) -> Vec<RunRecord> {
    runs.iter()
        .rev()
        .filter(|r| r.provider_id == provider_id)
        .take(limit)
        .cloned()
        .collect()
}

pub(crate) fn last_success_of(runs: &[RunRecord], provider_id: &str) -> Option<DateTime<Utc>> {
    runs.iter()
        .rev()
        .find(|r| r.provider_id == provider_id && r.status == RunStatus::Success)
        .map(|r| r.started_at)
}
