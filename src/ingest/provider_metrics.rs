// src/ingest/provider_metrics.rs
//! Process-lifetime counters per provider. Never persisted, reset on restart.
//!
//! Every `record` is mirrored into the `metrics` facade so the Prometheus
//! exporter sees the same numbers.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, histogram};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// One-time metrics registration (so series show up on /metrics).
pub(crate) fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ingest_runs_total", "Provider runs completed.");
        describe_counter!(
            "ingest_run_failures_total",
            "Provider runs that produced errors and no data."
        );
        describe_counter!("ingest_items_total", "Items ingested, labelled by kind.");
        describe_counter!(
            "ingest_provider_disabled_total",
            "Providers taken out of rotation."
        );
        describe_histogram!("ingest_run_duration_ms", "Run duration in milliseconds.");
        describe_histogram!("ingest_batch_duration_ms", "Batch duration in milliseconds.");
        describe_gauge!("ingest_gate_active", "Runs currently holding a gate slot.");
    });
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ItemCounts {
    pub prices: u64,
    pub news: u64,
    pub provider_data: u64,
    pub rag_docs: u64,
}

impl ItemCounts {
    fn add(&mut self, other: ItemCounts) {
        self.prices += other.prices;
        self.news += other.news;
        self.provider_data += other.provider_data;
        self.rag_docs += other.rag_docs;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderMetricSample {
    pub provider_id: String,
    pub runs: u64,
    pub successes: u64,
    pub failures: u64,
    pub items: ItemCounts,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_duration_ms: u64,
    pub avg_duration_ms: f64,
    pub total_duration_ms: u64,
}

impl ProviderMetricSample {
    fn new(provider_id: &str) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            runs: 0,
            successes: 0,
            failures: 0,
            items: ItemCounts::default(),
            last_run_at: None,
            last_duration_ms: 0,
            avg_duration_ms: 0.0,
            total_duration_ms: 0,
        }
    }
}

#[derive(Default)]
struct Inner {
    samples: HashMap<String, ProviderMetricSample>,
    /// provider -> symbol -> accumulated ms
    symbol_ms: HashMap<String, BTreeMap<String, f64>>,
}

/// Purely additive bookkeeping; `record` never blocks beyond a short lock and
/// never fails.
#[derive(Default)]
pub struct ProviderMetrics {
    inner: Mutex<Inner>,
}

impl ProviderMetrics {
    pub fn new() -> Self {
        ensure_metrics_described();
        Self::default()
    }

    pub fn record(&self, provider_id: &str, ok: bool, duration_ms: u64, items: ItemCounts) {
        {
            let mut inner = self.inner.lock();
            let s = inner
                .samples
                .entry(provider_id.to_string())
                .or_insert_with(|| ProviderMetricSample::new(provider_id));
            s.runs += 1;
            if ok {
                s.successes += 1;
            } else {
                s.failures += 1;
            }
            s.items.add(items);
            s.last_run_at = Some(Utc::now());
            s.last_duration_ms = duration_ms;
            s.total_duration_ms += duration_ms;
            s.avg_duration_ms = s.total_duration_ms as f64 / s.runs as f64;
        }

        let p = provider_id.to_string();
        counter!("ingest_runs_total", "provider" => p.clone()).increment(1);
        if !ok {
            counter!("ingest_run_failures_total", "provider" => p.clone()).increment(1);
        }
        for (kind, n) in [
            ("prices", items.prices),
            ("news", items.news),
            ("provider_data", items.provider_data),
            ("rag_docs", items.rag_docs),
        ] {
            if n > 0 {
                counter!("ingest_items_total", "provider" => p.clone(), "kind" => kind).increment(n);
            }
        }
        histogram!("ingest_run_duration_ms", "provider" => p).record(duration_ms as f64);
    }

    /// Add per-symbol timings from one run; accumulates across runs.
    pub fn record_symbol_timings(&self, provider_id: &str, timings: &BTreeMap<String, f64>) {
        if timings.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        let acc = inner.symbol_ms.entry(provider_id.to_string()).or_default();
        for (sym, ms) in timings {
            *acc.entry(sym.clone()).or_insert(0.0) += ms;
        }
    }

    pub fn symbol_timings(&self, provider_id: &str) -> BTreeMap<String, f64> {
        self.inner
            .lock()
            .symbol_ms
            .get(provider_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn get(&self, provider_id: &str) -> Option<ProviderMetricSample> {
        self.inner.lock().samples.get(provider_id).cloned()
    }

    /// Snapshot for every provider seen so far, sorted by id.
    pub fn list(&self) -> Vec<ProviderMetricSample> {
        let mut out: Vec<_> = self.inner.lock().samples.values().cloned().collect();
        out.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        out
    }
}
