// tests/ingest_concurrency.rs
//
// Global gate, per-provider pacing, retry/backoff and batch-level abort.
// Timing-sensitive cases run on tokio's paused clock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use market_ingest::ingest::config::{IngestSettings, ProviderConfigEntry};
use market_ingest::ingest::error::ProviderError;
use market_ingest::ingest::persist::MemoryStore;
use market_ingest::ingest::provider_metrics::ProviderMetrics;
use market_ingest::ingest::registry::ProviderRegistry;
use market_ingest::ingest::types::{
    AbortSignal, IngestionOptions, IngestionResult, PriceBar, ProgressInfo, Provider,
    ProviderContext, RunRequest,
};
use market_ingest::ingest::IngestionManager;

fn bar(symbol: &str) -> PriceBar {
    PriceBar {
        symbol: symbol.to_string(),
        ts: 1,
        open: 1.0,
        high: 1.0,
        low: 1.0,
        close: 1.0,
        volume: None,
    }
}

fn ok_result(id: &str, opts: &IngestionOptions) -> IngestionResult {
    let mut r = IngestionResult::empty(id, Utc::now());
    r.symbols_tried = opts.symbols.clone();
    r.prices = opts.symbols.iter().map(|s| bar(s)).collect();
    r
}

fn manager_with(
    providers: Vec<(Arc<dyn Provider>, ProviderConfigEntry)>,
    concurrency: usize,
) -> Arc<IngestionManager> {
    let registry = Arc::new(ProviderRegistry::new());
    for (p, c) in providers {
        registry.register(p, c);
    }
    let store = Arc::new(MemoryStore::new());
    let settings = IngestSettings {
        concurrency,
        ..Default::default()
    };
    Arc::new(IngestionManager::new(
        registry,
        Arc::new(ProviderMetrics::new()),
        store.clone(),
        store,
        settings,
    ))
}

// ---------- gate ----------

struct Slow {
    id: String,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl Provider for Slow {
    fn id(&self) -> &str {
        &self.id
    }

    async fn ingest(
        &self,
        _ctx: &ProviderContext,
        opts: &IngestionOptions,
    ) -> Result<IngestionResult, ProviderError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(ok_result(&self.id, opts))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn gate_caps_concurrent_runs_across_providers() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let providers: Vec<(Arc<dyn Provider>, ProviderConfigEntry)> = (0..5)
        .map(|i| {
            let id = format!("p{i}");
            let p: Arc<dyn Provider> = Arc::new(Slow {
                id: id.clone(),
                in_flight: in_flight.clone(),
                peak: peak.clone(),
            });
            (p, ProviderConfigEntry::new(id))
        })
        .collect();
    let manager = manager_with(providers, 2);
    assert_eq!(manager.gate().capacity(), 2);

    let mut handles = Vec::new();
    for i in 0..5 {
        let m = manager.clone();
        handles.push(tokio::spawn(async move {
            m.run(RunRequest::new(format!("p{i}")).symbols(["AAA"])).await
        }));
    }
    for h in handles {
        let out = h.await.expect("join").expect("run");
        assert_eq!(out.result.prices.len(), 1);
    }

    let peak = peak.load(Ordering::SeqCst);
    assert!(peak <= 2, "peak concurrency {peak} exceeded the gate");
    assert!(peak >= 1);
    assert_eq!(manager.gate().active(), 0);
}

// ---------- retry ----------

struct FailFirst {
    id: String,
    failures: usize,
    transient: bool,
    calls: AtomicUsize,
}

#[async_trait]
impl Provider for FailFirst {
    fn id(&self) -> &str {
        &self.id
    }

    async fn ingest(
        &self,
        ctx: &ProviderContext,
        opts: &IngestionOptions,
    ) -> Result<IngestionResult, ProviderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(ctx.attempt as usize, n);
        if n < self.failures {
            return Err(if self.transient {
                ProviderError::Transient(format!("attempt {n} timed out"))
            } else {
                ProviderError::Validation("unknown symbol".into())
            });
        }
        Ok(ok_result(&self.id, opts))
    }
}

fn fail_first(failures: usize, transient: bool) -> Arc<FailFirst> {
    Arc::new(FailFirst {
        id: "retry".into(),
        failures,
        transient,
        calls: AtomicUsize::new(0),
    })
}

fn retry_cfg(max_retries: u32) -> ProviderConfigEntry {
    let mut c = ProviderConfigEntry::new("retry");
    c.max_retries = max_retries;
    c.backoff_base_ms = 500;
    c
}

#[tokio::test(start_paused = true)]
async fn transient_errors_are_retried_with_backoff() {
    let p = fail_first(2, true);
    let manager = manager_with(vec![(p.clone() as Arc<dyn Provider>, retry_cfg(2))], 2);

    let t0 = tokio::time::Instant::now();
    let out = manager
        .run(RunRequest::new("retry").symbols(["AAA"]))
        .await
        .unwrap();

    assert_eq!(p.calls.load(Ordering::SeqCst), 3);
    assert!(out.result.errors.is_empty());
    assert_eq!(out.result.prices.len(), 1);
    // 500ms + 1000ms of backoff
    assert!(t0.elapsed() >= Duration::from_millis(1_500));
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_become_a_soft_error() {
    let p = fail_first(10, true);
    let manager = manager_with(vec![(p.clone() as Arc<dyn Provider>, retry_cfg(2))], 2);

    let out = manager
        .run(RunRequest::new("retry").symbols(["AAA"]))
        .await
        .unwrap();

    assert_eq!(p.calls.load(Ordering::SeqCst), 3);
    assert_eq!(out.result.errors.len(), 1);
    let e = &out.result.errors[0];
    assert!(e.transient);
    assert_eq!(e.batch_index, Some(0));
    assert!(e.message.contains("timed out"));
}

#[tokio::test(start_paused = true)]
async fn validation_errors_are_not_retried() {
    let p = fail_first(1, false);
    let manager = manager_with(vec![(p.clone() as Arc<dyn Provider>, retry_cfg(3))], 2);

    let t0 = tokio::time::Instant::now();
    let out = manager
        .run(RunRequest::new("retry").symbols(["AAA"]))
        .await
        .unwrap();

    assert_eq!(p.calls.load(Ordering::SeqCst), 1);
    assert_eq!(out.result.errors.len(), 1);
    assert!(!out.result.errors[0].transient);
    assert!(t0.elapsed() < Duration::from_millis(500));
}

// ---------- pacing ----------

struct Counting {
    calls: AtomicUsize,
}

#[async_trait]
impl Provider for Counting {
    fn id(&self) -> &str {
        "paced"
    }

    async fn ingest(
        &self,
        _ctx: &ProviderContext,
        opts: &IngestionOptions,
    ) -> Result<IngestionResult, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ok_result("paced", opts))
    }
}

#[tokio::test(start_paused = true)]
async fn batches_are_paced_by_the_provider_rate_limit() {
    let p = Arc::new(Counting {
        calls: AtomicUsize::new(0),
    });
    let mut c = ProviderConfigEntry::new("paced");
    c.rate_limit_rpm = Some(60);
    c.batch_size = Some(1);
    let manager = manager_with(vec![(p.clone() as Arc<dyn Provider>, c)], 2);

    let t0 = tokio::time::Instant::now();
    let out = manager
        .run(RunRequest::new("paced").symbols(["A", "B", "C"]))
        .await
        .unwrap();

    assert_eq!(p.calls.load(Ordering::SeqCst), 3);
    assert_eq!(out.batches.len(), 3);
    // one token up front, then one per second
    assert!(t0.elapsed() >= Duration::from_secs(2));
}

// ---------- progress / abort ----------

#[tokio::test]
async fn progress_fires_per_batch_and_abort_stops_at_boundary() {
    let p = Arc::new(Counting {
        calls: AtomicUsize::new(0),
    });
    let mut c = ProviderConfigEntry::new("paced");
    c.batch_size = Some(1);
    let manager = manager_with(vec![(p.clone() as Arc<dyn Provider>, c)], 2);

    let abort = AbortSignal::new();
    let trigger = abort.clone();
    let mut events: Vec<ProgressInfo> = Vec::new();
    let out = manager
        .run_with_progress(
            RunRequest::new("paced").symbols(["A", "B", "C", "D"]),
            |info: &ProgressInfo| {
                if info.batch_index == 1 && !info.finished {
                    trigger.abort();
                }
                events.push(info.clone());
            },
            &abort,
        )
        .await
        .unwrap();

    assert_eq!(p.calls.load(Ordering::SeqCst), 2);
    assert!(out.aborted);
    assert_eq!(out.result.prices.len(), 2);
    assert_eq!(out.result.meta.get("aborted"), Some(&serde_json::Value::Bool(true)));

    assert_eq!(events.len(), 3);
    assert_eq!(events[0].batch_index, 0);
    assert_eq!(events[0].total_batches, Some(4));
    assert_eq!(events[0].aggregate.prices, 1);
    assert_eq!(events[1].aggregate.batches, 2);
    let last = events.last().unwrap();
    assert!(last.finished);
    assert!(last.aborted);
    assert_eq!(last.aggregate.batches, 2);
}
