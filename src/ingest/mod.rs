// src/ingest/mod.rs
pub mod config;
pub mod error;
pub mod gate;
pub mod persist;
pub mod provider_metrics;
pub mod providers;
pub mod rate_limiter;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod types;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use metrics::histogram;
use tracing::{debug, info, warn};

use crate::ingest::config::{normalize_symbols, IngestSettings};
use crate::ingest::error::RunError;
use crate::ingest::gate::ConcurrencyGate;
use crate::ingest::persist::{
    consecutive_failures, ApplyOptions, PersistenceApplier, RagIndexer, RunLog, RunRecord,
    RunStatus,
};
use crate::ingest::provider_metrics::{ItemCounts, ProviderMetrics};
use crate::ingest::registry::{ProviderRegistry, ResolvedProvider};
use crate::ingest::types::{
    AbortSignal, BatchMeta, IngestError, IngestionOptions, IngestionResult, PersistSummary,
    ProgressInfo, ProviderContext, RunOutcome, RunRequest,
};

/// Source of the full known-instrument list used when neither the request nor
/// the provider config names any symbols.
pub trait SymbolUniverse: Send + Sync {
    fn all_symbols(&self) -> Vec<String>;
}

impl SymbolUniverse for Vec<String> {
    fn all_symbols(&self) -> Vec<String> {
        self.clone()
    }
}

/// Pick the symbol list for a run: request, else provider config, else the
/// universe. Normalized, deduplicated in order, then truncated to `cap`
/// (0 = unlimited). Returns the list and how many symbols the cap dropped.
pub fn resolve_symbols(
    requested: Option<&[String]>,
    configured: &[String],
    universe: &dyn SymbolUniverse,
    cap: usize,
) -> (Vec<String>, usize) {
    let mut symbols = requested.map(normalize_symbols).unwrap_or_default();
    if symbols.is_empty() {
        symbols = normalize_symbols(configured);
    }
    if symbols.is_empty() {
        symbols = normalize_symbols(universe.all_symbols());
    }
    let mut dropped = 0;
    if cap > 0 && symbols.len() > cap {
        dropped = symbols.len() - cap;
        symbols.truncate(cap);
    }
    (symbols, dropped)
}

/// Split into ordered batches of `batch_size`. No batching (a single batch)
/// when `batch_size` is 0 or the list already fits.
pub fn plan_batches(symbols: &[String], batch_size: usize) -> Vec<Vec<String>> {
    if symbols.is_empty() {
        return Vec::new();
    }
    if batch_size == 0 || symbols.len() <= batch_size {
        return vec![symbols.to_vec()];
    }
    symbols.chunks(batch_size).map(|c| c.to_vec()).collect()
}

/// Fold one batch result into the running aggregate by concatenation.
/// `symbols_tried` stays as resolved for the whole run.
pub fn merge(mut acc: IngestionResult, batch: IngestionResult) -> IngestionResult {
    acc.prices.extend(batch.prices);
    acc.news.extend(batch.news);
    acc.docs.extend(batch.docs);
    acc.provider_data.extend(batch.provider_data);
    acc.errors.extend(batch.errors);
    for (k, v) in batch.meta {
        acc.meta.insert(k, v);
    }
    acc
}

/// Credit `duration_ms / symbols.len()` to every symbol of a batch.
pub fn distribute_timing(timings: &mut BTreeMap<String, f64>, symbols: &[String], duration_ms: u64) {
    if symbols.is_empty() {
        return;
    }
    let share = duration_ms as f64 / symbols.len() as f64;
    for s in symbols {
        *timings.entry(s.clone()).or_insert(0.0) += share;
    }
}

/// The orchestrator. Construct once, share by `Arc`.
pub struct IngestionManager {
    registry: Arc<ProviderRegistry>,
    metrics: Arc<ProviderMetrics>,
    applier: Arc<dyn PersistenceApplier>,
    run_log: Arc<dyn RunLog>,
    rag: Option<Arc<dyn RagIndexer>>,
    universe: Arc<dyn SymbolUniverse>,
    gate: ConcurrencyGate,
    settings: IngestSettings,
}

impl IngestionManager {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        metrics: Arc<ProviderMetrics>,
        applier: Arc<dyn PersistenceApplier>,
        run_log: Arc<dyn RunLog>,
        settings: IngestSettings,
    ) -> Self {
        Self {
            registry,
            metrics,
            applier,
            run_log,
            rag: None,
            universe: Arc::new(Vec::<String>::new()),
            gate: ConcurrencyGate::new(settings.concurrency),
            settings,
        }
    }

    pub fn with_universe(mut self, universe: Arc<dyn SymbolUniverse>) -> Self {
        self.universe = universe;
        self
    }

    pub fn with_rag(mut self, rag: Arc<dyn RagIndexer>) -> Self {
        self.rag = Some(rag);
        self
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<ProviderMetrics> {
        &self.metrics
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    pub fn settings(&self) -> &IngestSettings {
        &self.settings
    }

    /// Run one provider end to end. Only unknown/disabled providers error.
    pub async fn run(&self, req: RunRequest) -> Result<RunOutcome, RunError> {
        self.execute(req, None::<fn(&ProgressInfo)>, None).await
    }

    /// Like `run`, reporting after every batch. `abort` is checked at batch
    /// boundaries only; a batch already in flight finishes.
    pub async fn run_with_progress<F>(
        &self,
        req: RunRequest,
        on_progress: F,
        abort: &AbortSignal,
    ) -> Result<RunOutcome, RunError>
    where
        F: FnMut(&ProgressInfo) + Send,
    {
        self.execute(req, Some(on_progress), Some(abort)).await
    }

    async fn execute<F>(
        &self,
        req: RunRequest,
        mut on_progress: Option<F>,
        abort: Option<&AbortSignal>,
    ) -> Result<RunOutcome, RunError>
    where
        F: FnMut(&ProgressInfo) + Send,
    {
        let run_t0 = Instant::now();
        let resolved = self.registry.resolve(&req.provider_id)?;
        let provider_id = resolved.config.id.clone();

        let (symbols, dropped) = resolve_symbols(
            req.symbols.as_deref(),
            &resolved.config.symbols,
            self.universe.as_ref(),
            self.settings.max_symbols_per_run,
        );
        if dropped > 0 {
            info!(
                target: "ingest",
                provider = %provider_id,
                kept = symbols.len(),
                dropped,
                "symbol list truncated by MAX_SYMBOLS_PER_RUN"
            );
        }

        let batch_size = self
            .settings
            .batch_size_override
            .or(resolved.config.batch_size)
            .unwrap_or(0);
        let batches = plan_batches(&symbols, batch_size);
        let batched = batches.len() > 1;
        let total_batches = batches.len();

        let rag_enabled = req.rag.unwrap_or(resolved.config.rag_enabled);
        let api_key = req.api_key.clone().or_else(|| resolved.config.api_key());

        let permit = self.gate.acquire().await;
        let since = match req.since {
            Some(s) => Some(s),
            None => match self.run_log.last_success(&provider_id).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(target: "ingest", provider = %provider_id, error = ?e, "could not read last success");
                    None
                }
            },
        };
        let started_at = Utc::now();
        info!(
            target: "ingest",
            provider = %provider_id,
            symbols = symbols.len(),
            batches = total_batches,
            dry_run = req.dry_run,
            "ingest run started"
        );

        let mut acc = IngestionResult::empty(&provider_id, started_at);
        acc.symbols_tried = symbols.clone();
        let mut metas: Vec<BatchMeta> = Vec::with_capacity(total_batches);
        let mut timings: BTreeMap<String, f64> = BTreeMap::new();
        let mut aborted = false;

        for (batch_index, batch) in batches.into_iter().enumerate() {
            if abort.is_some_and(|a| a.is_aborted()) {
                aborted = true;
                info!(target: "ingest", provider = %provider_id, batch_index, "run aborted before batch");
                break;
            }

            let opts = IngestionOptions {
                symbols: batch.clone(),
                rag_enabled,
                dry_run: req.dry_run,
                api_key: api_key.clone(),
                since,
            };
            let t0 = Instant::now();
            let out = self.ingest_batch(&resolved, batch_index, &opts).await;
            let duration_ms = t0.elapsed().as_millis() as u64;
            histogram!("ingest_batch_duration_ms", "provider" => provider_id.clone())
                .record(duration_ms as f64);
            debug!(
                target: "ingest",
                provider = %provider_id,
                batch_index,
                size = batch.len(),
                duration_ms,
                errors = out.errors.len(),
                "batch done"
            );

            acc = merge(acc, out);
            distribute_timing(&mut timings, &batch, duration_ms);
            let meta = BatchMeta {
                batch_index,
                batch_size: batch.len(),
                duration_ms,
                symbols: batch,
            };

            if let Some(cb) = on_progress.as_mut() {
                cb(&ProgressInfo {
                    provider_id: provider_id.clone(),
                    batch_index,
                    total_batches: Some(total_batches),
                    batch_size: meta.batch_size,
                    duration_ms,
                    symbols: meta.symbols.clone(),
                    aggregate: acc.counts(metas.len() + 1),
                    finished: false,
                    aborted: false,
                });
            }
            metas.push(meta);
        }
        drop(permit);

        acc.finished_at = Some(Utc::now());
        acc.meta.insert("batchSize".into(), batch_size.into());
        acc.meta.insert("dryRun".into(), req.dry_run.into());
        if aborted {
            acc.meta.insert("aborted".into(), true.into());
        }

        let mut persisted: Option<PersistSummary> = None;
        let mut disabled: Option<String> = None;
        if !req.dry_run {
            persisted = self.persist(&mut acc, rag_enabled).await;
            disabled = self.record_and_evaluate(&resolved, &acc, aborted).await;
        }

        let status = RunStatus::of_run(&acc, aborted);
        let items = match &persisted {
            Some(s) => ItemCounts {
                prices: s.prices as u64,
                news: s.news as u64,
                provider_data: s.provider_data as u64,
                rag_docs: s.rag_docs as u64,
            },
            None => ItemCounts {
                prices: acc.prices.len() as u64,
                news: acc.news.len() as u64,
                provider_data: acc.provider_data.len() as u64,
                rag_docs: 0,
            },
        };
        let run_ms = run_t0.elapsed().as_millis() as u64;

        let executed = metas.len();
        if !batched {
            metas.clear();
            timings.clear();
        }
        if !req.dry_run {
            self.metrics.record(&provider_id, !status.is_failure(), run_ms, items);
            self.metrics.record_symbol_timings(&provider_id, &timings);
        }

        if let Some(cb) = on_progress.as_mut() {
            cb(&ProgressInfo {
                provider_id: provider_id.clone(),
                batch_index: total_batches.saturating_sub(1),
                total_batches: Some(total_batches),
                batch_size: 0,
                duration_ms: run_ms,
                symbols: Vec::new(),
                aggregate: acc.counts(executed),
                finished: true,
                aborted,
            });
        }

        info!(
            target: "ingest",
            provider = %provider_id,
            status = ?status,
            prices = acc.prices.len(),
            news = acc.news.len(),
            provider_data = acc.provider_data.len(),
            errors = acc.errors.len(),
            duration_ms = run_ms,
            aborted,
            "ingest run finished"
        );

        Ok(RunOutcome {
            result: acc,
            batches: metas,
            symbol_timings: timings,
            persisted,
            disabled,
            aborted,
        })
    }

    /// One batch under the provider's limiter and retry policy. Never fails:
    /// retry exhaustion becomes a soft error on the returned result.
    async fn ingest_batch(
        &self,
        resolved: &ResolvedProvider,
        batch_index: usize,
        opts: &IngestionOptions,
    ) -> IngestionResult {
        let base = ProviderContext::new(resolved.config.clone());
        let policy = base.retry;
        let provider_id = &resolved.config.id;
        let mut attempt: u32 = 0;
        loop {
            resolved.rate_limiter.acquire().await;
            let ctx = base.clone().with_attempt(attempt);
            match resolved.provider.ingest(&ctx, opts).await {
                Ok(mut r) => {
                    for e in r.errors.iter_mut() {
                        e.batch_index.get_or_insert(batch_index);
                    }
                    return r;
                }
                Err(e) => {
                    let transient = e.is_transient();
                    if policy.should_retry(attempt, transient) {
                        let wait = policy.backoff(attempt);
                        warn!(
                            target: "ingest",
                            provider = %provider_id,
                            batch_index,
                            attempt,
                            wait_ms = wait.as_millis() as u64,
                            error = %e,
                            "transient provider failure, retrying"
                        );
                        tokio::time::sleep(wait).await;
                        attempt += 1;
                        continue;
                    }
                    warn!(
                        target: "ingest",
                        provider = %provider_id,
                        batch_index,
                        attempts = attempt + 1,
                        transient,
                        error = %e,
                        "provider batch failed"
                    );
                    let mut r = IngestionResult::empty(provider_id, Utc::now());
                    r.errors.push(e.into_soft(batch_index));
                    return r;
                }
            }
        }
    }

    async fn persist(&self, acc: &mut IngestionResult, rag_enabled: bool) -> Option<PersistSummary> {
        let opts = ApplyOptions {
            enable_rag: rag_enabled,
            rag: self.rag.clone(),
        };
        let started_ms = acc.started_at.timestamp_millis();
        let applied = self.applier.apply(acc, started_ms, &opts).await;
        match applied {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!(target: "ingest", provider = %acc.provider_id, error = ?e, "persistence failed");
                acc.errors.push(IngestError::new(format!("persistence failed: {e:#}")));
                None
            }
        }
    }

    /// Write the run record, then re-read the trailing window and disable the
    /// provider when its consecutive failures reach the threshold. An aborted
    /// run is recorded but never triggers a disable.
    async fn record_and_evaluate(
        &self,
        resolved: &ResolvedProvider,
        acc: &IngestionResult,
        aborted: bool,
    ) -> Option<String> {
        let id = &resolved.config.id;
        if let Err(e) = self.run_log.record(RunRecord::from_result(acc, aborted)).await {
            warn!(target: "ingest", provider = %id, error = ?e, "could not record run");
        }
        if aborted {
            return None;
        }

        let threshold = resolved.config.disable_on_failures.filter(|n| *n > 0)?;
        let recent = match self.run_log.recent(id, threshold as usize + 2).await {
            Ok(r) => r,
            Err(e) => {
                warn!(target: "ingest", provider = %id, error = ?e, "could not read run history");
                return None;
            }
        };
        let failures = consecutive_failures(&recent);
        if failures < threshold {
            return None;
        }
        let reason = format!("{failures} consecutive failed runs (threshold {threshold})");
        self.registry.disable(id, reason.clone()).then_some(reason)
    }
}
