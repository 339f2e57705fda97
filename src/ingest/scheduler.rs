// src/ingest/scheduler.rs
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::task::JoinHandle;

use crate::ingest::error::RunError;
use crate::ingest::types::RunRequest;
use crate::ingest::IngestionManager;

#[derive(Clone, Debug)]
pub struct IngestSchedulerCfg {
    pub interval_secs: u64,
    /// Empty = every registered provider.
    pub providers: Vec<String>,
}

/// Trigger one run per enabled provider, all at once. The manager's global
/// gate decides how many actually execute concurrently.
pub async fn tick(manager: &Arc<IngestionManager>, providers: &[String]) -> usize {
    let ids = if providers.is_empty() {
        manager.registry().ids()
    } else {
        providers.to_vec()
    };

    let mut handles = Vec::new();
    for id in ids {
        if !manager.registry().is_enabled(&id) {
            tracing::debug!(target: "ingest", provider = %id, "scheduler skips disabled provider");
            continue;
        }
        let m = manager.clone();
        handles.push(tokio::spawn(async move {
            match m.run(RunRequest::new(id.clone())).await {
                Ok(out) => {
                    if let Some(reason) = out.disabled {
                        tracing::warn!(target: "ingest", provider = %id, %reason, "auto-disabled after scheduled run");
                    }
                    true
                }
                // raced with a disable between the check and the run
                Err(RunError::ProviderDisabled { .. }) => false,
                Err(e) => {
                    tracing::warn!(target: "ingest", provider = %id, error = %e, "scheduled run rejected");
                    false
                }
            }
        }));
    }

    let mut started = 0;
    for h in handles {
        match h.await {
            Ok(true) => started += 1,
            Ok(false) => {}
            Err(e) => tracing::warn!(target: "ingest", error = %e, "scheduled run panicked"),
        }
    }
    started
}

/// Spawn a cron-like loop calling [`tick`] every `interval_secs`.
pub fn spawn_scheduler(manager: Arc<IngestionManager>, cfg: IngestSchedulerCfg) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(cfg.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let ran = tick(&manager, &cfg.providers).await;
            counter!("ingest_scheduler_ticks_total").increment(1);
            tracing::info!(target: "ingest", runs = ran, "scheduled ingest tick");
        }
    })
}
