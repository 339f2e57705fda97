// tests/ingest_scheduler.rs
use std::sync::Arc;

use market_ingest::ingest::config::{IngestSettings, ProviderConfigEntry};
use market_ingest::ingest::persist::MemoryStore;
use market_ingest::ingest::provider_metrics::ProviderMetrics;
use market_ingest::ingest::providers::fixture::FixtureProvider;
use market_ingest::ingest::registry::ProviderRegistry;
use market_ingest::ingest::scheduler::{spawn_scheduler, tick, IngestSchedulerCfg};
use market_ingest::ingest::IngestionManager;

const FIXTURE: &str = include_str!("fixtures/prices.json");

fn manager() -> (Arc<IngestionManager>, Arc<MemoryStore>) {
    let registry = Arc::new(ProviderRegistry::new());
    for id in ["fx-a", "fx-b", "fx-off"] {
        let p = FixtureProvider::from_fixture_str(id, FIXTURE).unwrap();
        let mut cfg = ProviderConfigEntry::new(id);
        cfg.kind = "fixture".into();
        cfg.symbols = p.symbols();
        cfg.enabled = id != "fx-off";
        registry.register(Arc::new(p), cfg);
    }
    let store = Arc::new(MemoryStore::new());
    let m = IngestionManager::new(
        registry,
        Arc::new(ProviderMetrics::new()),
        store.clone(),
        store.clone(),
        IngestSettings::default(),
    );
    (Arc::new(m), store)
}

#[tokio::test]
async fn tick_runs_every_enabled_provider_once() {
    let (m, store) = manager();
    let ran = tick(&m, &[]).await;
    assert_eq!(ran, 2);

    let runs = store.runs();
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.provider_id != "fx-off"));
    assert!(m.metrics().get("fx-off").is_none());
}

#[tokio::test]
async fn tick_with_explicit_list_skips_others_and_unknown() {
    let (m, store) = manager();
    let ran = tick(&m, &["fx-b".to_string(), "ghost".to_string()]).await;
    assert_eq!(ran, 1);
    assert_eq!(store.runs()[0].provider_id, "fx-b");
}

#[tokio::test(start_paused = true)]
async fn scheduler_loop_fires_on_interval() {
    let (m, store) = manager();
    let handle = spawn_scheduler(
        m.clone(),
        IngestSchedulerCfg {
            interval_secs: 60,
            providers: vec!["fx-a".into()],
        },
    );

    // first tick is immediate, then one per interval
    tokio::time::sleep(std::time::Duration::from_secs(61)).await;
    handle.abort();
    assert_eq!(store.runs().len(), 2);
}
