// tests/ingest_e2e.rs
//
// Full wiring as the binary does it: sample config, file store, RAG files and
// the persisted provider state surviving a restart.

use market_ingest::ingest::config::{load_providers_from, load_universe_from, IngestSettings};
use market_ingest::ingest::persist::RunLog;
use market_ingest::ingest::store::JsonFileStore;
use market_ingest::ingest::types::RunRequest;
use market_ingest::{build_manager, RunError};
use std::path::Path;

fn sample() -> (Vec<market_ingest::ingest::config::ProviderConfigEntry>, Vec<String>) {
    (
        load_providers_from(Path::new("config/providers.toml")).unwrap(),
        load_universe_from(Path::new("config/instruments.toml")).unwrap(),
    )
}

#[serial_test::serial]
#[tokio::test]
async fn sample_config_runs_and_persists_to_disk() {
    let data = tempfile::tempdir().unwrap();
    let (providers, universe) = sample();
    let m = build_manager(data.path(), IngestSettings::default(), providers, universe).unwrap();

    assert_eq!(m.registry().ids(), vec!["demo-fixture", "quotes-http"]);
    assert!(!m.registry().is_enabled("quotes-http"));

    let out = m.run(RunRequest::new("demo-fixture")).await.unwrap();
    assert_eq!(out.result.symbols_tried, vec!["AAPL", "MSFT"]);
    assert_eq!(out.batches.len(), 2);
    assert_eq!(out.result.prices.len(), 3);
    let persisted = out.persisted.expect("persisted");
    assert_eq!(persisted.prices, 3);
    assert_eq!(persisted.provider_data, 1);
    assert_eq!(persisted.rag_docs, 1);

    assert!(data.path().join("tables.json").exists());
    assert!(data.path().join("runs.json").exists());
    let rag = std::fs::read_to_string(data.path().join("rag").join("AAPL.jsonl")).unwrap();
    assert_eq!(rag.lines().count(), 1);

    // reopen the store from disk
    let store = JsonFileStore::open(data.path()).unwrap();
    assert_eq!(store.tables().prices["AAPL"].len(), 2);
    assert_eq!(store.recent("demo-fixture", 10).await.unwrap().len(), 1);
    assert!(store.last_success("demo-fixture").await.unwrap().is_some());

    let err = m.run(RunRequest::new("quotes-http")).await.unwrap_err();
    assert!(matches!(err, RunError::ProviderDisabled { .. }));
}

#[serial_test::serial]
#[tokio::test]
async fn runtime_disable_survives_restart() {
    let data = tempfile::tempdir().unwrap();
    let (providers, universe) = sample();

    let m = build_manager(
        data.path(),
        IngestSettings::default(),
        providers.clone(),
        universe.clone(),
    )
    .unwrap();
    assert!(m.registry().disable("demo-fixture", "operator says no"));
    drop(m);

    let m = build_manager(data.path(), IngestSettings::default(), providers, universe).unwrap();
    assert!(!m.registry().is_enabled("demo-fixture"));
    match m.run(RunRequest::new("demo-fixture")).await {
        Err(RunError::ProviderDisabled { reason, .. }) => assert_eq!(reason, "operator says no"),
        other => panic!("expected disabled, got {other:?}"),
    }

    assert!(m.registry().enable("demo-fixture"));
    assert!(m.run(RunRequest::new("demo-fixture")).await.is_ok());
}
