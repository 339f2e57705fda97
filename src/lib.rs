// src/lib.rs
// Public library surface for the binary and the integration tests.

pub mod api;
pub mod ingest;
pub mod metrics;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

pub use crate::api::{app_router, create_router, AppState};
pub use crate::ingest::error::{ProviderError, RunError};
pub use crate::ingest::types::{IngestionResult, Provider, RunOutcome, RunRequest};
pub use crate::ingest::IngestionManager;

use crate::ingest::config::{
    data_dir_from_env, load_providers_default, load_universe_default, IngestSettings,
    ProviderConfigEntry,
};
use crate::ingest::provider_metrics::ProviderMetrics;
use crate::ingest::providers::build_provider;
use crate::ingest::registry::ProviderRegistry;
use crate::ingest::store::{FileRagIndexer, JsonFileStore};

/// Register every buildable provider. Entries whose adapter cannot be built
/// are logged and skipped so one bad entry does not take the service down.
pub fn register_providers(registry: &ProviderRegistry, entries: Vec<ProviderConfigEntry>) -> usize {
    let mut registered = 0;
    for entry in entries {
        match build_provider(&entry) {
            Ok(p) => {
                registry.register(p, entry);
                registered += 1;
            }
            Err(e) => warn!(target: "ingest", provider = %entry.id, error = %e, "provider skipped"),
        }
    }
    registered
}

/// What a config reload did, by provider id.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ReloadReport {
    /// Already registered; config replaced in place.
    pub updated: Vec<String>,
    /// New in the file and registered now.
    pub added: Vec<String>,
    /// New in the file, but the adapter could not be built.
    pub skipped: Vec<String>,
}

/// Apply a freshly loaded provider list. Registered providers keep their
/// adapter and runtime disable; new ids are built and registered. Providers
/// missing from `entries` are left alone.
pub fn reload_providers(registry: &ProviderRegistry, entries: Vec<ProviderConfigEntry>) -> ReloadReport {
    let unknown: HashSet<String> = registry.reload(entries.clone()).into_iter().collect();
    let mut report = ReloadReport::default();
    for entry in entries {
        if !unknown.contains(&entry.id) {
            report.updated.push(entry.id);
            continue;
        }
        match build_provider(&entry) {
            Ok(p) => {
                report.added.push(entry.id.clone());
                registry.register(p, entry);
            }
            Err(e) => {
                warn!(target: "ingest", provider = %entry.id, error = %e, "provider skipped on reload");
                report.skipped.push(entry.id);
            }
        }
    }
    info!(
        target: "ingest",
        updated = report.updated.len(),
        added = report.added.len(),
        skipped = report.skipped.len(),
        "provider config reloaded"
    );
    report
}

/// Wire a manager with file-backed persistence rooted at `data_dir`.
pub fn build_manager(
    data_dir: &Path,
    settings: IngestSettings,
    providers: Vec<ProviderConfigEntry>,
    universe: Vec<String>,
) -> Result<Arc<IngestionManager>> {
    let registry = ProviderRegistry::with_state_file(data_dir.join("provider_state.json"))
        .context("loading provider state")?;
    let registered = register_providers(&registry, providers);

    let store = Arc::new(JsonFileStore::open(data_dir)?);
    let rag = Arc::new(FileRagIndexer::new(data_dir.join("rag")));

    info!(
        target: "ingest",
        providers = registered,
        universe = universe.len(),
        concurrency = settings.concurrency,
        data_dir = %data_dir.display(),
        "ingestion manager ready"
    );

    let manager = IngestionManager::new(
        Arc::new(registry),
        Arc::new(ProviderMetrics::new()),
        store.clone(),
        store,
        settings,
    )
    .with_universe(Arc::new(universe))
    .with_rag(rag);
    Ok(Arc::new(manager))
}

/// Same as [`build_manager`], with everything read from env + config files.
pub fn build_manager_from_env() -> Result<Arc<IngestionManager>> {
    let providers = load_providers_default()?;
    let universe = load_universe_default()?;
    build_manager(
        &data_dir_from_env(),
        IngestSettings::from_env(),
        providers,
        universe,
    )
}
