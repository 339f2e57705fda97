// src/ingest/providers/mod.rs
pub mod fixture;
pub mod http_json;

use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::ingest::config::ProviderConfigEntry;
use crate::ingest::types::{
    IngestError, IngestionOptions, IngestionResult, NewsItem, PriceBar, ProviderRow, RagDoc,
    Provider,
};

/// Normalized wire shape shared by the concrete providers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderPayload {
    #[serde(default)]
    pub prices: Vec<PriceBar>,
    #[serde(default)]
    pub news: Vec<NewsItem>,
    #[serde(default)]
    pub docs: Vec<RagDoc>,
    #[serde(default)]
    pub provider_data: Vec<ProviderRow>,
    #[serde(default)]
    pub errors: Vec<IngestError>,
}

impl ProviderPayload {
    pub fn into_result(self, provider_id: &str, opts: &IngestionOptions) -> IngestionResult {
        let mut r = IngestionResult::empty(provider_id, chrono::Utc::now());
        r.symbols_tried = opts.symbols.clone();
        r.prices = self.prices;
        r.news = self.news;
        r.docs = if opts.rag_enabled { self.docs } else { Vec::new() };
        r.provider_data = self.provider_data;
        r.errors = self.errors;
        r.finished_at = Some(chrono::Utc::now());
        r
    }
}

/// Build a provider from its config entry (`kind` selects the adapter).
pub fn build_provider(cfg: &ProviderConfigEntry) -> Result<Arc<dyn Provider>> {
    match cfg.kind.to_ascii_lowercase().as_str() {
        "http" => {
            let endpoint = cfg
                .endpoint
                .clone()
                .ok_or_else(|| anyhow!("provider '{}': kind=http needs `endpoint`", cfg.id))?;
            Ok(Arc::new(http_json::HttpJsonProvider::new(&cfg.id, endpoint)?))
        }
        "fixture" => {
            let path = cfg
                .fixture_path
                .as_ref()
                .ok_or_else(|| anyhow!("provider '{}': kind=fixture needs `fixture_path`", cfg.id))?;
            Ok(Arc::new(fixture::FixtureProvider::from_path(&cfg.id, path)?))
        }
        other => Err(anyhow!("provider '{}': unsupported kind '{other}'", cfg.id)),
    }
}
