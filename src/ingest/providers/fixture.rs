use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::ingest::error::ProviderError;
use crate::ingest::providers::ProviderPayload;
use crate::ingest::types::{
    IngestError, IngestionOptions, IngestionResult, Provider, ProviderContext,
};

/// Serves canned per-symbol payloads. Handy for local runs and tests.
///
/// Fixture format: `{ "AAPL": { "prices": [...], "news": [...] }, ... }`.
pub struct FixtureProvider {
    id: String,
    by_symbol: HashMap<String, ProviderPayload>,
}

impl FixtureProvider {
    pub fn from_fixture_str(id: &str, s: &str) -> Result<Self> {
        let raw: HashMap<String, ProviderPayload> =
            serde_json::from_str(s).context("parsing provider fixture")?;
        let by_symbol = raw
            .into_iter()
            .map(|(k, v)| (k.trim().to_ascii_uppercase(), v))
            .collect();
        Ok(Self {
            id: id.to_string(),
            by_symbol,
        })
    }

    pub fn from_path(id: &str, path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("reading fixture {}", path.display()))?;
        Self::from_fixture_str(id, &s)
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut v: Vec<String> = self.by_symbol.keys().cloned().collect();
        v.sort();
        v
    }
}

#[async_trait]
impl Provider for FixtureProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn ingest(
        &self,
        _ctx: &ProviderContext,
        opts: &IngestionOptions,
    ) -> Result<IngestionResult, ProviderError> {
        let since_ms = opts.since.map(|s| s.timestamp_millis());
        let mut merged = ProviderPayload::default();
        for sym in &opts.symbols {
            let Some(p) = self.by_symbol.get(sym) else {
                merged
                    .errors
                    .push(IngestError::new("no fixture data").for_symbol(sym));
                continue;
            };
            merged.prices.extend(
                p.prices
                    .iter()
                    .filter(|b| since_ms.map_or(true, |s| b.ts >= s))
                    .cloned(),
            );
            merged.news.extend(
                p.news
                    .iter()
                    .filter(|n| since_ms.map_or(true, |s| n.published_at >= s))
                    .cloned(),
            );
            merged.docs.extend(p.docs.iter().cloned());
            merged.provider_data.extend(p.provider_data.iter().cloned());
            merged.errors.extend(p.errors.iter().cloned());
        }
        Ok(merged.into_result(&self.id, opts))
    }
}
