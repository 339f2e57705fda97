// src/ingest/config.rs
use anyhow::{anyhow, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::ingest::retry::RetryPolicy;

pub const ENV_CONCURRENCY: &str = "INGEST_CONCURRENCY";
pub const ENV_BATCH_SIZE: &str = "INGEST_BATCH_SIZE";
pub const ENV_MAX_SYMBOLS: &str = "MAX_SYMBOLS_PER_RUN";
pub const ENV_PROVIDERS_PATH: &str = "INGEST_PROVIDERS_PATH";
pub const ENV_UNIVERSE_PATH: &str = "INGEST_UNIVERSE_PATH";
pub const ENV_DATA_DIR: &str = "INGEST_DATA_DIR";
pub const ENV_SCHEDULE_SECS: &str = "INGEST_SCHEDULE_SECS";

pub const DEFAULT_CONCURRENCY: usize = 2;
pub const DEFAULT_DATA_DIR: &str = "data";

/// Global knobs for the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestSettings {
    /// Size of the process-wide semaphore.
    pub concurrency: usize,
    /// Overrides every provider's own batch size when set.
    pub batch_size_override: Option<usize>,
    /// 0 = unlimited.
    pub max_symbols_per_run: usize,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            batch_size_override: None,
            max_symbols_per_run: 0,
        }
    }
}

impl IngestSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Same as `from_env` but with an injectable lookup (tests).
    pub fn from_lookup<F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let concurrency = parse_usize(ENV_CONCURRENCY, get(ENV_CONCURRENCY))
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_CONCURRENCY);
        let batch_size_override =
            parse_usize(ENV_BATCH_SIZE, get(ENV_BATCH_SIZE)).filter(|n| *n > 0);
        let max_symbols_per_run = parse_usize(ENV_MAX_SYMBOLS, get(ENV_MAX_SYMBOLS)).unwrap_or(0);
        Self {
            concurrency,
            batch_size_override,
            max_symbols_per_run,
        }
    }
}

fn parse_usize(name: &str, raw: Option<String>) -> Option<usize> {
    let raw = raw?;
    let t = raw.trim();
    if t.is_empty() {
        return None;
    }
    match t.parse::<usize>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(target: "ingest", var = name, value = t, "ignoring invalid numeric env value");
            None
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_kind() -> String {
    "http".to_string()
}
fn default_max_retries() -> u32 {
    RetryPolicy::default().max_retries
}
fn default_backoff_base_ms() -> u64 {
    RetryPolicy::default().backoff_base_ms
}

/// Configuration of one provider. Owned by the registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfigEntry {
    pub id: String,
    /// "http" | "fixture"
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub rag_enabled: bool,
    #[serde(default)]
    pub rate_limit_rpm: Option<u32>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default)]
    pub disable_on_failures: Option<u32>,
    /// Provider's own batching threshold; 0/None = no batching.
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub fixture_path: Option<PathBuf>,
    /// Name of the env var holding this provider's API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl ProviderConfigEntry {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: default_kind(),
            enabled: true,
            symbols: Vec::new(),
            rag_enabled: false,
            rate_limit_rpm: None,
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            disable_on_failures: None,
            batch_size: None,
            endpoint: None,
            fixture_path: None,
            api_key_env: None,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_base_ms: self.backoff_base_ms,
        }
    }

    /// API key resolved from `api_key_env`, if any.
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|k| !k.trim().is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct ProvidersFile {
    #[serde(default, alias = "provider")]
    providers: Vec<ProviderConfigEntry>,
}

/// Load provider entries from an explicit path. Supports TOML or JSON.
pub fn load_providers_from(path: &Path) -> Result<Vec<ProviderConfigEntry>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading providers from {}", path.display()))?;
    let entries = if extension(path) == "json" {
        match serde_json::from_str::<ProvidersFile>(&content) {
            Ok(f) => f.providers,
            Err(_) => serde_json::from_str::<Vec<ProviderConfigEntry>>(&content)
                .with_context(|| format!("parsing {}", path.display()))?,
        }
    } else {
        toml::from_str::<ProvidersFile>(&content)
            .with_context(|| format!("parsing {}", path.display()))?
            .providers
    };
    validate_providers(&entries)?;
    Ok(entries)
}

/// Load providers using env var + fallbacks:
/// 1) $INGEST_PROVIDERS_PATH
/// 2) config/providers.toml
/// 3) config/providers.json
pub fn load_providers_default() -> Result<Vec<ProviderConfigEntry>> {
    match resolve_path(ENV_PROVIDERS_PATH, "config/providers")? {
        Some(p) => load_providers_from(&p),
        None => Ok(Vec::new()),
    }
}

fn validate_providers(entries: &[ProviderConfigEntry]) -> Result<()> {
    let mut seen = HashSet::new();
    for e in entries {
        if e.id.trim().is_empty() {
            return Err(anyhow!("provider entry with empty id"));
        }
        if !seen.insert(e.id.as_str()) {
            return Err(anyhow!("duplicate provider id '{}'", e.id));
        }
    }
    Ok(())
}

/// Load the known-instrument universe from an explicit path.
/// TOML: `symbols = [..]`; JSON: a plain array.
pub fn load_universe_from(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading universe from {}", path.display()))?;
    let raw = if extension(path) == "json" {
        serde_json::from_str::<Vec<String>>(&content)
            .with_context(|| format!("parsing {}", path.display()))?
    } else {
        #[derive(Deserialize)]
        struct TomlUniverse {
            symbols: Vec<String>,
        }
        toml::from_str::<TomlUniverse>(&content)
            .with_context(|| format!("parsing {}", path.display()))?
            .symbols
    };
    Ok(normalize_symbols(raw))
}

/// 1) $INGEST_UNIVERSE_PATH 2) config/instruments.toml 3) config/instruments.json
pub fn load_universe_default() -> Result<Vec<String>> {
    match resolve_path(ENV_UNIVERSE_PATH, "config/instruments")? {
        Some(p) => load_universe_from(&p),
        None => Ok(Vec::new()),
    }
}

pub fn data_dir_from_env() -> PathBuf {
    std::env::var(ENV_DATA_DIR)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
}

pub fn schedule_secs_from_env() -> Option<u64> {
    std::env::var(ENV_SCHEDULE_SECS)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|s| *s > 0)
}

fn resolve_path(env_name: &str, stem: &str) -> Result<Option<PathBuf>> {
    if let Ok(p) = std::env::var(env_name) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return Ok(Some(pb));
        }
        return Err(anyhow!("{env_name} points to non-existent path"));
    }
    for ext in ["toml", "json"] {
        let p = PathBuf::from(format!("{stem}.{ext}"));
        if p.exists() {
            return Ok(Some(p));
        }
    }
    Ok(None)
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase()
}

static RE_SYMBOL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z0-9^][A-Z0-9.\-^=_]{0,31}$").expect("symbol regex"));

/// Trim, upper-case, drop malformed entries, dedup keeping first occurrence.
pub fn normalize_symbols<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for it in items {
        let s = it.as_ref().trim().to_ascii_uppercase();
        if s.is_empty() {
            continue;
        }
        if !RE_SYMBOL.is_match(&s) {
            warn!(target: "ingest", symbol = %s, "dropping malformed symbol");
            continue;
        }
        if seen.insert(s.clone()) {
            out.push(s);
        }
    }
    out
}
