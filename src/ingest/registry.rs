//! Provider registry: configuration plus live enable/disable state.
//!
//! A pure lookup/mutation surface. All mutations happen under a single write
//! lock, and [`ProviderRegistry::resolve`] reads provider, config and limiter
//! under one read lock, so a run never starts against a half-disabled entry.
//!
//! Runtime enable/disable overrides can be persisted to a small JSON state file
//! so they survive restarts.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::ingest::config::ProviderConfigEntry;
use crate::ingest::error::RunError;
use crate::ingest::rate_limiter::RateLimiter;
use crate::ingest::store::write_json_atomic;
use crate::ingest::types::Provider;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DisabledInfo {
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Snapshot of one registry entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    pub id: String,
    pub enabled: bool,
    pub disabled: Option<DisabledInfo>,
    pub config: ProviderConfigEntry,
}

/// Everything a run needs, read atomically.
#[derive(Clone)]
pub struct ResolvedProvider {
    pub provider: Arc<dyn Provider>,
    pub config: Arc<ProviderConfigEntry>,
    pub rate_limiter: Arc<RateLimiter>,
}

struct Slot {
    provider: Arc<dyn Provider>,
    config: ProviderConfigEntry,
    limiter: Arc<RateLimiter>,
    disabled: Option<DisabledInfo>,
}

/// Persisted runtime overrides, keyed by provider id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    disabled: BTreeMap<String, DisabledInfo>,
}

pub struct ProviderRegistry {
    slots: RwLock<HashMap<String, Slot>>,
    state_path: Option<PathBuf>,
    /// Overrides loaded from disk for providers not registered yet.
    pending: RwLock<BTreeMap<String, DisabledInfo>>,
    /// Held across snapshot + write so the newest state is the one on disk.
    state_write: Mutex<()>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            state_path: None,
            pending: RwLock::new(BTreeMap::new()),
            state_write: Mutex::new(()),
        }
    }

    /// Registry that persists disable/enable overrides to `path`.
    pub fn with_state_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = read_state(&path)?;
        Ok(Self {
            slots: RwLock::new(HashMap::new()),
            state_path: Some(path),
            pending: RwLock::new(state.disabled),
            state_write: Mutex::new(()),
        })
    }

    /// Register (or replace) a provider together with its configuration.
    pub fn register(&self, provider: Arc<dyn Provider>, mut config: ProviderConfigEntry) {
        let id = config.id.clone();
        if provider.id() != id {
            warn!(
                target: "ingest",
                provider = %id,
                adapter = provider.id(),
                "adapter id differs from config id; config id wins"
            );
        }
        let disabled = self.pending.write().remove(&id);
        if disabled.is_some() {
            config.enabled = false;
        }
        let limiter = Arc::new(RateLimiter::new(config.rate_limit_rpm));
        self.slots.write().insert(
            id,
            Slot {
                provider,
                config,
                limiter,
                disabled,
            },
        );
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Provider>> {
        self.slots.read().get(id).map(|s| s.provider.clone())
    }

    pub fn get_config(&self, id: &str) -> Option<ProviderConfigEntry> {
        self.slots.read().get(id).map(|s| s.config.clone())
    }

    pub fn rate_limiter(&self, id: &str) -> Option<Arc<RateLimiter>> {
        self.slots.read().get(id).map(|s| s.limiter.clone())
    }

    pub fn is_enabled(&self, id: &str) -> bool {
        self.slots
            .read()
            .get(id)
            .map(|s| s.config.enabled)
            .unwrap_or(false)
    }

    /// Look up a provider for a run. Fails fast for unknown or disabled ids.
    pub fn resolve(&self, id: &str) -> Result<ResolvedProvider, RunError> {
        let slots = self.slots.read();
        let slot = slots
            .get(id)
            .ok_or_else(|| RunError::ProviderNotFound(id.to_string()))?;
        if !slot.config.enabled {
            let reason = slot
                .disabled
                .as_ref()
                .map(|d| d.reason.clone())
                .unwrap_or_else(|| "disabled in config".to_string());
            return Err(RunError::ProviderDisabled {
                id: id.to_string(),
                reason,
            });
        }
        Ok(ResolvedProvider {
            provider: slot.provider.clone(),
            config: Arc::new(slot.config.clone()),
            rate_limiter: slot.limiter.clone(),
        })
    }

    /// Flip `enabled=false` and record why. Returns false when the provider is
    /// unknown or was already disabled; calling twice is harmless.
    pub fn disable(&self, id: &str, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let changed = {
            let mut slots = self.slots.write();
            match slots.get_mut(id) {
                Some(slot) if slot.config.enabled || slot.disabled.is_none() => {
                    slot.config.enabled = false;
                    slot.disabled = Some(DisabledInfo {
                        reason: reason.clone(),
                        at: Utc::now(),
                    });
                    true
                }
                _ => false,
            }
        };
        if changed {
            warn!(target: "ingest", provider = id, %reason, "provider disabled");
            counter!("ingest_provider_disabled_total", "provider" => id.to_string()).increment(1);
            self.persist_state();
        }
        changed
    }

    /// Explicit re-enable. Clears any recorded disable reason.
    pub fn enable(&self, id: &str) -> bool {
        let changed = {
            let mut slots = self.slots.write();
            match slots.get_mut(id) {
                Some(slot) if !slot.config.enabled || slot.disabled.is_some() => {
                    slot.config.enabled = true;
                    slot.disabled = None;
                    true
                }
                _ => false,
            }
        };
        if changed {
            info!(target: "ingest", provider = id, "provider enabled");
            self.persist_state();
        }
        changed
    }

    /// Replace configs of registered providers. A runtime disable survives the
    /// reload; the limiter is rebuilt only when the rpm budget changed.
    /// Returns ids from `entries` that have no registered provider.
    pub fn reload(&self, entries: Vec<ProviderConfigEntry>) -> Vec<String> {
        let mut unknown = Vec::new();
        let mut slots = self.slots.write();
        for mut entry in entries {
            let Some(slot) = slots.get_mut(&entry.id) else {
                unknown.push(entry.id);
                continue;
            };
            if slot.disabled.is_some() {
                entry.enabled = false;
            }
            if entry.rate_limit_rpm != slot.config.rate_limit_rpm {
                slot.limiter = Arc::new(RateLimiter::new(entry.rate_limit_rpm));
            }
            slot.config = entry;
        }
        drop(slots);
        if !unknown.is_empty() {
            debug!(target: "ingest", ?unknown, "config reload found unregistered providers");
        }
        unknown
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.slots.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn list(&self) -> Vec<ProviderStatus> {
        let slots = self.slots.read();
        let mut out: Vec<ProviderStatus> = slots
            .iter()
            .map(|(id, s)| ProviderStatus {
                id: id.clone(),
                enabled: s.config.enabled,
                disabled: s.disabled.clone(),
                config: s.config.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    fn persist_state(&self) {
        let Some(path) = &self.state_path else {
            return;
        };
        let _guard = self.state_write.lock();
        let mut state = StateFile {
            disabled: self.pending.read().clone(),
        };
        for (id, slot) in self.slots.read().iter() {
            if let Some(d) = &slot.disabled {
                state.disabled.insert(id.clone(), d.clone());
            }
        }
        if let Err(e) = write_json_atomic(path, &state) {
            warn!(target: "ingest", error = ?e, path = %path.display(), "failed to persist provider state");
        }
    }
}

fn read_state(path: &Path) -> Result<StateFile> {
    if !path.exists() {
        return Ok(StateFile::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading provider state {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}
