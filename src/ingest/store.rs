// src/ingest/store.rs
//! JSON-file backed store under a data directory.
//!
//! Layout:
//! - `tables.json`   prices / news / provider rows (see [`Tables`])
//! - `runs.json`     run history, newest last, capped (default [`MAX_RUNS`])
//! - `rag/<SYMBOL>.jsonl` appended retrieval documents

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::ingest::persist::{
    index_docs, last_success_of, recent_of, ApplyOptions, PersistenceApplier, RagIndexer,
    RunLog, RunRecord, Tables,
};
use crate::ingest::types::{IngestionResult, PersistSummary, RagDoc};

pub const MAX_RUNS: usize = 5_000;

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Write `body` to `path` via a uniquely named temp file + rename, so readers
/// never see half a file and concurrent writers never share a temp file.
pub fn write_bytes_atomic(path: &Path, body: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let tmp = path.with_extension(format!("json.{}.{seq}.tmp", std::process::id()));
    fs::write(&tmp, body).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

/// Pretty JSON through [`write_bytes_atomic`]. For small files only.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    write_bytes_atomic(path, &serde_json::to_vec_pretty(value)?)
}

/// Write a snapshot off the async runtime.
async fn write_blocking(path: PathBuf, body: Vec<u8>) -> Result<()> {
    tokio::task::spawn_blocking(move || write_bytes_atomic(&path, &body))
        .await
        .context("file store writer panicked")?
}

fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

pub struct JsonFileStore {
    dir: PathBuf,
    tables: Mutex<Tables>,
    runs: Mutex<Vec<RunRecord>>,
    max_runs: usize,
    /// Serializes snapshot + disk write per file so writes land in order.
    tables_write: tokio::sync::Mutex<()>,
    runs_write: tokio::sync::Mutex<()>,
}

impl JsonFileStore {
    /// Open (or create) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_cap(dir, MAX_RUNS)
    }

    /// Same as `open` with a custom run-history cap.
    pub fn open_with_cap(dir: impl Into<PathBuf>, max_runs: usize) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        let tables: Tables = read_json_or_default(&dir.join("tables.json"))?;
        let runs: Vec<RunRecord> = read_json_or_default(&dir.join("runs.json"))?;
        info!(
            target: "ingest",
            dir = %dir.display(),
            symbols = tables.prices.len(),
            runs = runs.len(),
            "file store opened"
        );
        Ok(Self {
            dir,
            tables: Mutex::new(tables),
            runs: Mutex::new(runs),
            max_runs: max_runs.max(1),
            tables_write: tokio::sync::Mutex::new(()),
            runs_write: tokio::sync::Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn tables(&self) -> Tables {
        self.tables.lock().clone()
    }
}

#[async_trait]
impl PersistenceApplier for JsonFileStore {
    async fn apply(
        &self,
        result: &IngestionResult,
        started_at_ms: i64,
        opts: &ApplyOptions,
    ) -> Result<PersistSummary> {
        let t0 = Instant::now();
        let _write = self.tables_write.lock().await;
        let ((prices, news, provider_data), body) = {
            let mut tables = self.tables.lock();
            let counts = tables.upsert(result);
            (counts, serde_json::to_vec(&*tables)?)
        };
        write_blocking(self.dir.join("tables.json"), body).await?;
        let rag_docs = index_docs(&result.docs, opts).await;
        debug!(
            target: "ingest",
            provider = %result.provider_id,
            started_at_ms,
            prices, news, provider_data, rag_docs,
            "applied result"
        );
        Ok(PersistSummary {
            prices,
            news,
            provider_data,
            rag_docs,
            duration_ms: t0.elapsed().as_millis() as u64,
        })
    }
}

#[async_trait]
impl RunLog for JsonFileStore {
    async fn record(&self, rec: RunRecord) -> Result<()> {
        let _write = self.runs_write.lock().await;
        let body = {
            let mut runs = self.runs.lock();
            runs.push(rec);
            if runs.len() > self.max_runs {
                let excess = runs.len() - self.max_runs;
                runs.drain(0..excess);
            }
            serde_json::to_vec(&*runs)?
        };
        write_blocking(self.dir.join("runs.json"), body).await
    }

    async fn recent(&self, provider_id: &str, limit: usize) -> Result<Vec<RunRecord>> {
        Ok(recent_of(&self.runs.lock(), provider_id, limit))
    }

    async fn last_success(&self, provider_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(last_success_of(&self.runs.lock(), provider_id))
    }
}

/// Appends documents to `<dir>/<SYMBOL>.jsonl`, skipping ids already present.
pub struct FileRagIndexer {
    dir: PathBuf,
    /// symbol -> doc ids already on disk
    seen: Mutex<HashMap<String, HashSet<String>>>,
}

impl FileRagIndexer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            seen: Mutex::new(HashMap::new()),
        }
    }

    fn file_for(&self, symbol: &str) -> PathBuf {
        let safe: String = symbol
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.jsonl"))
    }

    fn load_seen(path: &Path) -> HashSet<String> {
        let Ok(raw) = fs::read_to_string(path) else {
            return HashSet::new();
        };
        raw.lines()
            .filter_map(|line| serde_json::from_str::<RagDoc>(line).ok())
            .map(|doc| doc.id)
            .collect()
    }
}

#[async_trait]
impl RagIndexer for FileRagIndexer {
    async fn index(&self, symbol: &str, docs: &[RagDoc]) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let path = self.file_for(symbol);
        let mut all = self.seen.lock();
        let seen = all
            .entry(symbol.to_string())
            .or_insert_with(|| Self::load_seen(&path));
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        for d in docs {
            if !seen.insert(d.id.clone()) {
                continue;
            }
            let line = serde_json::to_string(d)?;
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::persist::RunStatus;
    use crate::ingest::types::{NewsItem, PriceBar};

    fn result_with_data() -> IngestionResult {
        let mut r = IngestionResult::empty("p", Utc::now());
        r.prices.push(PriceBar {
            symbol: "AAA".into(),
            ts: 1_700_000_000_000,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: Some(100.0),
        });
        r.news.push(NewsItem {
            symbol: "AAA".into(),
            title: "Headline".into(),
            url: Some("https://example.com/a".into()),
            published_at: 1_700_000_000_000,
            summary: None,
            source: Some("wire".into()),
        });
        r
    }

    #[tokio::test]
    async fn tables_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JsonFileStore::open(dir.path()).unwrap();
            let s = store
                .apply(&result_with_data(), 0, &ApplyOptions::default())
                .await
                .unwrap();
            assert_eq!((s.prices, s.news), (1, 1));
        }
        let store = JsonFileStore::open(dir.path()).unwrap();
        let t = store.tables();
        assert_eq!(t.latest_price("AAA").unwrap().close, 1.5);
        assert_eq!(t.news.len(), 1);
    }

    #[tokio::test]
    async fn run_history_is_capped_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open_with_cap(dir.path(), 10).unwrap();
        for _ in 0..13 {
            let mut r = IngestionResult::empty("p", Utc::now());
            r.finished_at = Some(Utc::now());
            store.record(RunRecord::from_result(&r, false)).await.unwrap();
        }
        drop(store);
        let reopened = JsonFileStore::open_with_cap(dir.path(), 10).unwrap();
        let all = reopened.recent("p", usize::MAX).await.unwrap();
        assert_eq!(all.len(), 10);
        assert_eq!(all[0].status, RunStatus::Success);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_records_all_land_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(JsonFileStore::open(dir.path()).unwrap());
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut r = IngestionResult::empty(format!("p{i}"), Utc::now());
                r.finished_at = Some(Utc::now());
                store.record(RunRecord::from_result(&r, false)).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        drop(store);

        let raw = fs::read_to_string(dir.path().join("runs.json")).unwrap();
        let runs: Vec<RunRecord> = serde_json::from_str(&raw).unwrap();
        assert_eq!(runs.len(), 16);
        let leftovers = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn file_rag_indexer_skips_known_ids() {
        let dir = tempfile::tempdir().unwrap();
        let idx = FileRagIndexer::new(dir.path().join("rag"));
        let doc = RagDoc {
            id: "n1".into(),
            symbol: "AAA".into(),
            text: "Headline".into(),
            metadata: serde_json::Value::Null,
        };
        idx.index("AAA", &[doc.clone()]).await.unwrap();
        idx.index("AAA", &[doc]).await.unwrap();
        let raw = fs::read_to_string(dir.path().join("rag/AAA.jsonl")).unwrap();
        assert_eq!(raw.lines().count(), 1);
    }
}
