//! Cache entries and their stores

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::cache::fingerprint::Fingerprint;
use crate::collect::source::InputStamp;
use crate::error::{Result, TerrainError};

/// What a run produces, independently of the input version
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProductKey {
    /// `ground`, `top-max` or `top-idw`
    pub mode: String,
    /// Digest of the pipeline description
    pub params: Fingerprint,
}

/// One cached engine output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub input: PathBuf,
    pub input_stamp: InputStamp,
    pub product: ProductKey,
    pub output: PathBuf,
    pub created: DateTime<Utc>,
}

/// Fingerprint-keyed storage of cache entries
///
/// Entries are immutable: `put` replaces any entry with the same fingerprint.
pub trait CacheStore: Send + Sync {
    fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>>;

    fn put(&self, entry: CacheEntry) -> Result<()>;

    fn remove(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>>;

    fn entries(&self) -> Result<Vec<CacheEntry>>;

    /// Drop every entry derived from `input`, whatever its parameters
    fn remove_input(&self, input: &Path) -> Result<Vec<CacheEntry>> {
        let mut removed = Vec::new();
        for entry in self.entries()? {
            if entry.input == input {
                if let Some(entry) = self.remove(&entry.fingerprint)? {
                    removed.push(entry);
                }
            }
        }
        Ok(removed)
    }

    /// Drop entries for the same input and product made from an older version
    /// of the input than `current`
    fn remove_stale(&self, current: &CacheEntry) -> Result<Vec<CacheEntry>> {
        let mut removed = Vec::new();
        for entry in self.entries()? {
            if entry.input == current.input
                && entry.product == current.product
                && entry.fingerprint != current.fingerprint
            {
                if let Some(entry) = self.remove(&entry.fingerprint)? {
                    removed.push(entry);
                }
            }
        }
        Ok(removed)
    }
}

/// Process-local store
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: DashMap<Fingerprint, CacheEntry>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
        Ok(self.entries.get(fingerprint).map(|e| e.value().clone()))
    }

    fn put(&self, entry: CacheEntry) -> Result<()> {
        self.entries.insert(entry.fingerprint.clone(), entry);
        Ok(())
    }

    fn remove(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
        Ok(self.entries.remove(fingerprint).map(|(_, entry)| entry))
    }

    fn entries(&self) -> Result<Vec<CacheEntry>> {
        Ok(self.entries.iter().map(|e| e.value().clone()).collect())
    }
}

const INDEX_FILE: &str = "index.json";

/// Store persisted as `index.json` in the cache directory
///
/// The index is loaded once and rewritten after every change, through a
/// temporary file renamed over the previous index.
#[derive(Debug)]
pub struct FsCacheStore {
    dir: PathBuf,
    index: Mutex<BTreeMap<Fingerprint, CacheEntry>>,
}

impl FsCacheStore {
    /// Open the store in `dir`, creating the directory when needed
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let index_path = dir.join(INDEX_FILE);
        let index = if index_path.exists() {
            let text = std::fs::read_to_string(&index_path)?;
            match serde_json::from_str::<Vec<CacheEntry>>(&text) {
                Ok(entries) => entries
                    .into_iter()
                    .map(|e| (e.fingerprint.clone(), e))
                    .collect(),
                Err(e) => {
                    warn!("discarding unreadable cache index {index_path:?}: {e}");
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };
        debug!("cache index {index_path:?}: {} entries", index.len());
        Ok(FsCacheStore {
            dir,
            index: Mutex::new(index),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<Fingerprint, CacheEntry>>> {
        self.index
            .lock()
            .map_err(|_| TerrainError::Cache("cache index lock poisoned".to_string()))
    }

    fn persist(&self, index: &BTreeMap<Fingerprint, CacheEntry>) -> Result<()> {
        let entries: Vec<&CacheEntry> = index.values().collect();
        let text = serde_json::to_string_pretty(&entries)?;
        let tmp = self.dir.join(format!("{INDEX_FILE}.tmp"));
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, self.dir.join(INDEX_FILE))?;
        Ok(())
    }
}

impl CacheStore for FsCacheStore {
    fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
        Ok(self.lock()?.get(fingerprint).cloned())
    }

    fn put(&self, entry: CacheEntry) -> Result<()> {
        let mut index = self.lock()?;
        index.insert(entry.fingerprint.clone(), entry);
        self.persist(&index)
    }

    fn remove(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
        let mut index = self.lock()?;
        let removed = index.remove(fingerprint);
        if removed.is_some() {
            self.persist(&index)?;
        }
        Ok(removed)
    }

    fn entries(&self) -> Result<Vec<CacheEntry>> {
        Ok(self.lock()?.values().cloned().collect())
    }
}
