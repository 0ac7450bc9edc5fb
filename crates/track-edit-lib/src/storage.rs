//! Storage abstraction backing the mutation log.
//!
//! This module provides a single trait `KvStore` and two concrete
//! implementations:
//!
//! - `MemoryStore`: ordered in-memory map, the default for sessions that
//!   do not need to survive a restart.
//! - `FileStore`: stores a single JSON file containing a map of string keys
//!   to string values, rewritten atomically (temp file + rename) on every
//!   committed batch.
//!
//! Keys and values are UTF-8 strings. The free helpers `put_json` and
//! `load_json` serialize structured records with `serde_json`.

use serde::{Serialize, de::DeserializeOwned};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Platform storage error: {0}")]
    Platform(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// A single write inside a [`WriteBatch`]
#[derive(Clone, Debug, PartialEq)]
pub enum BatchOp {
    Put { key: String, value: String },
    Delete { key: String },
}

/// Ordered set of writes committed all-or-nothing
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.ops.push(BatchOp::Put {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(BatchOp::Delete { key: key.into() });
        self
    }

    /// Serialize `value` as JSON and queue a put
    pub fn put_json<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> StorageResult<&mut Self> {
        let json = serde_json::to_string(value).map_err(|e| StorageError::Json(e.to_string()))?;
        Ok(self.put(key, json))
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn apply_to(&self, map: &mut BTreeMap<String, String>) {
        for op in &self.ops {
            match op {
                BatchOp::Put { key, value } => {
                    map.insert(key.clone(), value.clone());
                }
                BatchOp::Delete { key } => {
                    map.remove(key);
                }
            }
        }
    }
}

/// Persistent key-value store with ordered scans and atomic batches.
pub trait KvStore: Send + Sync {
    /// Read a value. Returns Ok(None) when the key is missing.
    fn get(&self, key: &str) -> StorageResult<Option<String>>;

    /// All entries whose key starts with `prefix`, in ascending key order.
    fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<(String, String)>>;

    /// Apply every operation of `batch`, or none of them.
    fn transact(&self, batch: WriteBatch) -> StorageResult<()>;

    /// Store a single value.
    fn put(&self, key: &str, value: &str) -> StorageResult<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.transact(batch)
    }

    /// Remove a key (no-op if the key does not exist).
    fn delete(&self, key: &str) -> StorageResult<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.transact(batch)
    }
}

/// Serialize `value` as JSON and store it under `key`
pub fn put_json<T: Serialize>(store: &dyn KvStore, key: &str, value: &T) -> StorageResult<()> {
    match serde_json::to_string(value) {
        Ok(s) => store.put(key, &s),
        Err(e) => Err(StorageError::Json(e.to_string())),
    }
}

/// Load and deserialize the JSON value stored under `key`
pub fn load_json<T: DeserializeOwned>(store: &dyn KvStore, key: &str) -> StorageResult<Option<T>> {
    match store.get(key)? {
        Some(s) => parse_json(&s).map(Some),
        None => Ok(None),
    }
}

pub(crate) fn parse_json<T: DeserializeOwned>(s: &str) -> StorageResult<T> {
    serde_json::from_str::<T>(s).map_err(|e| StorageError::Json(e.to_string()))
}

fn lock(inner: &Mutex<BTreeMap<String, String>>) -> StorageResult<MutexGuard<'_, BTreeMap<String, String>>> {
    inner
        .lock()
        .map_err(|e| StorageError::Platform(format!("mutex poisoned: {:?}", e)))
}

fn scan(map: &BTreeMap<String, String>, prefix: &str) -> Vec<(String, String)> {
    map.range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(lock(&self.inner)?.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<(String, String)>> {
        Ok(scan(&*lock(&self.inner)?, prefix))
    }

    fn transact(&self, batch: WriteBatch) -> StorageResult<()> {
        batch.apply_to(&mut *lock(&self.inner)?);
        Ok(())
    }
}

/// File-based storage: a single JSON file holding a map of key -> string value.
///
/// Implementation notes:
/// - On init, the file is read into memory (ordered map).
/// - A batch is applied to a copy of the map, the copy is written to a
///   temporary file and renamed over the original; only then does the
///   in-memory map advance. A failed write leaves both untouched.
#[derive(Debug)]
pub struct FileStore {
    /// Path to the backing JSON file.
    path: PathBuf,
    /// In-memory copy of key -> value
    inner: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Determine a good default storage file path for the current user.
    /// Uses environment variables when available:
    /// - On Windows: %APPDATA%/TrackEdit/history.json
    /// - Else: $HOME/.config/track-edit/history.json
    pub fn default_path() -> PathBuf {
        if cfg!(windows)
            && let Ok(appdata) = std::env::var("APPDATA")
        {
            return Path::new(&appdata).join("TrackEdit").join("history.json");
        }

        if let Ok(home) = std::env::var("HOME") {
            return Path::new(&home)
                .join(".config")
                .join("track-edit")
                .join("history.json");
        }

        Path::new(".").join("track-edit-history.json")
    }

    /// Open (or create) the store at `path`, or at [`FileStore::default_path`]
    pub fn open(path: Option<PathBuf>) -> StorageResult<Self> {
        let path = path.unwrap_or_else(Self::default_path);

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| {
                StorageError::Io(format!("Failed to create storage parent directory: {}", e))
            })?;
        }

        let mut map = BTreeMap::new();
        if path.exists() {
            let s = fs::read_to_string(&path)
                .map_err(|e| StorageError::Io(format!("Failed to read storage file: {}", e)))?;
            if !s.trim().is_empty() {
                map = serde_json::from_str(&s).map_err(|e| {
                    StorageError::Json(format!("Failed to parse storage JSON: {}", e))
                })?;
            }
        }

        tracing::debug!("Opened file store at {} with {} keys", path.display(), map.len());
        Ok(FileStore {
            path,
            inner: Mutex::new(map),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, map: &BTreeMap<String, String>) -> StorageResult<()> {
        let s = serde_json::to_string(map).map_err(|e| StorageError::Json(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, s).map_err(|e| StorageError::Io(format!("write failed: {}", e)))?;
        fs::rename(&tmp, &self.path).map_err(|e| StorageError::Io(format!("rename failed: {}", e)))
    }
}

impl KvStore for FileStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(lock(&self.inner)?.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<(String, String)>> {
        Ok(scan(&*lock(&self.inner)?, prefix))
    }

    fn transact(&self, batch: WriteBatch) -> StorageResult<()> {
        let mut guard = lock(&self.inner)?;
        let mut next = guard.clone();
        batch.apply_to(&mut next);
        self.flush(&next)?;
        *guard = next;
        Ok(())
    }
}
