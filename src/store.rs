//! Durable key/value store standing in for browser `localStorage`.
//!
//! Every key lives in its own JSON file under the store directory, wrapped
//! in a versioned [`Envelope`]. Writes land in a temp file first and are
//! renamed into place, so a crash never leaves a half-written value. An
//! in-memory map mirrors the files and serves reads.

use crate::clock::SharedClock;
use crate::error::{Result, SyncError};
use crate::types::{Collection, Record};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Bumped whenever the shape of stored values changes. Values written
/// under another version are discarded on open.
pub const STORE_VERSION: u32 = 1;

pub const DEFAULT_PREFIX: &str = "crm_";
/// Snapshots older than this are not served as a read fallback.
pub const DEFAULT_MAX_SNAPSHOT_AGE_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub version: u32,
    pub saved_at_ms: u64,
    pub data: serde_json::Value,
}

pub struct LocalStore {
    dir: PathBuf,
    prefix: String,
    entries: DashMap<String, Arc<Envelope>>,
    clock: SharedClock,
    // Serializes read-modify-write cycles on collections
    collection_lock: Mutex<()>,
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty()
        || !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        return Err(SyncError::InvalidRecord(format!(
            "invalid store key: {:?}",
            key
        )));
    }
    Ok(())
}

impl LocalStore {
    pub fn open(dir: &Path, prefix: &str, clock: SharedClock) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let entries = DashMap::new();

        for entry in std::fs::read_dir(dir)?.filter_map(|e| e.ok()) {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(key) = name
                .strip_prefix(prefix)
                .and_then(|s| s.strip_suffix(".json"))
            else {
                continue;
            };

            let parsed = std::fs::read_to_string(entry.path())
                .map_err(SyncError::from)
                .and_then(|c| serde_json::from_str::<Envelope>(&c).map_err(SyncError::from));
            match parsed {
                Ok(env) if env.version == STORE_VERSION => {
                    entries.insert(key.to_string(), Arc::new(env));
                }
                Ok(env) => {
                    tracing::warn!(
                        "[STORE] discarding {} (version {} != {})",
                        key,
                        env.version,
                        STORE_VERSION
                    );
                    let _ = std::fs::remove_file(entry.path());
                }
                Err(e) => {
                    tracing::warn!("[STORE] discarding unreadable {}: {}", key, e);
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }

        tracing::info!(
            "[STORE] opened {} with {} keys",
            dir.display(),
            entries.len()
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            prefix: prefix.to_string(),
            entries,
            clock,
            collection_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}{}.json", self.prefix, key))
    }

    fn write_envelope(&self, key: &str, env: &Envelope) -> Result<()> {
        let content = serde_json::to_string(env)?;
        let tmp = self
            .dir
            .join(format!(".{}{}.{}.tmp", self.prefix, key, uuid::Uuid::new_v4()));
        std::fs::write(&tmp, content)?;
        if let Err(e) = std::fs::rename(&tmp, self.path_for(key)) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.entries.get(key) {
            Some(env) => serde_json::from_value(env.data.clone())
                .map(Some)
                .map_err(|e| SyncError::Corrupt(format!("store key {}: {}", key, e))),
            None => Ok(None),
        }
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        validate_key(key)?;
        let env = Envelope {
            version: STORE_VERSION,
            saved_at_ms: self.clock.now_ms(),
            data: serde_json::to_value(value)?,
        };
        self.write_envelope(key, &env)?;
        self.entries.insert(key.to_string(), Arc::new(env));
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<bool> {
        let existed = self.entries.remove(key).is_some();
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(existed),
            Err(e) => Err(e.into()),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Remove every key. Returns how many were removed.
    pub fn clear(&self) -> Result<usize> {
        let keys = self.keys();
        for key in &keys {
            self.remove(key)?;
        }
        Ok(keys.len())
    }

    pub fn saved_at(&self, key: &str) -> Option<u64> {
        self.entries.get(key).map(|e| e.saved_at_ms)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn load_collection<T: Record>(&self) -> Result<Vec<T>> {
        Ok(self
            .get::<Vec<T>>(T::COLLECTION.as_str())?
            .unwrap_or_default())
    }

    pub fn save_collection<T: Record>(&self, items: &[T]) -> Result<()> {
        let _guard = self
            .collection_lock
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        self.set(T::COLLECTION.as_str(), &items)
    }

    pub fn get_record<T: Record>(&self, id: &str) -> Result<Option<T>> {
        Ok(self
            .load_collection::<T>()?
            .into_iter()
            .find(|r| r.id() == id))
    }

    /// Insert or replace a record by id. Returns the previous version.
    pub fn upsert_record<T: Record>(&self, record: &T) -> Result<Option<T>> {
        let _guard = self
            .collection_lock
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let mut items = self.load_collection::<T>()?;
        let prior = match items.iter_mut().find(|r| r.id() == record.id()) {
            Some(slot) => Some(std::mem::replace(slot, record.clone())),
            None => {
                items.push(record.clone());
                None
            }
        };
        self.set(T::COLLECTION.as_str(), &items)?;
        Ok(prior)
    }

    /// Remove a record by id. Returns the removed record, if any.
    pub fn remove_record<T: Record>(&self, id: &str) -> Result<Option<T>> {
        let _guard = self
            .collection_lock
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let mut items = self.load_collection::<T>()?;
        let Some(pos) = items.iter().position(|r| r.id() == id) else {
            return Ok(None);
        };
        let removed = items.remove(pos);
        self.set(T::COLLECTION.as_str(), &items)?;
        Ok(Some(removed))
    }

    /// Milliseconds since the collection snapshot was written.
    pub fn collection_age(&self, collection: Collection) -> Option<u64> {
        self.saved_at(collection.as_str())
            .map(|t| self.clock.now_ms().saturating_sub(t))
    }

    pub fn is_snapshot_fresh(&self, collection: Collection, max_age_ms: u64) -> bool {
        self.collection_age(collection)
            .map(|age| age < max_age_ms)
            .unwrap_or(false)
    }
}
