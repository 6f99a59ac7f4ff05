//! Persisted mapping from file path to processed image record.

use crate::core::record::{Embedding, ImageRecord};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// Version written into every persisted record.
pub const SCHEMA_VERSION: u32 = 1;

const META_TREE: &str = "meta";
const MODEL_KEY: &[u8] = b"model_id";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Record {identity} has schema version {found}, newest supported is {supported}")]
    UnsupportedVersion {
        identity: String,
        found: u32,
        supported: u32,
    },

    #[error("Stored key is not valid UTF-8")]
    InvalidKey,

    #[error("Store lock poisoned")]
    Poisoned,
}

/// On-disk value for one image. The path is the key.
#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    version: u32,
    captured_at: i64,
    embedding: Embedding,
}

/// Outcome of comparing the store against the files currently on disk.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// On disk but not in the store; needs extraction.
    pub to_add: BTreeSet<String>,
    /// In the store but gone from disk; already purged.
    pub to_remove: BTreeSet<String>,
}

/// Key-value image store on top of `sled`.
///
/// Records are only comparable when produced by the same extractor, so the
/// store remembers the extractor's `model_id` and drops everything when
/// opened with a different one.
pub struct IncrementalStore {
    db: sled::Db,
    meta: sled::Tree,
    model_id: String,
    write_lock: Mutex<()>,
}

impl IncrementalStore {
    pub fn open(path: &Path, model_id: &str) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Self::from_db(db, model_id)
    }

    /// A throwaway store that lives only in memory.
    pub fn temporary(model_id: &str) -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, model_id)
    }

    fn from_db(db: sled::Db, model_id: &str) -> Result<Self, StoreError> {
        let meta = db.open_tree(META_TREE)?;

        match meta.get(MODEL_KEY)? {
            Some(stored) if &*stored == model_id.as_bytes() => {}
            Some(stored) => {
                log::warn!(
                    "Embedding model changed from {} to {}, discarding {} stored records",
                    String::from_utf8_lossy(&stored),
                    model_id,
                    db.len()
                );
                db.clear()?;
                meta.insert(MODEL_KEY, model_id.as_bytes())?;
            }
            None => {
                meta.insert(MODEL_KEY, model_id.as_bytes())?;
            }
        }

        Ok(Self {
            db,
            meta,
            model_id: model_id.to_string(),
            write_lock: Mutex::new(()),
        })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }

    pub fn get(&self, identity: &str) -> Result<Option<ImageRecord>, StoreError> {
        match self.db.get(identity.as_bytes())? {
            Some(value) => Ok(Some(decode(identity, &value)?)),
            None => Ok(None),
        }
    }

    /// Every stored record, ordered by path.
    pub fn get_all(&self) -> Result<Vec<ImageRecord>, StoreError> {
        self.db
            .iter()
            .map(|entry| {
                let (key, value) = entry?;
                let identity = std::str::from_utf8(&key).map_err(|_| StoreError::InvalidKey)?;
                decode(identity, &value)
            })
            .collect()
    }

    /// Insert or overwrite by identity.
    pub fn upsert(&self, record: &ImageRecord) -> Result<(), StoreError> {
        let value = serde_json::to_vec(&StoredRecord {
            version: SCHEMA_VERSION,
            captured_at: record.captured_at,
            embedding: record.embedding.clone(),
        })?;

        let _guard = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;
        self.db.insert(record.identity.as_bytes(), value)?;
        Ok(())
    }

    /// Delete by identity; absent identities are ignored.
    pub fn remove(&self, identity: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;
        self.db.remove(identity.as_bytes())?;
        Ok(())
    }

    /// Diff the whole store against `current` and purge stale records.
    pub fn reconcile(&self, current: &HashSet<String>) -> Result<Reconciliation, StoreError> {
        self.reconcile_filtered(current, |_| true)
    }

    /// Like [`reconcile`](Self::reconcile), but only records under one of
    /// `roots` and outside every `excluded` path are candidates for removal.
    /// Records belonging to directories this scan couldn't see are left alone.
    pub fn reconcile_under(
        &self,
        roots: &[PathBuf],
        excluded: &[PathBuf],
        current: &HashSet<String>,
    ) -> Result<Reconciliation, StoreError> {
        self.reconcile_filtered(current, |identity| {
            let path = Path::new(identity);
            roots.iter().any(|root| path.starts_with(root))
                && !excluded.iter().any(|skip| path.starts_with(skip))
        })
    }

    fn reconcile_filtered<F>(
        &self,
        current: &HashSet<String>,
        in_scope: F,
    ) -> Result<Reconciliation, StoreError>
    where
        F: Fn(&str) -> bool,
    {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;

        let mut known = HashSet::with_capacity(self.db.len());
        let mut to_remove = BTreeSet::new();
        for key in self.db.iter().keys() {
            let key = key?;
            let identity = String::from_utf8(key.to_vec()).map_err(|_| StoreError::InvalidKey)?;
            if !current.contains(&identity) && in_scope(&identity) {
                to_remove.insert(identity.clone());
            }
            known.insert(identity);
        }

        for identity in &to_remove {
            self.db.remove(identity.as_bytes())?;
        }

        let to_add = current
            .iter()
            .filter(|identity| !known.contains(*identity))
            .cloned()
            .collect();

        if !to_remove.is_empty() {
            log::info!("Purged {} records for files no longer on disk", to_remove.len());
        }

        Ok(Reconciliation { to_add, to_remove })
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        self.meta.flush()?;
        Ok(())
    }
}

fn decode(identity: &str, value: &[u8]) -> Result<ImageRecord, StoreError> {
    let stored: StoredRecord = serde_json::from_slice(value)?;
    if stored.version > SCHEMA_VERSION {
        return Err(StoreError::UnsupportedVersion {
            identity: identity.to_string(),
            found: stored.version,
            supported: SCHEMA_VERSION,
        });
    }
    Ok(ImageRecord::new(identity, stored.captured_at, stored.embedding))
}
