//! Per-type vector records, stored durably when an object store is attached
//! and in an in-process map otherwise.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, PoisonError, RwLock},
};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::storage::{self, ObjectStore, StoreError, LIST_PAGE_SIZE};

pub const VECTORS_PREFIX: &str = "vectors/";

static NON_ALNUM: Lazy<Regex> = Lazy::new(|| Regex::new("[^a-z0-9]+").expect("static regex"));

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeOrigin {
    #[serde(rename = "built-in")]
    BuiltIn,
    #[default]
    #[serde(rename = "custom")]
    Custom,
}

/// Embedding plus metadata for one semantic type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorRecord {
    pub id: String,
    pub semantic_type: String,
    #[serde(rename = "type", default)]
    pub origin: TypeOrigin,
    #[serde(default)]
    pub description: String,
    pub embedding: Vec<f32>,
    /// Exact text that was embedded.
    #[serde(default, alias = "originalText")]
    pub source_text: String,
    #[serde(default, alias = "pluginType")]
    pub plugin_kind: String,
    #[serde(default)]
    pub examples: Vec<String>,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: DateTime<Utc>,
}

/// Lower-cased name with runs of other characters collapsed to `-`.
pub fn record_id(name: &str) -> String {
    NON_ALNUM
        .replace_all(&name.to_lowercase(), "-")
        .trim_matches('-')
        .to_string()
}

fn key_for(name: &str) -> String {
    format!("{VECTORS_PREFIX}{}.json", storage::sanitize_name(name))
}

/// Folder used by the older one-folder-per-type layout. Read, never written.
fn legacy_prefix(name: &str) -> String {
    format!("{VECTORS_PREFIX}{}/", storage::sanitize_name(name))
}

/// Type folder or file stem a record key belongs to, in either layout.
fn indexed_type(key: &str) -> Option<&str> {
    let rest = key.strip_prefix(VECTORS_PREFIX)?;
    match rest.split_once('/') {
        None => rest.strip_suffix(".json"),
        Some((folder, file)) if file.ends_with(".json") && !file.contains('/') => Some(folder),
        Some(_) => None,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VectorStoreError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("malformed vector record: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Default)]
pub struct VectorStore {
    durable: RwLock<Option<Arc<dyn ObjectStore>>>,
    memory: RwLock<HashMap<String, VectorRecord>>,
}

impl VectorStore {
    /// A store that keeps records in memory until a durable store is attached.
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn durable(store: Arc<dyn ObjectStore>) -> Self {
        let vectors = Self::default();
        vectors.attach(store);
        vectors
    }

    /// Switches to `store`. Records held in memory are dropped, so a later
    /// `detach` starts from an empty map.
    pub fn attach(&self, store: Arc<dyn ObjectStore>) {
        log::info!("vector store using container {}", store.container());
        let mut durable = self.durable.write().unwrap_or_else(PoisonError::into_inner);
        *durable = Some(store);
        self.memory
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn detach(&self) {
        log::info!("vector store falling back to in-memory records");
        *self.durable.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn is_durable(&self) -> bool {
        self.backend().is_some()
    }

    fn backend(&self) -> Option<Arc<dyn ObjectStore>> {
        self.durable
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Upserts the record for `record.semantic_type`, always in the
    /// single-object layout.
    pub fn put(&self, record: &VectorRecord) -> Result<(), VectorStoreError> {
        let Some(store) = self.backend() else {
            let mut memory = self.memory.write().unwrap_or_else(PoisonError::into_inner);
            memory.insert(record.semantic_type.clone(), record.clone());
            return Ok(());
        };

        let data = serde_json::to_vec(record)?;
        store.put(&key_for(&record.semantic_type), &data)?;
        self.remove_legacy(store.as_ref(), &record.semantic_type);
        Ok(())
    }

    fn remove_legacy(&self, store: &dyn ObjectStore, name: &str) {
        let keys = match storage::list_all(store, &legacy_prefix(name)) {
            Ok(keys) => keys,
            Err(err) => {
                log::warn!("could not list legacy vectors for {name}: {err}");
                return;
            }
        };

        for key in keys {
            if let Err(err) = store.delete(&key) {
                log::warn!("could not remove legacy vector {key}: {err}");
            } else {
                log::debug!("removed legacy vector {key}");
            }
        }
    }

    pub fn get(&self, name: &str) -> Result<Option<VectorRecord>, VectorStoreError> {
        let Some(store) = self.backend() else {
            let memory = self.memory.read().unwrap_or_else(PoisonError::into_inner);
            return Ok(memory.get(name).cloned());
        };

        if let Some(data) = store.get(&key_for(name))? {
            return Ok(Some(serde_json::from_slice(&data)?));
        }

        let legacy = store.list(&legacy_prefix(name), None, LIST_PAGE_SIZE)?;
        for key in legacy.keys.iter().filter(|key| key.ends_with(".json")) {
            if let Some(data) = store.get(key)? {
                log::debug!("read {name} from legacy layout {key}");
                return Ok(Some(serde_json::from_slice(&data)?));
            }
        }

        Ok(None)
    }

    /// Whether a record for `name` exists in either layout, without fetching it.
    pub fn contains(&self, name: &str) -> Result<bool, VectorStoreError> {
        let Some(store) = self.backend() else {
            let memory = self.memory.read().unwrap_or_else(PoisonError::into_inner);
            return Ok(memory.contains_key(name));
        };

        if store.head_exists(&key_for(name))? {
            return Ok(true);
        }
        Ok(!store.list(&legacy_prefix(name), None, 1)?.keys.is_empty())
    }

    /// Every readable record. Records that fail to fetch or decode are
    /// skipped with a warning.
    pub fn get_all(&self) -> Result<Vec<VectorRecord>, VectorStoreError> {
        let Some(store) = self.backend() else {
            let memory = self.memory.read().unwrap_or_else(PoisonError::into_inner);
            return Ok(memory.values().cloned().collect());
        };

        let keys = storage::list_all(store.as_ref(), VECTORS_PREFIX)?;
        let mut records = Vec::with_capacity(keys.len());

        for key in keys.iter().filter(|key| key.ends_with(".json")) {
            match store.get(key) {
                Ok(Some(data)) => match serde_json::from_slice::<VectorRecord>(&data) {
                    Ok(record) => records.push(record),
                    Err(err) => log::warn!("skipping malformed vector {key}: {err}"),
                },
                Ok(None) => {}
                Err(err) => log::warn!("skipping unreadable vector {key}: {err}"),
            }
        }

        Ok(records)
    }

    /// Whether any record exists. Lists at most one key.
    pub fn exists(&self) -> Result<bool, VectorStoreError> {
        match self.backend() {
            Some(store) => Ok(!store.list(VECTORS_PREFIX, None, 1)?.keys.is_empty()),
            None => Ok(!self
                .memory
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .is_empty()),
        }
    }

    /// Number of indexed types, listed page by page without fetching
    /// records. A type stored in both layouts counts once.
    pub fn count(&self) -> Result<usize, VectorStoreError> {
        let Some(store) = self.backend() else {
            return Ok(self.memory.read().unwrap_or_else(PoisonError::into_inner).len());
        };

        let mut types = HashSet::new();
        let mut continuation: Option<String> = None;
        loop {
            let page = store.list(VECTORS_PREFIX, continuation.as_deref(), LIST_PAGE_SIZE)?;
            types.extend(page.keys.iter().filter_map(|key| indexed_type(key)).map(str::to_string));

            match page.next {
                Some(next) => continuation = Some(next),
                None => break,
            }
        }
        Ok(types.len())
    }

    /// Removes the record in both layouts. Returns whether the canonical
    /// record existed.
    pub fn delete(&self, name: &str) -> Result<bool, VectorStoreError> {
        let Some(store) = self.backend() else {
            let mut memory = self.memory.write().unwrap_or_else(PoisonError::into_inner);
            return Ok(memory.remove(name).is_some());
        };

        let key = key_for(name);
        let existed = store.head_exists(&key)?;
        store.delete(&key)?;
        self.remove_legacy(store.as_ref(), name);
        Ok(existed)
    }

    /// Deletes every record. Individual delete failures are logged.
    pub fn clear(&self) -> Result<usize, VectorStoreError> {
        let Some(store) = self.backend() else {
            let mut memory = self.memory.write().unwrap_or_else(PoisonError::into_inner);
            let removed = memory.len();
            memory.clear();
            return Ok(removed);
        };

        let keys = storage::list_all(store.as_ref(), VECTORS_PREFIX)?;
        let mut removed = 0;
        for key in &keys {
            match store.delete(key) {
                Ok(()) => removed += 1,
                Err(err) => log::warn!("failed to delete vector {key}: {err}"),
            }
        }
        log::info!("cleared {removed} vector records");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_id_normalizes_names() {
        assert_eq!(record_id("NAME.FIRST"), "name-first");
        assert_eq!(record_id("  Employee ID (v2) "), "employee-id-v2");
        assert_eq!(record_id("EMAIL"), "email");
    }

    #[test]
    fn record_reads_older_field_names() {
        let raw = r#"{
            "id": "email",
            "semanticType": "EMAIL",
            "type": "built-in",
            "embedding": [0.5, 0.5],
            "originalText": "Semantic Type: EMAIL\n",
            "pluginType": "regex",
            "createdAt": "2024-05-01T10:00:00Z",
            "extra": 1
        }"#;
        let record: VectorRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(record.origin, TypeOrigin::BuiltIn);
        assert_eq!(record.source_text, "Semantic Type: EMAIL\n");
        assert_eq!(record.plugin_kind, "regex");
        assert!(record.examples.is_empty());
    }

    #[test]
    fn keys_use_canonical_and_legacy_layouts() {
        assert_eq!(key_for("A/B"), "vectors/A_SLASH_B.json");
        assert_eq!(legacy_prefix("A/B"), "vectors/A_SLASH_B/");
    }

    #[test]
    fn indexed_type_of_keys() {
        assert_eq!(indexed_type("vectors/EMAIL.json"), Some("EMAIL"));
        assert_eq!(indexed_type("vectors/EMAIL/1714557600000.json"), Some("EMAIL"));
        assert_eq!(indexed_type("vectors/EMAIL/nested/x.json"), None);
        assert_eq!(indexed_type("vectors/notes.txt"), None);
        assert_eq!(indexed_type("other/EMAIL.json"), None);
    }
}
