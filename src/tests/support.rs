use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use crate::{
    definitions::SemanticTypeDefinition,
    repository::RepoError,
    semantic::{embeddings::EmbeddingError, DefinitionSource, Embedder},
    storage::{IdentityProvider, ListPage, ObjectStore, RemoteConnector, StoreError},
};

pub fn list_def(name: &str, description: &str, values: &[&str]) -> SemanticTypeDefinition {
    SemanticTypeDefinition::list(name, description, values)
}

/// Fixed set of definitions for the indexer.
#[derive(Default)]
pub struct StaticSource {
    pub defs: Mutex<Vec<SemanticTypeDefinition>>,
}

impl StaticSource {
    pub fn new(defs: Vec<SemanticTypeDefinition>) -> Self {
        StaticSource {
            defs: Mutex::new(defs),
        }
    }
}

impl DefinitionSource for StaticSource {
    fn definitions(&self) -> Result<Vec<SemanticTypeDefinition>, RepoError> {
        Ok(self.defs.lock().unwrap().clone())
    }
}

/// Object store held in memory, with switches to make operations fail.
#[derive(Default)]
pub struct MemoryStore {
    container: String,
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    pub fail_writes: AtomicBool,
    pub fail_reads: AtomicBool,
    /// Fail every put after this many more succeed.
    pub puts_before_failure: Mutex<Option<usize>>,
    pub lists: AtomicUsize,
    pub gets: AtomicUsize,
}

impl MemoryStore {
    pub fn new(container: &str) -> Self {
        MemoryStore {
            container: container.to_string(),
            ..Default::default()
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn insert_raw(&self, key: &str, data: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), data.to_vec());
    }

    fn check_reads(&self) -> Result<(), StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("reads disabled".into()));
        }
        Ok(())
    }

    fn check_writes(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".into()));
        }
        Ok(())
    }
}

impl ObjectStore for MemoryStore {
    fn container(&self) -> &str {
        &self.container
    }

    fn create_container_if_absent(&self) -> Result<(), StoreError> {
        self.check_writes()
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        self.check_writes()?;
        {
            let mut budget = self.puts_before_failure.lock().unwrap();
            if let Some(left) = budget.as_mut() {
                if *left == 0 {
                    return Err(StoreError::Unavailable("put budget exhausted".into()));
                }
                *left -= 1;
            }
        }
        self.insert_raw(key, data);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check_reads()?;
        self.gets.fetch_add(1, Ordering::SeqCst);
        Ok(self.raw(key))
    }

    fn head_exists(&self, key: &str) -> Result<bool, StoreError> {
        self.check_reads()?;
        Ok(self.objects.lock().unwrap().contains_key(key))
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check_writes()?;
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    fn list(
        &self,
        prefix: &str,
        continuation: Option<&str>,
        limit: usize,
    ) -> Result<ListPage, StoreError> {
        self.check_reads()?;
        self.lists.fetch_add(1, Ordering::SeqCst);

        let objects = self.objects.lock().unwrap();
        let matching: Vec<&String> = objects
            .keys()
            .filter(|key| key.starts_with(prefix))
            .filter(|key| continuation.map_or(true, |token| key.as_str() > token))
            .collect();

        let keys: Vec<String> = matching.iter().take(limit.max(1)).map(|k| k.to_string()).collect();
        let next = if matching.len() > keys.len() {
            keys.last().cloned()
        } else {
            None
        };
        Ok(ListPage { keys, next })
    }
}

/// Hands out shared `MemoryStore` containers by name.
pub struct MemoryConnector {
    pub identity: Option<String>,
    pub region: String,
    pub available: AtomicBool,
    containers: Mutex<HashMap<String, Arc<MemoryStore>>>,
}

impl MemoryConnector {
    pub fn new(identity: &str, region: &str) -> Self {
        MemoryConnector {
            identity: Some(identity.to_string()),
            region: region.to_string(),
            available: AtomicBool::new(true),
            containers: Mutex::new(HashMap::new()),
        }
    }

    pub fn container(&self, name: &str) -> Arc<MemoryStore> {
        self.containers
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryStore::new(name)))
            .clone()
    }

    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.containers.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

impl IdentityProvider for MemoryConnector {
    fn account_identity(&self) -> Option<String> {
        self.identity.clone()
    }
}

impl RemoteConnector for MemoryConnector {
    fn region(&self) -> &str {
        &self.region
    }

    fn open(&self, container: &str) -> Result<Arc<dyn ObjectStore>, StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connector offline".into()));
        }
        Ok(self.container(container))
    }
}

/// Deterministic bag-of-words embedder: every distinct lower-cased token
/// gets its own dimension, so cosine similarity measures word overlap.
pub struct VocabularyEmbedder {
    dimensions: usize,
    vocabulary: Mutex<HashMap<String, usize>>,
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
    pub delay_ms: AtomicU64,
}

impl VocabularyEmbedder {
    pub fn new() -> Self {
        VocabularyEmbedder {
            dimensions: 512,
            vocabulary: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Embedder for VocabularyEmbedder {
    fn name(&self) -> &str {
        "vocabulary"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(EmbeddingError::EmbeddingFailed("embedder disabled".into()));
        }

        let mut vocabulary = self.vocabulary.lock().unwrap();
        let mut vector = vec![0.0f32; self.dimensions];
        let tokens = text
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|token| !token.is_empty())
            .map(str::to_lowercase);

        for token in tokens {
            let next = vocabulary.len();
            let dim = *vocabulary.entry(token).or_insert(next);
            assert!(dim < self.dimensions, "vocabulary exhausted");
            vector[dim] += 1.0;
        }
        Ok(vector)
    }
}
