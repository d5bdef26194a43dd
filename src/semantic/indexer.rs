//! Builds and maintains the vector index from semantic type definitions.
//!
//! Work runs on a background queue thread fed through an `mpsc` channel:
//! incremental hooks execute on the queue thread in submission order, bulk
//! passes are handed to a dedicated thread and fan out over
//! `worker_threads` scoped workers.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc, Arc, Mutex, PoisonError,
    },
    thread::{sleep, JoinHandle},
    time::{Duration, Instant},
};

use chrono::Utc;
use serde::Serialize;

use crate::{definitions::SemanticTypeDefinition, repository::RepoError};

use super::{
    embeddings::{Embedder, EmbeddingError},
    text::{index_text, MAX_EXAMPLES},
    vectors::{record_id, TypeOrigin, VectorRecord, VectorStore, VectorStoreError},
};

/// Supplies the full set of definitions a bulk pass should index.
pub trait DefinitionSource: Send + Sync {
    fn definitions(&self) -> Result<Vec<SemanticTypeDefinition>, RepoError>;
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Vector store error: {0}")]
    Storage(#[from] VectorStoreError),

    #[error("Definition source error: {0}")]
    Source(#[from] RepoError),
}

#[derive(Debug, Clone)]
pub struct IndexOptions {
    /// A bulk pass is skipped when at least this many records exist.
    pub min_indexed_count: usize,
    /// Re-embed every definition on connect, ignoring the minimum count.
    pub force_rebuild: bool,
    pub worker_threads: usize,
}

impl Default for IndexOptions {
    fn default() -> Self {
        IndexOptions {
            min_indexed_count: 132,
            force_rebuild: false,
            worker_threads: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IndexState {
    Idle,
    Indexing,
}

#[derive(Debug, Clone, Serialize)]
pub struct Progress {
    pub state: IndexState,
    pub target: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Outcome of one bulk pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkReport {
    pub skipped: bool,
    pub indexed: usize,
    pub failed: usize,
}

enum IndexTask {
    Bulk { full: bool, clear: bool },
    Reindex(SemanticTypeDefinition),
    Remove(String),
}

/// State shared between the manager handle and its worker threads.
struct Indexer {
    embedder: Arc<dyn Embedder>,
    vectors: Arc<VectorStore>,
    source: Arc<dyn DefinitionSource>,
    opts: IndexOptions,
    indexing: AtomicBool,
    target: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    pending: AtomicUsize,
    /// Types written or removed by incremental tasks while a bulk pass runs.
    /// The pass must not overwrite them with its older snapshot.
    settled: Mutex<HashSet<String>>,
}

/// Resets the indexing flag however the bulk pass ends.
struct IdleGuard<'a>(&'a AtomicBool);

impl Drop for IdleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Marks a submitted task as finished, even if it panics.
struct PendingGuard<'a>(&'a AtomicUsize);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Indexer {
    fn build_record(&self, def: &SemanticTypeDefinition) -> Result<VectorRecord, IndexError> {
        let examples: Vec<String> = def.examples().into_iter().take(MAX_EXAMPLES).collect();
        let text = index_text(&def.name, &def.description, &examples);
        let embedding = self.embedder.embed(&text)?;

        let now = Utc::now();
        let record = VectorRecord {
            id: record_id(&def.name),
            semantic_type: def.name.clone(),
            origin: if def.is_built_in {
                TypeOrigin::BuiltIn
            } else {
                TypeOrigin::Custom
            },
            description: def.description.clone(),
            embedding,
            source_text: text,
            plugin_kind: def.plugin.kind().to_string(),
            examples,
            created_at: now,
            updated_at: now,
        };
        Ok(record)
    }

    /// Runs an incremental change to `name`'s record, marking it settled when
    /// a bulk pass is in flight.
    fn settle<T>(&self, name: &str, apply: impl FnOnce() -> T) -> T {
        let mut settled = self.settled.lock().unwrap_or_else(PoisonError::into_inner);
        let out = apply();
        if self.indexing.load(Ordering::SeqCst) {
            settled.insert(name.to_string());
        }
        out
    }

    fn index_one(&self, def: &SemanticTypeDefinition) -> Result<VectorRecord, IndexError> {
        let record = self.build_record(def)?;
        self.settle(&def.name, || self.vectors.put(&record))?;
        log::debug!("indexed semantic type {}", def.name);
        Ok(record)
    }

    fn remove_one(&self, name: &str) -> Result<bool, VectorStoreError> {
        self.settle(name, || self.vectors.delete(name))
    }

    /// Bulk-pass write. `false` when an incremental task got to the type first.
    fn put_unsettled(&self, def: &SemanticTypeDefinition) -> Result<bool, IndexError> {
        let record = self.build_record(def)?;

        let settled = self.settled.lock().unwrap_or_else(PoisonError::into_inner);
        if settled.contains(&def.name) {
            return Ok(false);
        }
        self.vectors.put(&record)?;
        Ok(true)
    }

    /// Runs with the indexing flag already set; clears it on return.
    fn run_bulk(&self, full: bool, clear: bool) -> BulkReport {
        let _idle = IdleGuard(&self.indexing);
        let started = Instant::now();
        self.settled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        if clear {
            if let Err(err) = self.vectors.clear() {
                log::error!("failed to clear vector index before rebuild: {err}");
            }
        }

        if !full {
            match self.vectors.count() {
                Ok(count) if count >= self.opts.min_indexed_count => {
                    log::info!(
                        "vector index holds {count} records (minimum {}), skipping indexing",
                        self.opts.min_indexed_count
                    );
                    return BulkReport {
                        skipped: true,
                        ..Default::default()
                    };
                }
                Ok(count) => log::info!(
                    "vector index holds {count} records (minimum {}), indexing missing types",
                    self.opts.min_indexed_count
                ),
                Err(err) => log::warn!("could not count vector records, indexing missing types: {err}"),
            }
        }

        let defs = match self.source.definitions() {
            Ok(defs) => defs,
            Err(err) => {
                log::error!("could not enumerate semantic types for indexing: {err}");
                return BulkReport::default();
            }
        };

        let todo: Vec<SemanticTypeDefinition> = if full {
            defs
        } else {
            defs.into_iter()
                .filter(|def| match self.vectors.contains(&def.name) {
                    Ok(present) => !present,
                    Err(err) => {
                        log::warn!("could not check index entry for {}: {err}", def.name);
                        true
                    }
                })
                .collect()
        };

        self.target.store(todo.len(), Ordering::SeqCst);
        self.completed.store(0, Ordering::SeqCst);
        self.failed.store(0, Ordering::SeqCst);
        log::info!("indexing {} semantic types", todo.len());

        let next = AtomicUsize::new(0);
        let workers = self.opts.worker_threads.max(1).min(todo.len().max(1));
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let idx = next.fetch_add(1, Ordering::SeqCst);
                    let Some(def) = todo.get(idx) else {
                        break;
                    };

                    match self.put_unsettled(def) {
                        Ok(written) => {
                            if !written {
                                log::debug!("{} changed during indexing, keeping the newer entry", def.name);
                            }
                            self.completed.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(err) => {
                            self.failed.fetch_add(1, Ordering::SeqCst);
                            log::warn!("failed to index semantic type {}: {err}", def.name);
                        }
                    }
                });
            }
        });

        let report = BulkReport {
            skipped: false,
            indexed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        };
        log::info!(
            "indexing finished in {}ms: {} indexed, {} failed",
            started.elapsed().as_millis(),
            report.indexed,
            report.failed
        );
        report
    }

    fn run(&self, task: IndexTask) {
        let _pending = PendingGuard(&self.pending);
        match task {
            IndexTask::Bulk { full, clear } => {
                self.run_bulk(full, clear);
            }
            IndexTask::Reindex(def) => {
                if let Err(err) = self.index_one(&def) {
                    log::error!("failed to reindex semantic type {}: {err}", def.name);
                }
            }
            IndexTask::Remove(name) => match self.remove_one(&name) {
                Ok(true) => log::debug!("removed {name} from vector index"),
                Ok(false) => log::debug!("{name} was not indexed"),
                Err(err) => log::error!("failed to remove {name} from vector index: {err}"),
            },
        }
    }
}

fn start_queue(task_rx: mpsc::Receiver<IndexTask>, indexer: Arc<Indexer>) {
    log::debug!("index queue waiting for tasks");
    while let Ok(task) = task_rx.recv() {
        match task {
            IndexTask::Bulk { .. } => {
                let indexer = indexer.clone();
                let spawned = std::thread::Builder::new()
                    .name("semtypes-bulk-index".into())
                    .spawn(move || indexer.run(task));

                if let Err(err) = spawned {
                    log::error!("failed to spawn bulk indexing thread: {err}");
                }
            }
            task => indexer.run(task),
        }
    }

    // graceful shutdown
    while indexer.pending.load(Ordering::SeqCst) > 0 {
        sleep(Duration::from_millis(20));
    }
    log::debug!("index queue stopped");
}

/// Keeps the vector index in step with the definitions.
pub struct IndexManager {
    indexer: Arc<Indexer>,
    task_tx: Mutex<Option<mpsc::Sender<IndexTask>>>,
    queue_handle: Mutex<Option<JoinHandle<()>>>,
}

impl IndexManager {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        vectors: Arc<VectorStore>,
        source: Arc<dyn DefinitionSource>,
        opts: IndexOptions,
    ) -> Self {
        let indexer = Arc::new(Indexer {
            embedder,
            vectors,
            source,
            opts,
            indexing: AtomicBool::new(false),
            target: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            settled: Mutex::new(HashSet::new()),
        });

        let (task_tx, task_rx) = mpsc::channel::<IndexTask>();
        let queue_handle = std::thread::spawn({
            let indexer = indexer.clone();
            move || start_queue(task_rx, indexer)
        });

        IndexManager {
            indexer,
            task_tx: Mutex::new(Some(task_tx)),
            queue_handle: Mutex::new(Some(queue_handle)),
        }
    }

    fn submit(&self, task: IndexTask) -> bool {
        let task_tx = self.task_tx.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(task_tx) = task_tx.as_ref() else {
            log::warn!("index queue is shut down, dropping task");
            return false;
        };

        self.indexer.pending.fetch_add(1, Ordering::SeqCst);
        if task_tx.send(task).is_err() {
            self.indexer.pending.fetch_sub(1, Ordering::SeqCst);
            log::error!("index queue is gone, dropping task");
            return false;
        }
        true
    }

    fn start_bulk(&self, full: bool, clear: bool) -> bool {
        if self
            .indexer
            .indexing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::info!("indexing already in progress, ignoring request");
            return false;
        }

        self.indexer.target.store(0, Ordering::SeqCst);
        self.indexer.completed.store(0, Ordering::SeqCst);
        self.indexer.failed.store(0, Ordering::SeqCst);

        if !self.submit(IndexTask::Bulk { full, clear }) {
            self.indexer.indexing.store(false, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Schedules a bulk pass after durable connectivity appears. Returns
    /// `false` when a pass is already running.
    pub fn on_connectivity_established(&self) -> bool {
        self.start_bulk(self.indexer.opts.force_rebuild, false)
    }

    /// Clears the index and re-embeds every definition.
    pub fn rebuild_all(&self) -> bool {
        self.start_bulk(true, true)
    }

    pub fn reindex_one(&self, def: &SemanticTypeDefinition) {
        self.submit(IndexTask::Reindex(def.clone()));
    }

    pub fn remove_one(&self, name: &str) {
        self.submit(IndexTask::Remove(name.to_string()));
    }

    /// Runs a bulk pass on the calling thread. `None` when a pass is already
    /// running.
    pub fn index_all_now(&self, full: bool) -> Option<BulkReport> {
        if self
            .indexer
            .indexing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }
        Some(self.indexer.run_bulk(full, false))
    }

    pub fn is_indexing(&self) -> bool {
        self.indexer.indexing.load(Ordering::SeqCst)
    }

    pub fn progress(&self) -> Progress {
        Progress {
            state: if self.is_indexing() {
                IndexState::Indexing
            } else {
                IndexState::Idle
            },
            target: self.indexer.target.load(Ordering::SeqCst),
            completed: self.indexer.completed.load(Ordering::SeqCst),
            failed: self.indexer.failed.load(Ordering::SeqCst),
        }
    }

    /// Blocks until every submitted task has finished. Returns `false` on
    /// timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let idle = self.indexer.pending.load(Ordering::SeqCst) == 0 && !self.is_indexing();
            if idle {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(Duration::from_millis(10));
        }
    }

    /// Stops accepting tasks and waits for queued work to drain.
    pub fn shutdown(&self) {
        self.task_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let handle = self
            .queue_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.join() {
                log::error!("index queue panicked: {err:?}");
            }
        }
    }
}
