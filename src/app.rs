use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use homedir::my_home;
use serde::Serialize;

use crate::{
    catalog::{BuiltInTypes, Catalog, JsonBuiltIns, NoBuiltIns, TypePool},
    config::Config,
    repository::{container_name, BackendMode, FileBackend, HybridRepository, RemoteOptions, StorageStatus},
    semantic::{
        Embedder, IndexManager, LazyEmbedder, Progress, SimilaritySearch, VectorStore,
    },
    storage::{DirConnector, DirStore, HttpConnector, ObjectStore, RemoteConnector},
};

const VECTORS_CONTAINER_PREFIX: &str = "semantic-vectors";
const LOCAL_VECTORS_CONTAINER: &str = "vectors-local";

/// Resolves the data directory: `$SEMTYPES_BASE_PATH`, else
/// `~/.local/share/semtypes`.
pub fn base_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("SEMTYPES_BASE_PATH") {
        return Ok(PathBuf::from(path));
    }

    let home = my_home()
        .context("could not determine home directory")?
        .context("home directory path is empty")?;
    Ok(home.join(".local/share/semtypes"))
}

/// Builds the connector described by `[remote]`. Endpoints starting with
/// `file://` address a directory instead of a network service.
pub fn connector_from_config(config: &Config) -> anyhow::Result<Box<dyn RemoteConnector>> {
    let remote = &config.remote;

    if let Some(root) = remote.endpoint.strip_prefix("file://") {
        log::info!("using directory {root} as remote store");
        return Ok(Box::new(DirConnector {
            root: PathBuf::from(root),
            region: remote.region.clone(),
            identity: Some("local".to_string()),
        }));
    }

    let token = std::env::var(&remote.token_env).ok();
    if token.is_none() {
        log::warn!("{} is not set, connecting without credentials", remote.token_env);
    }

    let connector = HttpConnector::new(
        &remote.endpoint,
        token,
        &remote.region,
        Duration::from_secs(remote.timeout_secs),
    )
    .context("failed to build remote client")?;
    Ok(Box::new(connector))
}

#[derive(Debug, Clone, Serialize)]
pub struct AppStatus {
    pub storage: StorageStatus,
    pub vectors_durable: bool,
    pub indexed: usize,
    pub indexing: Progress,
}

pub struct App {
    config: Config,
    repo: Arc<HybridRepository>,
    vectors: Arc<VectorStore>,
    local_vectors: Option<Arc<dyn ObjectStore>>,
    indexer: Arc<IndexManager>,
    search: SimilaritySearch,
    catalog: Catalog,
}

impl App {
    /// Wires the application with the configured fastembed model, loaded on
    /// first use.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let embedder = Arc::new(LazyEmbedder::new(
            &config.embedding.model,
            config.base_path().to_path_buf(),
        ));
        Self::with_embedder(config, embedder)
    }

    pub fn with_embedder(config: Config, embedder: Arc<dyn Embedder>) -> anyhow::Result<Self> {
        let definitions_path = config.definitions_path();
        let file = FileBackend::load(&definitions_path)
            .with_context(|| format!("failed to load {}", definitions_path.display()))?;

        let remote_opts = RemoteOptions {
            container: config.remote.definitions_container.clone(),
            async_persist: config.remote.async_persist,
            ..Default::default()
        };
        let repo = Arc::new(HybridRepository::new(Arc::new(file), remote_opts));

        let built_ins: Arc<dyn BuiltInTypes> = match config.built_ins_path() {
            Some(path) => Arc::new(
                JsonBuiltIns::load(&path)
                    .with_context(|| format!("failed to load built-in types from {}", path.display()))?,
            ),
            None => Arc::new(NoBuiltIns),
        };

        let local_vectors: Option<Arc<dyn ObjectStore>> = if config.storage.persist_local_vectors {
            let store = DirStore::new(config.base_path(), LOCAL_VECTORS_CONTAINER);
            store
                .create_container_if_absent()
                .context("failed to create local vector directory")?;
            Some(Arc::new(store))
        } else {
            None
        };

        let vectors = Arc::new(match &local_vectors {
            Some(store) => VectorStore::durable(store.clone()),
            None => VectorStore::in_memory(),
        });

        let pool = Arc::new(TypePool::new(repo.clone(), built_ins.clone()));
        let indexer = Arc::new(IndexManager::new(
            embedder.clone(),
            vectors.clone(),
            pool.clone(),
            config.index_options(),
        ));

        let search = SimilaritySearch::new(embedder, vectors.clone(), config.search.default_threshold)
            .with_limits(config.search.top_k, config.search.disambiguation_k);
        let catalog = Catalog::new(repo.clone(), pool, built_ins, indexer.clone());

        Ok(App {
            config,
            repo,
            vectors,
            local_vectors,
            indexer,
            search,
            catalog,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn search(&self) -> &SimilaritySearch {
        &self.search
    }

    pub fn indexer(&self) -> &IndexManager {
        &self.indexer
    }

    pub fn repository(&self) -> &HybridRepository {
        &self.repo
    }

    pub fn vectors(&self) -> &VectorStore {
        &self.vectors
    }

    /// Switches definitions to the remote store and, when that succeeds,
    /// moves vectors to the remote vector container. A bulk index pass is
    /// scheduled when `schedule_index` is set. Never fails; returns the
    /// resulting mode.
    pub fn connect(&self, connector: &dyn RemoteConnector, schedule_index: bool) -> BackendMode {
        let mode = self.repo.switch_to_remote(connector);
        if mode != BackendMode::Remote {
            return mode;
        }

        let container = match &self.config.remote.vectors_container {
            Some(name) => name.clone(),
            None => container_name(
                VECTORS_CONTAINER_PREFIX,
                connector.account_identity(),
                connector.region(),
            ),
        };

        let opened = connector.open(&container).and_then(|store| {
            store.create_container_if_absent()?;
            Ok(store)
        });
        match opened {
            Ok(store) => {
                self.vectors.attach(store);
                if schedule_index {
                    self.indexer.on_connectivity_established();
                }
            }
            Err(err) => {
                log::warn!("vector container {container} is unavailable, keeping current vector store: {err}")
            }
        }

        mode
    }

    /// Returns to file mode and to local vectors.
    pub fn disconnect(&self) {
        self.repo.switch_to_file_only();
        match &self.local_vectors {
            Some(store) => self.vectors.attach(store.clone()),
            None => self.vectors.detach(),
        }
    }

    pub fn status(&self) -> anyhow::Result<AppStatus> {
        Ok(AppStatus {
            storage: self.repo.storage_status(),
            vectors_durable: self.vectors.is_durable(),
            indexed: self.vectors.count().context("failed to count vector records")?,
            indexing: self.indexer.progress(),
        })
    }

    /// Drains queued index work.
    pub fn shutdown(&self) {
        self.indexer.shutdown();
    }
}
