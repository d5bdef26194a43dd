use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::{
    semantic::IndexOptions,
    storage::{DirStore, ObjectStore},
};

const CONFIG_FILE: &str = "config.yaml";

const DEFAULT_THRESHOLD: f32 = crate::semantic::DEFAULT_THRESHOLD;
const DEFAULT_MIN_INDEXED_COUNT: usize = 132;
const DEFAULT_WORKER_THREADS: usize = 2;
const DEFAULT_REMOTE_TIMEOUT_SECS: u64 = 10;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Threshold used by "most similar" lookups [0.0, 1.0]
    #[serde(default = "default_threshold")]
    pub default_threshold: f32,

    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default = "default_disambiguation_k")]
    pub disambiguation_k: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_threshold: DEFAULT_THRESHOLD,
            top_k: crate::semantic::TOP_K,
            disambiguation_k: crate::semantic::DISAMBIGUATION_K,
        }
    }
}

fn default_threshold() -> f32 {
    DEFAULT_THRESHOLD
}

fn default_top_k() -> usize {
    crate::semantic::TOP_K
}

fn default_disambiguation_k() -> usize {
    crate::semantic::DISAMBIGUATION_K
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Skip bulk indexing on connect when at least this many vectors exist
    #[serde(default = "default_min_indexed_count")]
    pub min_indexed_count: usize,

    /// Re-embed every type on connect
    #[serde(default)]
    pub force_rebuild: bool,

    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            min_indexed_count: DEFAULT_MIN_INDEXED_COUNT,
            force_rebuild: false,
            worker_threads: DEFAULT_WORKER_THREADS,
        }
    }
}

fn default_min_indexed_count() -> usize {
    DEFAULT_MIN_INDEXED_COUNT
}

fn default_worker_threads() -> usize {
    DEFAULT_WORKER_THREADS
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// fastembed model name (e.g. "all-MiniLM-L6-v2")
    #[serde(default = "default_model")]
    pub model: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: crate::semantic::DEFAULT_MODEL.to_string(),
        }
    }
}

fn default_model() -> String {
    crate::semantic::DEFAULT_MODEL.to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Connect to the remote store on startup
    #[serde(default)]
    pub enabled: bool,

    /// `http(s)://host` of the object service, or `file:///path` for a
    /// directory acting as one
    #[serde(default)]
    pub endpoint: String,

    /// Environment variable holding the bearer token
    #[serde(default = "default_token_env")]
    pub token_env: String,

    #[serde(default = "default_region")]
    pub region: String,

    /// Overrides the container derived from account and region
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definitions_container: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vectors_container: Option<String>,

    #[serde(default = "default_remote_timeout_secs")]
    pub timeout_secs: u64,

    /// Write definitions to the remote store in the background
    #[serde(default)]
    pub async_persist: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            token_env: default_token_env(),
            region: default_region(),
            definitions_container: None,
            vectors_container: None,
            timeout_secs: DEFAULT_REMOTE_TIMEOUT_SECS,
            async_persist: false,
        }
    }
}

fn default_token_env() -> String {
    "SEMTYPES_REMOTE_TOKEN".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_remote_timeout_secs() -> u64 {
    DEFAULT_REMOTE_TIMEOUT_SECS
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Definitions file, relative to the base path
    #[serde(default = "default_definitions_file")]
    pub definitions_file: String,

    /// JSON array of built-in types, relative to the base path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub built_ins_file: Option<String>,

    /// Keep vectors on disk while in file mode instead of in memory
    #[serde(default)]
    pub persist_local_vectors: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            definitions_file: default_definitions_file(),
            built_ins_file: None,
            persist_local_vectors: false,
        }
    }
}

fn default_definitions_file() -> String {
    "semantic_types.json".to_string()
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Config {
    fn validate(&mut self) -> anyhow::Result<()> {
        if self.index.worker_threads == 0 {
            self.index.worker_threads = 1
        }

        let search = &self.search;
        if !(0.0..=1.0).contains(&search.default_threshold) {
            bail!(
                "search.default_threshold must be between 0.0 and 1.0, got {}",
                search.default_threshold
            );
        }
        if search.top_k == 0 || search.disambiguation_k == 0 {
            bail!("search.top_k and search.disambiguation_k must be greater than 0");
        }

        if self.embedding.model.trim().is_empty() {
            bail!("embedding.model cannot be empty");
        }

        if self.remote.enabled && self.remote.endpoint.trim().is_empty() {
            bail!("remote.endpoint is required when remote.enabled is true");
        }
        if self.remote.timeout_secs == 0 {
            bail!("remote.timeout_secs must be greater than 0");
        }

        if self.storage.definitions_file.trim().is_empty() {
            bail!("storage.definitions_file cannot be empty");
        }

        Ok(())
    }

    /// Reads `config.yaml` from `base_path`, creating it with defaults when
    /// missing and rewriting it when new fields were filled in.
    pub fn load_with(base_path: &Path) -> anyhow::Result<Self> {
        let store = DirStore::new(base_path, "");
        store
            .create_container_if_absent()
            .with_context(|| format!("failed to create {}", base_path.display()))?;

        if store.get(CONFIG_FILE)?.is_none() {
            log::info!("writing default config to {}", base_path.join(CONFIG_FILE).display());
            store.put(CONFIG_FILE, serde_yml::to_string(&Self::default())?.as_bytes())?;
        }

        let raw = store.get(CONFIG_FILE)?.unwrap_or_default();
        let config_str = String::from_utf8(raw).context("config file is not valid utf8")?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path.to_path_buf();
        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let store = DirStore::new(&self.base_path, "");
        let config_str = serde_yml::to_string(&self)?;
        store.put(CONFIG_FILE, config_str.as_bytes())?;
        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn definitions_path(&self) -> PathBuf {
        self.base_path.join(&self.storage.definitions_file)
    }

    pub fn built_ins_path(&self) -> Option<PathBuf> {
        self.storage
            .built_ins_file
            .as_ref()
            .map(|file| self.base_path.join(file))
    }

    pub fn index_options(&self) -> IndexOptions {
        IndexOptions {
            min_indexed_count: self.index.min_indexed_count,
            force_rebuild: self.index.force_rebuild,
            worker_threads: self.index.worker_threads,
        }
    }

    /// Config rooted at `base_path` without touching the disk.
    #[cfg(test)]
    pub fn in_dir(base_path: &Path) -> Self {
        Config {
            base_path: base_path.to_path_buf(),
            ..Default::default()
        }
    }
}
