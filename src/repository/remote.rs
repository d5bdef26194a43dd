use std::sync::Arc;

use crate::{
    definitions::SemanticTypeDefinition,
    storage::{self, ObjectStore, RemoteConnector, StoreError},
};

use super::{
    backend::{BackendMode, Change, DefinitionBackend, DefinitionCache, DefinitionMap},
    errors::RepoError,
};

pub const DEFINITIONS_PREFIX: &str = "semantic-types/";

#[derive(Debug, Clone)]
pub struct RemoteOptions {
    /// Explicit container name; derived from identity and region when unset.
    pub container: Option<String>,
    pub container_prefix: String,
    /// Persist on a background thread instead of inside the mutating call.
    /// Failed writes are logged and not rolled back in this mode.
    pub async_persist: bool,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        RemoteOptions {
            container: None,
            container_prefix: "semantic-types".to_string(),
            async_persist: false,
        }
    }
}

fn slug(value: &str) -> String {
    value
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .trim_matches('-')
        .to_string()
}

/// Derives a container name unique to an account and region:
/// `<prefix>-<account>-<region>`. Without an identity a random suffix is
/// used, so two regions never share a container by accident.
pub fn container_name(prefix: &str, identity: Option<String>, region: &str) -> String {
    let owner = identity
        .map(|id| slug(&id))
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| {
            let suffix = format!("{:08x}", rand::random::<u32>());
            log::warn!("account identity unavailable, using random container suffix {suffix}");
            suffix
        });

    format!("{}-{}-{}", slug(prefix), owner, slug(region))
}

fn key_for(name: &str) -> String {
    format!("{DEFINITIONS_PREFIX}{}.json", storage::sanitize_name(name))
}

/// Definitions stored one object per name in a durable object store.
pub struct RemoteBackend {
    store: Arc<dyn ObjectStore>,
    cache: DefinitionCache,
    async_persist: bool,
}

impl RemoteBackend {
    pub fn connect(
        connector: &dyn RemoteConnector,
        opts: &RemoteOptions,
    ) -> Result<Self, RepoError> {
        let container = match &opts.container {
            Some(container) => container.clone(),
            None => container_name(
                &opts.container_prefix,
                connector.account_identity(),
                connector.region(),
            ),
        };

        log::info!("connecting definitions backend to container {container}");
        let store = connector.open(&container)?;
        Self::with_store(store, opts.async_persist)
    }

    /// Creates the container if needed and performs the initial resync.
    pub fn with_store(store: Arc<dyn ObjectStore>, async_persist: bool) -> Result<Self, RepoError> {
        store.create_container_if_absent()?;

        let backend = RemoteBackend {
            store,
            cache: DefinitionCache::default(),
            async_persist,
        };
        backend.reload()?;
        Ok(backend)
    }

    pub fn store(&self) -> Arc<dyn ObjectStore> {
        self.store.clone()
    }

    /// Reads every stored definition. Any listing or fetch failure aborts the
    /// whole read; records that fail to decode are skipped.
    fn fetch_all(&self) -> Result<DefinitionMap, RepoError> {
        let keys = storage::list_all(self.store.as_ref(), DEFINITIONS_PREFIX)?;

        let mut entries = DefinitionMap::with_capacity(keys.len());
        for key in keys.iter().filter(|key| key.ends_with(".json")) {
            let data = match self.store.get(key)? {
                Some(data) => data,
                // removed between list and get
                None => continue,
            };

            match serde_json::from_slice::<SemanticTypeDefinition>(&data) {
                Ok(def) => {
                    entries.insert(def.name.clone(), def);
                }
                Err(err) => log::warn!("skipping malformed definition {key}: {err}"),
            }
        }

        Ok(entries)
    }

    fn persist(&self, entries: &DefinitionMap, changes: &[Change]) -> Result<(), RepoError> {
        let ops = plan_writes(entries, changes)?;

        if self.async_persist {
            let store = self.store.clone();
            std::thread::spawn(move || {
                if let Err(err) = apply_writes(store.as_ref(), &ops) {
                    log::error!("background persist failed: {err}");
                }
            });
            return Ok(());
        }

        if let Err(err) = apply_writes(self.store.as_ref(), &ops) {
            self.compensate(&ops, changes);
            return Err(err.into());
        }
        Ok(())
    }

    /// Best-effort undo of the objects a failed multi-key persist already
    /// touched, so the store matches the restored cache.
    fn compensate(&self, ops: &[WriteOp], changes: &[Change]) {
        for op in ops {
            let key = op.key();
            let previous = changes
                .iter()
                .find(|change| key_for(&change.key) == key)
                .and_then(|change| change.previous.as_ref());

            let result = match previous {
                Some(def) => serde_json::to_vec_pretty(def)
                    .map_err(|err| StoreError::Unavailable(err.to_string()))
                    .and_then(|data| self.store.put(key, &data)),
                None => self.store.delete(key),
            };

            if let Err(err) = result {
                log::warn!("could not restore {key} after failed write: {err}");
            }
        }
    }
}

enum WriteOp {
    Put { key: String, data: Vec<u8> },
    Delete { key: String },
}

impl WriteOp {
    fn key(&self) -> &str {
        match self {
            WriteOp::Put { key, .. } | WriteOp::Delete { key } => key,
        }
    }
}

/// Puts go before deletes so a rename never leaves zero copies behind.
fn plan_writes(entries: &DefinitionMap, changes: &[Change]) -> Result<Vec<WriteOp>, RepoError> {
    let mut puts = vec![];
    let mut deletes = vec![];

    for change in changes {
        match entries.get(&change.key) {
            Some(def) => puts.push(WriteOp::Put {
                key: key_for(&def.name),
                data: serde_json::to_vec_pretty(def)?,
            }),
            None => deletes.push(WriteOp::Delete {
                key: key_for(&change.key),
            }),
        }
    }

    puts.extend(deletes);
    Ok(puts)
}

fn apply_writes(store: &dyn ObjectStore, ops: &[WriteOp]) -> Result<(), StoreError> {
    for op in ops {
        let result = match op {
            WriteOp::Put { key, data } => store.put(key, data),
            WriteOp::Delete { key } => store.delete(key),
        };
        if let Err(err) = result {
            log::error!("failed to persist {}: {err}", op.key());
            return Err(err);
        }
    }
    Ok(())
}

impl DefinitionBackend for RemoteBackend {
    fn mode(&self) -> BackendMode {
        BackendMode::Remote
    }

    fn location(&self) -> String {
        self.store.container().to_string()
    }

    fn save(&self, def: SemanticTypeDefinition) -> Result<SemanticTypeDefinition, RepoError> {
        self.cache
            .save(def, |entries, changes| self.persist(entries, changes))
    }

    fn insert(&self, def: SemanticTypeDefinition) -> Result<SemanticTypeDefinition, RepoError> {
        self.cache.insert(def, |entries, changes| self.persist(entries, changes))
    }

    fn find_by_name(&self, name: &str) -> Result<Option<SemanticTypeDefinition>, RepoError> {
        Ok(self.cache.get(name))
    }

    fn exists_by_name(&self, name: &str) -> Result<bool, RepoError> {
        Ok(self.cache.contains(name))
    }

    fn update(
        &self,
        old_name: &str,
        def: SemanticTypeDefinition,
    ) -> Result<Option<SemanticTypeDefinition>, RepoError> {
        self.cache
            .update(old_name, def, |entries, changes| self.persist(entries, changes))
    }

    fn delete_by_name(&self, name: &str) -> Result<bool, RepoError> {
        self.cache
            .delete(name, |entries, changes| self.persist(entries, changes))
    }

    fn find_all(&self) -> Result<Vec<SemanticTypeDefinition>, RepoError> {
        Ok(self.cache.snapshot())
    }

    fn reload(&self) -> Result<(), RepoError> {
        let entries = self.fetch_all().map_err(|err| {
            log::error!(
                "resync of {} failed, keeping cached definitions: {err}",
                self.store.container()
            );
            err
        })?;

        log::info!(
            "loaded {} definitions from {}",
            entries.len(),
            self.store.container()
        );
        self.cache.replace_all(entries);
        Ok(())
    }

    fn len(&self) -> usize {
        self.cache.len()
    }
}
