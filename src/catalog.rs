//! User-facing operations on semantic types: validated mutations that keep
//! the vector index in step, and listings that merge built-in types with
//! stored ones.

use std::{collections::BTreeMap, path::Path, sync::Arc};

use crate::{
    definitions::{now_millis, SemanticTypeDefinition},
    repository::{HybridRepository, RepoError},
    semantic::{DefinitionSource, IndexManager},
};

/// Types shipped with the classification library.
pub trait BuiltInTypes: Send + Sync {
    fn definitions(&self) -> Vec<SemanticTypeDefinition>;

    fn find(&self, name: &str) -> Option<SemanticTypeDefinition> {
        self.definitions().into_iter().find(|def| def.name == name)
    }
}

pub struct NoBuiltIns;

impl BuiltInTypes for NoBuiltIns {
    fn definitions(&self) -> Vec<SemanticTypeDefinition> {
        vec![]
    }
}

/// Built-in types read once from a JSON array file.
pub struct JsonBuiltIns {
    defs: Vec<SemanticTypeDefinition>,
}

impl JsonBuiltIns {
    pub fn load(path: &Path) -> Result<Self, RepoError> {
        let data = std::fs::read(path)?;
        let mut defs: Vec<SemanticTypeDefinition> = serde_json::from_slice(&data)?;
        for def in defs.iter_mut() {
            def.is_built_in = true;
        }
        log::info!("loaded {} built-in types from {}", defs.len(), path.display());
        Ok(JsonBuiltIns { defs })
    }

    #[cfg(test)]
    pub fn from_definitions(defs: Vec<SemanticTypeDefinition>) -> Self {
        let defs = defs
            .into_iter()
            .map(|mut def| {
                def.is_built_in = true;
                def
            })
            .collect();
        JsonBuiltIns { defs }
    }
}

impl BuiltInTypes for JsonBuiltIns {
    fn definitions(&self) -> Vec<SemanticTypeDefinition> {
        self.defs.clone()
    }
}

/// Every available type: built-ins overridden by stored definitions of the
/// same name.
pub struct TypePool {
    repo: Arc<HybridRepository>,
    built_ins: Arc<dyn BuiltInTypes>,
}

impl TypePool {
    pub fn new(repo: Arc<HybridRepository>, built_ins: Arc<dyn BuiltInTypes>) -> Self {
        TypePool { repo, built_ins }
    }

    pub fn all(&self) -> Result<Vec<SemanticTypeDefinition>, RepoError> {
        let mut merged: BTreeMap<String, SemanticTypeDefinition> = self
            .built_ins
            .definitions()
            .into_iter()
            .map(|def| (def.name.clone(), def))
            .collect();
        let built_in_count = merged.len();

        for mut def in self.repo.find_all()? {
            def.is_built_in = false;
            merged.insert(def.name.clone(), def);
        }

        log::debug!(
            "semantic type pool: {} total, {built_in_count} built-in before overrides",
            merged.len()
        );
        Ok(merged.into_values().collect())
    }

    pub fn get(&self, name: &str) -> Result<Option<SemanticTypeDefinition>, RepoError> {
        if let Some(mut def) = self.repo.find_by_name(name)? {
            def.is_built_in = false;
            return Ok(Some(def));
        }
        Ok(self.built_ins.find(name))
    }
}

impl DefinitionSource for TypePool {
    fn definitions(&self) -> Result<Vec<SemanticTypeDefinition>, RepoError> {
        self.all()
    }
}

pub struct Catalog {
    repo: Arc<HybridRepository>,
    pool: Arc<TypePool>,
    built_ins: Arc<dyn BuiltInTypes>,
    indexer: Arc<IndexManager>,
}

impl Catalog {
    pub fn new(
        repo: Arc<HybridRepository>,
        pool: Arc<TypePool>,
        built_ins: Arc<dyn BuiltInTypes>,
        indexer: Arc<IndexManager>,
    ) -> Self {
        Catalog {
            repo,
            pool,
            built_ins,
            indexer,
        }
    }

    /// Stores a new definition and queues it for indexing.
    pub fn add(
        &self,
        mut def: SemanticTypeDefinition,
    ) -> Result<SemanticTypeDefinition, RepoError> {
        def.validate()?;

        if self.built_ins.find(&def.name).is_some() {
            log::debug!("{} overrides the built-in type of the same name", def.name);
        }

        def.is_built_in = false;
        def.normalize(now_millis());

        let saved = self.repo.insert(def)?;
        log::info!("added semantic type {}", saved.name);
        self.indexer.reindex_one(&saved);
        Ok(saved)
    }

    /// Replaces `old_name`, possibly renaming it. `Ok(None)` when it does not exist.
    pub fn update(
        &self,
        old_name: &str,
        mut def: SemanticTypeDefinition,
    ) -> Result<Option<SemanticTypeDefinition>, RepoError> {
        def.validate()?;

        let Some(existing) = self.repo.find_by_name(old_name)? else {
            return Ok(None);
        };
        if def.created_at.is_none() {
            def.created_at = existing.created_at;
        }
        def.is_built_in = false;
        def.normalize(now_millis());

        let Some(updated) = self.repo.update(old_name, def)? else {
            return Ok(None);
        };

        if updated.name != old_name {
            log::info!("renamed semantic type {old_name} to {}", updated.name);
            self.restore_or_remove_index(old_name);
        } else {
            log::info!("updated semantic type {}", updated.name);
        }
        self.indexer.reindex_one(&updated);
        Ok(Some(updated))
    }

    /// Deletes a stored definition. `Ok(false)` when it does not exist.
    pub fn remove(&self, name: &str) -> Result<bool, RepoError> {
        if !self.repo.delete_by_name(name)? {
            return Ok(false);
        }
        log::info!("removed semantic type {name}");
        self.restore_or_remove_index(name);
        Ok(true)
    }

    /// A removed override exposes the built-in again; anything else leaves
    /// the index.
    fn restore_or_remove_index(&self, name: &str) {
        match self.built_ins.find(name) {
            Some(built_in) => self.indexer.reindex_one(&built_in),
            None => self.indexer.remove_one(name),
        }
    }

    pub fn get(&self, name: &str) -> Result<Option<SemanticTypeDefinition>, RepoError> {
        self.pool.get(name)
    }

    pub fn list_all(&self) -> Result<Vec<SemanticTypeDefinition>, RepoError> {
        self.pool.all()
    }

    /// Stored definitions only, without built-ins.
    pub fn list_custom(&self) -> Result<Vec<SemanticTypeDefinition>, RepoError> {
        self.repo.find_all()
    }

    /// Re-reads definitions from the active store.
    pub fn reload(&self) -> Result<usize, RepoError> {
        self.repo.reload()?;
        Ok(self.repo.find_all()?.len())
    }
}
