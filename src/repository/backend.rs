use std::{
    collections::HashMap,
    fmt::Display,
    sync::{PoisonError, RwLock, RwLockWriteGuard},
};

use serde::{Deserialize, Serialize};

use crate::definitions::SemanticTypeDefinition;

use super::errors::RepoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendMode {
    FileOnly,
    Remote,
}

impl Display for BackendMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendMode::FileOnly => write!(f, "file"),
            BackendMode::Remote => write!(f, "remote"),
        }
    }
}

/// Stores named semantic type definitions, keeping an in-memory cache
/// consistent with a durable medium.
///
/// Absence is never an error: lookups return `None`, deletes return `false`.
pub trait DefinitionBackend: Send + Sync {
    fn mode(&self) -> BackendMode;

    /// Human readable location of the durable medium.
    fn location(&self) -> String;

    /// Inserts or replaces the definition stored under `def.name`.
    fn save(&self, def: SemanticTypeDefinition) -> Result<SemanticTypeDefinition, RepoError>;

    /// Stores `def` only if its name is free, else `RepoError::Duplicate`.
    fn insert(&self, def: SemanticTypeDefinition) -> Result<SemanticTypeDefinition, RepoError>;

    fn find_by_name(&self, name: &str) -> Result<Option<SemanticTypeDefinition>, RepoError>;

    fn exists_by_name(&self, name: &str) -> Result<bool, RepoError>;

    /// Replaces `old_name` with `def`, renaming when the names differ.
    /// Returns `None` when `old_name` is not stored.
    fn update(
        &self,
        old_name: &str,
        def: SemanticTypeDefinition,
    ) -> Result<Option<SemanticTypeDefinition>, RepoError>;

    fn delete_by_name(&self, name: &str) -> Result<bool, RepoError>;

    /// All definitions ordered by name.
    fn find_all(&self) -> Result<Vec<SemanticTypeDefinition>, RepoError>;

    /// Replaces the cache with the durable medium's contents.
    fn reload(&self) -> Result<(), RepoError>;

    fn len(&self) -> usize;
}

pub(crate) type DefinitionMap = HashMap<String, SemanticTypeDefinition>;

/// A cache key touched by a mutation, with the value it held before.
#[derive(Debug, Clone)]
pub(crate) struct Change {
    pub key: String,
    pub previous: Option<SemanticTypeDefinition>,
}

/// Lock-guarded definition map implementing write-then-persist-or-rollback.
#[derive(Default)]
pub(crate) struct DefinitionCache {
    entries: RwLock<DefinitionMap>,
}

impl DefinitionCache {
    pub fn new(entries: DefinitionMap) -> Self {
        DefinitionCache {
            entries: RwLock::new(entries),
        }
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, DefinitionMap> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, name: &str) -> Option<SemanticTypeDefinition> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.len()
    }

    pub fn snapshot(&self) -> Vec<SemanticTypeDefinition> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut defs: Vec<_> = entries.values().cloned().collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn replace_all(&self, entries: DefinitionMap) {
        *self.write_guard() = entries;
    }

    pub fn save<P>(&self, def: SemanticTypeDefinition, persist: P) -> Result<SemanticTypeDefinition, RepoError>
    where
        P: FnOnce(&DefinitionMap, &[Change]) -> Result<(), RepoError>,
    {
        self.write(
            |entries| {
                let previous = entries.insert(def.name.clone(), def.clone());
                let change = Change {
                    key: def.name.clone(),
                    previous,
                };
                Ok((def, vec![change]))
            },
            persist,
        )
    }

    /// The name check and the write happen under one write guard.
    pub fn insert<P>(&self, def: SemanticTypeDefinition, persist: P) -> Result<SemanticTypeDefinition, RepoError>
    where
        P: FnOnce(&DefinitionMap, &[Change]) -> Result<(), RepoError>,
    {
        self.write(
            |entries| {
                if entries.contains_key(&def.name) {
                    return Err(RepoError::Duplicate(def.name.clone()));
                }
                entries.insert(def.name.clone(), def.clone());
                let change = Change {
                    key: def.name.clone(),
                    previous: None,
                };
                Ok((def, vec![change]))
            },
            persist,
        )
    }

    pub fn update<P>(
        &self,
        old_name: &str,
        def: SemanticTypeDefinition,
        persist: P,
    ) -> Result<Option<SemanticTypeDefinition>, RepoError>
    where
        P: FnOnce(&DefinitionMap, &[Change]) -> Result<(), RepoError>,
    {
        self.write(
            |entries| {
                if !entries.contains_key(old_name) {
                    return Ok((None, vec![]));
                }

                let renamed = def.name != old_name;
                if renamed && entries.contains_key(&def.name) {
                    return Err(RepoError::Duplicate(def.name.clone()));
                }

                let previous_old = entries.remove(old_name);
                let mut changes = vec![Change {
                    key: old_name.to_string(),
                    previous: previous_old,
                }];

                let previous_new = entries.insert(def.name.clone(), def.clone());
                if renamed {
                    changes.push(Change {
                        key: def.name.clone(),
                        previous: previous_new,
                    });
                }

                Ok((Some(def), changes))
            },
            persist,
        )
    }

    pub fn delete<P>(&self, name: &str, persist: P) -> Result<bool, RepoError>
    where
        P: FnOnce(&DefinitionMap, &[Change]) -> Result<(), RepoError>,
    {
        self.write(
            |entries| match entries.remove(name) {
                Some(previous) => Ok((
                    true,
                    vec![Change {
                        key: name.to_string(),
                        previous: Some(previous),
                    }],
                )),
                None => Ok((false, vec![])),
            },
            persist,
        )
    }

    /// Applies a mutation, persists it, and undoes it if persisting fails.
    /// The write guard is held for the whole sequence.
    fn write<T, A, P>(&self, apply: A, persist: P) -> Result<T, RepoError>
    where
        A: FnOnce(&mut DefinitionMap) -> Result<(T, Vec<Change>), RepoError>,
        P: FnOnce(&DefinitionMap, &[Change]) -> Result<(), RepoError>,
    {
        let mut entries = self.write_guard();
        let (out, changes) = apply(&mut entries)?;

        if changes.is_empty() {
            return Ok(out);
        }

        if let Err(err) = persist(&entries, &changes) {
            for change in changes.into_iter().rev() {
                match change.previous {
                    Some(previous) => {
                        entries.insert(change.key, previous);
                    }
                    None => {
                        entries.remove(&change.key);
                    }
                }
            }
            return Err(err);
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreError;

    fn def(name: &str) -> SemanticTypeDefinition {
        SemanticTypeDefinition::list(name, "desc", &["A"])
    }

    fn fail(_: &DefinitionMap, _: &[Change]) -> Result<(), RepoError> {
        Err(StoreError::Unavailable("injected".into()).into())
    }

    fn ok(_: &DefinitionMap, _: &[Change]) -> Result<(), RepoError> {
        Ok(())
    }

    #[test]
    fn failed_persist_restores_previous_entries() {
        let cache = DefinitionCache::default();
        cache.save(def("A"), ok).unwrap();
        cache.save(def("B"), ok).unwrap();
        let before = cache.snapshot();

        let mut changed = def("A");
        changed.description = "changed".into();
        assert!(cache.save(changed.clone(), fail).is_err());
        assert!(cache.update("A", def("C"), fail).is_err());
        assert!(cache.delete("B", fail).is_err());

        assert_eq!(cache.snapshot(), before);
    }

    #[test]
    fn update_rename_moves_key() {
        let cache = DefinitionCache::default();
        cache.save(def("A"), ok).unwrap();

        let mut seen = vec![];
        let renamed = cache
            .update("A", def("B"), |_, changes| {
                seen = changes.iter().map(|c| c.key.clone()).collect();
                Ok(())
            })
            .unwrap();

        assert_eq!(renamed.map(|d| d.name), Some("B".to_string()));
        assert_eq!(seen, vec!["A", "B"]);
        assert!(!cache.contains("A"));
        assert!(cache.contains("B"));
    }

    #[test]
    fn update_missing_and_rename_collision() {
        let cache = DefinitionCache::default();
        cache.save(def("A"), ok).unwrap();
        cache.save(def("B"), ok).unwrap();

        assert!(cache.update("missing", def("X"), fail).unwrap().is_none());
        assert!(matches!(
            cache.update("A", def("B"), ok),
            Err(RepoError::Duplicate(name)) if name == "B"
        ));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn insert_rejects_taken_names_and_rolls_back() {
        let cache = DefinitionCache::default();
        cache.insert(def("A"), ok).unwrap();

        assert!(matches!(
            cache.insert(def("A"), ok),
            Err(RepoError::Duplicate(name)) if name == "A"
        ));
        assert!(cache.insert(def("B"), fail).is_err());
        assert!(!cache.contains("B"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn delete_missing_skips_persist() {
        let cache = DefinitionCache::default();
        assert!(!cache.delete("nope", fail).unwrap());
    }
}
