use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Instant,
};

use crate::definitions::SemanticTypeDefinition;

use super::{
    backend::{BackendMode, DefinitionBackend, DefinitionCache, DefinitionMap},
    errors::RepoError,
};

/// Keeps every definition in one JSON array file, rewritten on each mutation.
pub struct FileBackend {
    path: PathBuf,
    cache: DefinitionCache,
}

impl FileBackend {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RepoError> {
        let path = path.as_ref().to_path_buf();

        if let Err(err) = std::fs::metadata(&path) {
            match err.kind() {
                ErrorKind::NotFound => {
                    log::info!("creating new definitions file at {}", path.display());
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    write_atomic(&path, b"[]")?;
                }
                _ => Err(err)?,
            }
        }

        let entries = read_file(&path)?;
        Ok(FileBackend {
            path,
            cache: DefinitionCache::new(entries),
        })
    }
}

fn read_file(path: &Path) -> Result<DefinitionMap, RepoError> {
    let now = Instant::now();
    let data = std::fs::read(path)?;
    let defs: Vec<SemanticTypeDefinition> = serde_json::from_slice(&data)?;

    let mut entries = DefinitionMap::with_capacity(defs.len());
    for def in defs {
        if let Some(dup) = entries.insert(def.name.clone(), def) {
            log::warn!("{}: duplicate definition in file, keeping the last one", dup.name);
        }
    }

    log::debug!(
        "took {}ms to read {} definitions",
        now.elapsed().as_micros() as f64 / 1000.0,
        entries.len()
    );
    Ok(entries)
}

fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("definitions.json");
    let temp_path = path.with_file_name(format!(
        ".{file_name}.{}.tmp",
        rusty_ulid::generate_ulid_string()
    ));

    std::fs::write(&temp_path, data)?;
    if let Err(err) = std::fs::rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(err);
    }
    Ok(())
}

fn persist_to(path: &Path, entries: &DefinitionMap) -> Result<(), RepoError> {
    let mut defs: Vec<&SemanticTypeDefinition> = entries.values().collect();
    defs.sort_by(|a, b| a.name.cmp(&b.name));

    let data = serde_json::to_vec_pretty(&defs)?;
    write_atomic(path, &data).map_err(|err| {
        log::error!("failed to write {}: {err}", path.display());
        RepoError::IO(err)
    })
}

impl DefinitionBackend for FileBackend {
    fn mode(&self) -> BackendMode {
        BackendMode::FileOnly
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }

    fn save(&self, def: SemanticTypeDefinition) -> Result<SemanticTypeDefinition, RepoError> {
        self.cache
            .save(def, |entries, _| persist_to(&self.path, entries))
    }

    fn insert(&self, def: SemanticTypeDefinition) -> Result<SemanticTypeDefinition, RepoError> {
        self.cache.insert(def, |entries, _| persist_to(&self.path, entries))
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
            .update(old_name, def, |entries, _| persist_to(&self.path, entries))
    }

    fn delete_by_name(&self, name: &str) -> Result<bool, RepoError> {
        self.cache
            .delete(name, |entries, _| persist_to(&self.path, entries))
    }

    fn find_all(&self) -> Result<Vec<SemanticTypeDefinition>, RepoError> {
        Ok(self.cache.snapshot())
    }

    fn reload(&self) -> Result<(), RepoError> {
        let entries = read_file(&self.path)?;
        log::info!(
            "reloaded {} definitions from {}",
            entries.len(),
            self.path.display()
        );
        self.cache.replace_all(entries);
        Ok(())
    }

    fn len(&self) -> usize {
        self.cache.len()
    }
}
