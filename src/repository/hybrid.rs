use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError, RwLock, RwLockReadGuard,
};

use serde::Serialize;

use crate::{definitions::SemanticTypeDefinition, storage::RemoteConnector};

use super::{
    backend::{BackendMode, DefinitionBackend},
    errors::RepoError,
    file::FileBackend,
    remote::{RemoteBackend, RemoteOptions},
};

#[derive(Debug, Clone, Serialize)]
pub struct StorageStatus {
    pub mode: BackendMode,
    pub location: String,
    pub definitions: usize,
}

/// The one storage entry point. Holds exactly one active backend and swaps
/// it when connectivity changes.
///
/// Every CRUD call holds the read guard for "read pointer + one operation";
/// a switch holds the write guard while it swaps, so no call observes a
/// half-finished switch.
pub struct HybridRepository {
    active: RwLock<Arc<dyn DefinitionBackend>>,
    file: Arc<FileBackend>,
    remote_opts: RemoteOptions,
    /// Serializes switches without blocking CRUD while a remote connects.
    switching: Mutex<()>,
    /// Set once a remote backend became active; the file only needs
    /// clearing after that.
    remote_used: AtomicBool,
}

impl HybridRepository {
    pub fn new(file: Arc<FileBackend>, remote_opts: RemoteOptions) -> Self {
        let active: Arc<dyn DefinitionBackend> = file.clone();
        HybridRepository {
            active: RwLock::new(active),
            file,
            remote_opts,
            switching: Mutex::new(()),
            remote_used: AtomicBool::new(false),
        }
    }

    fn backend(&self) -> RwLockReadGuard<'_, Arc<dyn DefinitionBackend>> {
        self.active.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn swap(&self, backend: Arc<dyn DefinitionBackend>) {
        *self.active.write().unwrap_or_else(PoisonError::into_inner) = backend;
    }

    pub fn mode(&self) -> BackendMode {
        self.backend().mode()
    }

    pub fn storage_status(&self) -> StorageStatus {
        let backend = self.backend();
        StorageStatus {
            mode: backend.mode(),
            location: backend.location(),
            definitions: backend.len(),
        }
    }

    pub fn save(&self, def: SemanticTypeDefinition) -> Result<SemanticTypeDefinition, RepoError> {
        let backend = self.backend();
        log::debug!("saving {} to {} backend", def.name, backend.mode());
        backend.save(def)
    }

    /// Stores a definition under a name not yet taken. Fails with
    /// `RepoError::Duplicate` otherwise.
    pub fn insert(&self, def: SemanticTypeDefinition) -> Result<SemanticTypeDefinition, RepoError> {
        let backend = self.backend();
        log::debug!("inserting {} into {} backend", def.name, backend.mode());
        backend.insert(def)
    }

    pub fn find_by_name(&self, name: &str) -> Result<Option<SemanticTypeDefinition>, RepoError> {
        self.backend().find_by_name(name)
    }

    pub fn exists_by_name(&self, name: &str) -> Result<bool, RepoError> {
        self.backend().exists_by_name(name)
    }

    pub fn update(
        &self,
        old_name: &str,
        def: SemanticTypeDefinition,
    ) -> Result<Option<SemanticTypeDefinition>, RepoError> {
        let backend = self.backend();
        if old_name != def.name {
            log::debug!("renaming {old_name} to {} in {} backend", def.name, backend.mode());
        }
        backend.update(old_name, def)
    }

    pub fn delete_by_name(&self, name: &str) -> Result<bool, RepoError> {
        let backend = self.backend();
        log::debug!("deleting {name} from {} backend", backend.mode());
        backend.delete_by_name(name)
    }

    pub fn find_all(&self) -> Result<Vec<SemanticTypeDefinition>, RepoError> {
        self.backend().find_all()
    }

    pub fn reload(&self) -> Result<(), RepoError> {
        self.backend().reload()
    }

    /// Connects the remote backend and makes it active.
    ///
    /// Never fails: on any error the repository stays in (or falls back to)
    /// file mode and the error is logged. Returns the resulting mode.
    pub fn switch_to_remote(&self, connector: &dyn RemoteConnector) -> BackendMode {
        let _switching = self.switching.lock().unwrap_or_else(PoisonError::into_inner);
        log::info!("attempting to initialize remote definitions backend");

        match RemoteBackend::connect(connector, &self.remote_opts) {
            Ok(remote) => {
                let count = remote.len();
                let location = remote.location();
                self.swap(Arc::new(remote));
                self.remote_used.store(true, Ordering::SeqCst);
                log::info!("using remote definitions backend {location} ({count} definitions)");
                BackendMode::Remote
            }
            Err(err) => {
                log::error!("failed to initialize remote backend, using file storage: {err}");
                self.swap(self.file.clone());
                BackendMode::FileOnly
            }
        }
    }

    /// Returns to file mode. The file backend is wiped when a remote backend
    /// was active since the last switch back.
    pub fn switch_to_file_only(&self) {
        let _switching = self.switching.lock().unwrap_or_else(PoisonError::into_inner);
        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        *active = self.file.clone();

        if !self.remote_used.swap(false, Ordering::SeqCst) {
            log::debug!("switched to file storage, remote was never used");
            return;
        }

        let defs = match self.file.find_all() {
            Ok(defs) => defs,
            Err(err) => {
                log::error!("could not list cached definitions for cleanup: {err}");
                return;
            }
        };

        let mut removed = 0;
        for def in &defs {
            match self.file.delete_by_name(&def.name) {
                Ok(_) => removed += 1,
                Err(err) => log::error!("failed to clear cached definition {}: {err}", def.name),
            }
        }

        drop(active);
        log::info!("remote backend disconnected, cleared {removed} cached definitions");
    }
}
