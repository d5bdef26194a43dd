//! Persistence for semantic type definitions.
//!
//! # Architecture
//!
//! - `backend`: the `DefinitionBackend` contract and the rollback-aware cache
//! - `file`: a single JSON file rewritten on every mutation
//! - `remote`: one object per definition in a durable object store
//! - `hybrid`: the single entry point, switching between the two at runtime

mod backend;
mod errors;
mod file;
mod hybrid;
mod remote;

pub use backend::BackendMode;
pub use errors::RepoError;
pub use file::FileBackend;
pub use hybrid::{HybridRepository, StorageStatus};
pub use remote::{container_name, RemoteOptions};

#[cfg(test)]
pub use backend::DefinitionBackend;
#[cfg(test)]
pub use remote::DEFINITIONS_PREFIX;
