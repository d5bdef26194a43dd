use crate::{definitions::ValidationError, storage::StoreError};

#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("semantic type {0} already exists")]
    Duplicate(String),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("io error: {0:?}")]
    IO(#[from] std::io::Error),

    #[error("malformed definition record: {0}")]
    Malformed(#[from] serde_json::Error),
}
