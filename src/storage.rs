//! Durable object medium shared by the remote definition backend and the
//! vector store.
//!
//! Objects live in a named container and are addressed by `/`-separated keys.
//! Two implementations ship with the crate:
//!
//! - `DirStore`: a directory on disk, one file per key
//! - `HttpStore`: a REST object service reached over `reqwest::blocking`

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

mod http;

pub use http::HttpConnector;

/// Page size used by [`list_all`].
pub const LIST_PAGE_SIZE: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0:?}")]
    IO(#[from] std::io::Error),

    #[error("reqwest error: {0:?}")]
    Reqwest(#[from] reqwest::Error),

    #[error("object service returned status {status} for {key}")]
    Status { status: u16, key: String },

    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("invalid object service endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("object store unavailable: {0}")]
    Unavailable(String),
}

/// One page of a prefix listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ListPage {
    pub keys: Vec<String>,
    /// Continuation token for the next page, `None` on the last page.
    #[serde(default)]
    pub next: Option<String>,
}

pub trait ObjectStore: Send + Sync {
    /// Name of the container this store reads and writes.
    fn container(&self) -> &str;

    /// Creates the container. An already existing container is not an error.
    fn create_container_if_absent(&self) -> Result<(), StoreError>;

    fn put(&self, key: &str, data: &[u8]) -> Result<(), StoreError>;

    /// `Ok(None)` when the key does not exist.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn head_exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Deleting a missing key succeeds.
    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Lists keys starting with `prefix` in lexicographic order, at most
    /// `limit` per page.
    fn list(
        &self,
        prefix: &str,
        continuation: Option<&str>,
        limit: usize,
    ) -> Result<ListPage, StoreError>;
}

/// Account lookup used to derive deterministic container names.
pub trait IdentityProvider: Send + Sync {
    fn account_identity(&self) -> Option<String>;
}

/// Opens containers on a remote medium with externally supplied credentials.
pub trait RemoteConnector: IdentityProvider {
    fn region(&self) -> &str;

    fn open(&self, container: &str) -> Result<Arc<dyn ObjectStore>, StoreError>;
}

/// Walks every page of a prefix listing.
pub fn list_all(store: &dyn ObjectStore, prefix: &str) -> Result<Vec<String>, StoreError> {
    let mut keys = vec![];
    let mut continuation: Option<String> = None;

    loop {
        let page = store.list(prefix, continuation.as_deref(), LIST_PAGE_SIZE)?;
        keys.extend(page.keys);

        match page.next {
            Some(next) => continuation = Some(next),
            None => break,
        }
    }

    Ok(keys)
}

/// Characters replaced by descriptive tokens in object keys.
const KEY_TOKENS: &[(char, &str)] = &[
    ('/', "_SLASH_"),
    ('\\', "_BACKSLASH_"),
    (':', "_COLON_"),
    ('*', "_STAR_"),
    ('?', "_QUESTION_"),
    ('"', "_QUOTE_"),
    ('<', "_LT_"),
    ('>', "_GT_"),
    ('|', "_PIPE_"),
    (' ', "_SPACE_"),
    ('_', "_UNDERSCORE_"),
];

fn key_token(ch: char) -> Option<&'static str> {
    KEY_TOKENS
        .iter()
        .find(|(unsafe_char, _)| *unsafe_char == ch)
        .map(|(_, token)| *token)
}

/// Makes a type name safe to embed in an object key.
///
/// Names without unsafe characters and without token text are kept as is.
/// Anything else is encoded with every character in `KEY_TOKENS`, `_`
/// included, replaced by its token, so two distinct names never share a key.
pub fn sanitize_name(name: &str) -> String {
    let has_unsafe = name.chars().any(|ch| ch != '_' && key_token(ch).is_some());
    let has_token_text = KEY_TOKENS.iter().any(|(_, token)| name.contains(token));
    if !has_unsafe && !has_token_text {
        return name.to_string();
    }

    let mut out = String::with_capacity(name.len() * 2);
    for ch in name.chars() {
        match key_token(ch) {
            Some(token) => out.push_str(token),
            None => out.push(ch),
        }
    }
    out
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.ends_with('/')
        || key.split('/').any(|part| part.is_empty() || part == "." || part == "..");

    if bad {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Directory under a container root that holds writes until they are renamed
/// into place.
const TEMP_DIR: &str = ".tmp-writes";

/// Object store backed by a local directory. Each container is a
/// sub-directory of `root`; keys containing `/` map to nested directories.
#[derive(Clone, Debug)]
pub struct DirStore {
    base_dir: PathBuf,
    container: String,
}

impl DirStore {
    pub fn new(root: impl AsRef<Path>, container: &str) -> Self {
        DirStore {
            base_dir: root.as_ref().join(container),
            container: container.to_string(),
        }
    }

    /// In-flight writes, kept out of the key space.
    fn temp_dir(&self) -> PathBuf {
        self.base_dir.join(TEMP_DIR)
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        if key.split('/').next() == Some(TEMP_DIR) {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.base_dir.join(key))
    }

    fn collect_keys(&self, dir: &Path, keys: &mut Vec<String>) -> std::io::Result<()> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };

        for entry in entries {
            let path = entry?.path();
            if path == self.temp_dir() {
                continue;
            }
            if path.is_dir() {
                self.collect_keys(&path, keys)?;
                continue;
            }

            if let Ok(rel) = path.strip_prefix(&self.base_dir) {
                let key = rel
                    .components()
                    .filter_map(|c| c.as_os_str().to_str())
                    .collect::<Vec<_>>()
                    .join("/");
                keys.push(key);
            }
        }

        Ok(())
    }
}

impl ObjectStore for DirStore {
    fn container(&self) -> &str {
        &self.container
    }

    fn create_container_if_absent(&self) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.base_dir)?;
        Ok(())
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let parent = path.parent().unwrap_or(&self.base_dir).to_path_buf();
        std::fs::create_dir_all(&parent)?;
        std::fs::create_dir_all(self.temp_dir())?;

        let temp_path = self
            .temp_dir()
            .join(format!("{}.tmp", rusty_ulid::generate_ulid_string()));
        std::fs::write(&temp_path, data)?;

        if let Err(err) = std::fs::rename(&temp_path, &path) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(err.into());
        }
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key)?;
        match std::fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            // a legacy folder where a file is expected reads as absent
            Err(_) if path.is_dir() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn head_exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.path_for(key)?.is_file())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn list(
        &self,
        prefix: &str,
        continuation: Option<&str>,
        limit: usize,
    ) -> Result<ListPage, StoreError> {
        let mut keys = vec![];
        self.collect_keys(&self.base_dir, &mut keys)?;
        keys.retain(|key| key.starts_with(prefix));
        keys.sort();

        let start = match continuation {
            Some(token) => keys.partition_point(|key| key.as_str() <= token),
            None => 0,
        };
        let limit = limit.max(1);
        let end = (start + limit).min(keys.len());

        let page: Vec<String> = keys[start..end].to_vec();
        let next = if end < keys.len() {
            page.last().cloned()
        } else {
            None
        };

        Ok(ListPage { keys: page, next })
    }
}

/// Connector whose "remote" containers are directories under `root`.
/// Useful for single-host deployments and for exercising the remote backend
/// without a network service.
#[derive(Clone, Debug)]
pub struct DirConnector {
    pub root: PathBuf,
    pub region: String,
    pub identity: Option<String>,
}

impl IdentityProvider for DirConnector {
    fn account_identity(&self) -> Option<String> {
        self.identity.clone()
    }
}

impl RemoteConnector for DirConnector {
    fn region(&self) -> &str {
        &self.region
    }

    fn open(&self, container: &str) -> Result<Arc<dyn ObjectStore>, StoreError> {
        if !self.root.is_dir() {
            return Err(StoreError::Unavailable(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }
        Ok(Arc::new(DirStore::new(&self.root, container)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_store() -> (DirStore, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let store = DirStore::new(tmp.path(), "bucket");
        store.create_container_if_absent().unwrap();
        (store, tmp)
    }

    #[test]
    fn sanitize_replaces_unsafe_characters_with_tokens() {
        assert_eq!(sanitize_name("NAME.FIRST"), "NAME.FIRST");
        assert_eq!(sanitize_name("EMPLOYEE_ID"), "EMPLOYEE_ID");
        assert_eq!(sanitize_name("A/B"), "A_SLASH_B");
        assert_eq!(sanitize_name("a b:c"), "a_SPACE_b_COLON_c");
        assert_eq!(sanitize_name("x_y z"), "x_UNDERSCORE_y_SPACE_z");
        assert_eq!(
            sanitize_name(r#"x*?"<>|\"#),
            "x_STAR__QUESTION__QUOTE__LT__GT__PIPE__BACKSLASH_"
        );
    }

    #[test]
    fn sanitize_never_maps_two_names_to_one_key() {
        let names = [
            "A B",
            "A_B",
            "A/B",
            "AB",
            "A_SPACE_B",
            "A_SLASH_B",
            "A_UNDERSCORE_B",
            "A__B",
            "A _B",
            "A_ B",
            "_",
            " ",
        ];
        let keys: std::collections::HashSet<String> =
            names.iter().map(|name| sanitize_name(name)).collect();
        assert_eq!(keys.len(), names.len());
    }

    #[test]
    fn dot_prefixed_keys_are_listed() {
        let (store, _tmp) = fresh_store();
        store.put("vectors/.NET_VERSION.json", b"{}").unwrap();
        store.put("vectors/.hidden/a.json", b"{}").unwrap();

        let keys = list_all(&store, "vectors/").unwrap();
        assert_eq!(keys, vec!["vectors/.NET_VERSION.json", "vectors/.hidden/a.json"]);
        // temp files never show up as keys
        assert_eq!(list_all(&store, "").unwrap().len(), 2);
        assert!(matches!(
            store.put(&format!("{TEMP_DIR}/x.json"), b""),
            Err(StoreError::InvalidKey(_))
        ));
    }

    #[test]
    fn put_get_delete() {
        let (store, _tmp) = fresh_store();

        assert_eq!(store.get("vectors/a.json").unwrap(), None);
        store.put("vectors/a.json", b"hello").unwrap();
        assert_eq!(store.get("vectors/a.json").unwrap().as_deref(), Some(&b"hello"[..]));
        assert!(store.head_exists("vectors/a.json").unwrap());

        store.delete("vectors/a.json").unwrap();
        assert!(!store.head_exists("vectors/a.json").unwrap());
        // deleting again is fine
        store.delete("vectors/a.json").unwrap();
    }

    #[test]
    fn rejects_traversal_keys() {
        let (store, _tmp) = fresh_store();
        assert!(matches!(store.put("../x", b""), Err(StoreError::InvalidKey(_))));
        assert!(matches!(store.get("/abs"), Err(StoreError::InvalidKey(_))));
        assert!(matches!(store.delete("a//b"), Err(StoreError::InvalidKey(_))));
    }

    #[test]
    fn list_paginates_with_continuation() {
        let (store, _tmp) = fresh_store();
        for i in 0..7 {
            store.put(&format!("p/{i}.json"), b"{}").unwrap();
        }
        store.put("other/x.json", b"{}").unwrap();

        let first = store.list("p/", None, 3).unwrap();
        assert_eq!(first.keys, vec!["p/0.json", "p/1.json", "p/2.json"]);
        assert_eq!(first.next.as_deref(), Some("p/2.json"));

        let all = list_all(&store, "p/").unwrap();
        assert_eq!(all.len(), 7);
        assert!(all.iter().all(|k| k.starts_with("p/")));
    }

    #[test]
    fn list_on_missing_container_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DirStore::new(tmp.path(), "never-created");
        assert!(store.list("", None, 10).unwrap().keys.is_empty());
    }

    #[test]
    fn create_container_tolerates_existing() {
        let (store, _tmp) = fresh_store();
        store.create_container_if_absent().unwrap();
        store.create_container_if_absent().unwrap();
    }
}
