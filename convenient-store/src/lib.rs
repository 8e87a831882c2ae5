//! Hash-keyed blob storage for hashwerk artefacts.
//!
//! The storage engine holds artefact payloads under their content hash and
//! knows nothing about graph structure. Two backends are provided:
//!
//! - **Hub-resident**: payloads live in the hub itself, chunked into a list
//!   of blocks of at most [`BLOCK_SIZE`] bytes. Writes replace the whole
//!   block list atomically; zero-length payloads still produce a valid
//!   one-block entry.
//! - **Filesystem**: payloads live under `<root>/<hash[:2]>/<hash>`, written
//!   to a tempfile and renamed into place so readers never observe partial
//!   writes.
//!
//! Backends are selected by URL: `hub://` or `file:///absolute/path`. All
//! workers attached to one hub must use the same storage configuration.

#![warn(missing_docs)]
#![deny(unsafe_code)]

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use convenient_hub::{Cmd, Hub, HubError};
use tracing::debug;

/// Largest block written to a hub-resident list.
pub const BLOCK_SIZE: usize = 30 * 1024 * 1024;

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No payload stored under this hash.
    #[error("no data stored for {0}")]
    NotFound(String),

    /// Hub request failed.
    #[error("hub error: {0}")]
    Hub(#[from] HubError),

    /// Filesystem operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The storage URL could not be understood.
    #[error("invalid storage url: {0}")]
    InvalidUrl(String),
}

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

fn data_key(hash: &str) -> String {
    format!("artefacts:{hash}:data")
}

/// Hub-resident block storage.
#[derive(Debug, Clone)]
pub struct HubStore {
    hub: Hub,
    block_size: usize,
}

impl HubStore {
    /// Store blobs in the given hub.
    #[must_use]
    pub fn new(hub: Hub) -> Self {
        Self {
            hub,
            block_size: BLOCK_SIZE,
        }
    }

    /// Override the block size. Intended for tests exercising multi-block
    /// payloads without allocating tens of megabytes.
    #[must_use]
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        assert!(block_size > 0, "block size must be nonzero");
        self.block_size = block_size;
        self
    }

    fn get(&self, hash: &str) -> StoreResult<Vec<u8>> {
        let key = data_key(hash);
        if !self.hub.exists(&key)? {
            return Err(StoreError::NotFound(hash.to_string()));
        }
        Ok(self.hub.lrange(&key)?.concat())
    }

    fn put(&self, hash: &str, data: &[u8]) -> StoreResult<()> {
        let key = data_key(hash);
        let mut cmds = vec![Cmd::Del { key: key.clone() }];
        if data.is_empty() {
            // An empty payload still needs one block so the key exists.
            cmds.push(Cmd::RPush {
                key: key.clone(),
                value: Vec::new(),
            });
        } else {
            for block in data.chunks(self.block_size) {
                cmds.push(Cmd::RPush {
                    key: key.clone(),
                    value: block.to_vec(),
                });
            }
        }
        self.hub.pipeline(cmds)?;
        Ok(())
    }

    fn delete(&self, hash: &str) -> StoreResult<()> {
        Ok(self.hub.del(&data_key(hash))?)
    }
}

/// Filesystem blob storage under `<root>/<hash[:2]>/<hash>`.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (and create, if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be created.
    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, hash: &str) -> PathBuf {
        let shard = hash.get(..2).unwrap_or(hash);
        self.root.join(shard).join(hash)
    }

    fn get(&self, hash: &str) -> StoreResult<Vec<u8>> {
        match fs::read(self.path_for(hash)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(hash.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, hash: &str, data: &[u8]) -> StoreResult<()> {
        let path = self.path_for(hash);
        let dir = path.parent().expect("sharded path has a parent");
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(data)?;
        tmp.persist(&path).map_err(|e| StoreError::Io(e.error))?;
        debug!("stored {} bytes at {}", data.len(), path.display());
        Ok(())
    }

    fn delete(&self, hash: &str) -> StoreResult<()> {
        match fs::remove_file(self.path_for(hash)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// A storage engine over one of the supported backends.
#[derive(Debug, Clone)]
pub enum Storage {
    /// Blobs live in the hub.
    Hub(HubStore),
    /// Blobs live on a (shared) filesystem.
    File(FileStore),
}

impl Storage {
    /// Hub-resident storage.
    #[must_use]
    pub fn hub(hub: Hub) -> Self {
        Storage::Hub(HubStore::new(hub))
    }

    /// Filesystem storage rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be created.
    pub fn file(root: impl AsRef<Path>) -> StoreResult<Self> {
        Ok(Storage::File(FileStore::open(root)?))
    }

    /// Select a backend from a URL (`hub://` or `file:///path`).
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidUrl` for unknown schemes and propagates
    /// backend setup failures.
    pub fn from_url(url: &str, hub: &Hub) -> StoreResult<Self> {
        if url == "hub://" || url.starts_with("hub://") {
            Ok(Self::hub(hub.clone()))
        } else if let Some(path) = url.strip_prefix("file://") {
            if path.is_empty() {
                return Err(StoreError::InvalidUrl(url.to_string()));
            }
            Self::file(path)
        } else {
            Err(StoreError::InvalidUrl(url.to_string()))
        }
    }

    /// Read the payload stored under `hash`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` when nothing is stored under the hash
    /// and propagates backend failures.
    pub fn get(&self, hash: &str) -> StoreResult<Vec<u8>> {
        match self {
            Storage::Hub(s) => s.get(hash),
            Storage::File(s) => s.get(hash),
        }
    }

    /// Write the payload for `hash`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub fn put(&self, hash: &str, data: &[u8]) -> StoreResult<()> {
        match self {
            Storage::Hub(s) => s.put(hash, data),
            Storage::File(s) => s.put(hash, data),
        }
    }

    /// Remove the payload for `hash`, if present.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub fn delete(&self, hash: &str) -> StoreResult<()> {
        match self {
            Storage::Hub(s) => s.delete(hash),
            Storage::File(s) => s.delete(hash),
        }
    }

    /// Whether a payload exists for `hash`.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub fn contains(&self, hash: &str) -> StoreResult<bool> {
        match self.get(hash) {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d";

    #[test]
    fn hub_store_roundtrip() {
        let store = Storage::hub(Hub::memory());
        store.put(HASH, b"hello world").unwrap();
        assert_eq!(store.get(HASH).unwrap(), b"hello world");
    }

    #[test]
    fn hub_store_empty_payload_is_valid() {
        let store = Storage::hub(Hub::memory());
        store.put(HASH, b"").unwrap();
        assert_eq!(store.get(HASH).unwrap(), Vec::<u8>::new());
        assert!(store.contains(HASH).unwrap());
    }

    #[test]
    fn hub_store_chunks_large_payloads() {
        let hub = Hub::memory();
        let store = HubStore::new(hub.clone()).with_block_size(4);
        let data = b"0123456789abcdef!".to_vec();
        store.put(HASH, &data).unwrap();
        let blocks = hub.lrange(&data_key(HASH)).unwrap();
        assert_eq!(blocks.len(), 5);
        assert_eq!(blocks.concat(), data);
    }

    #[test]
    fn hub_store_overwrite_replaces_blocks() {
        let hub = Hub::memory();
        let store = HubStore::new(hub.clone()).with_block_size(2);
        store.put(HASH, b"aabbcc").unwrap();
        store.put(HASH, b"xy").unwrap();
        assert_eq!(store.get(HASH).unwrap(), b"xy");
        assert_eq!(hub.llen(&data_key(HASH)).unwrap(), 1);
    }

    #[test]
    fn missing_hash_is_not_found() {
        let store = Storage::hub(Hub::memory());
        assert!(matches!(store.get(HASH), Err(StoreError::NotFound(_))));
        assert!(!store.contains(HASH).unwrap());
    }

    #[test]
    fn file_store_roundtrip_and_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = Storage::file(dir.path()).unwrap();
        store.put(HASH, b"payload").unwrap();
        assert_eq!(store.get(HASH).unwrap(), b"payload");
        assert!(dir.path().join("aa").join(HASH).is_file());

        store.delete(HASH).unwrap();
        assert!(matches!(store.get(HASH), Err(StoreError::NotFound(_))));
        // Deleting again is fine.
        store.delete(HASH).unwrap();
    }

    #[test]
    fn url_dispatch() {
        let hub = Hub::memory();
        assert!(matches!(
            Storage::from_url("hub://", &hub).unwrap(),
            Storage::Hub(_)
        ));
        let dir = tempfile::tempdir().unwrap();
        let url = format!("file://{}", dir.path().display());
        assert!(matches!(
            Storage::from_url(&url, &hub).unwrap(),
            Storage::File(_)
        ));
        assert!(matches!(
            Storage::from_url("s3://bucket", &hub),
            Err(StoreError::InvalidUrl(_))
        ));
    }
}
