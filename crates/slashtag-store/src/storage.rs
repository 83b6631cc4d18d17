//! Persistent storage using sled

use serde::{Deserialize, Serialize};
use slashtag_core::PublicKey;
use sled::Db;
use std::path::Path;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
}

impl From<StoreError> for slashtag_core::Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Serialization(e) => slashtag_core::Error::Serialization(e),
            StoreError::Sled(e) => slashtag_core::Error::Storage(e.to_string()),
        }
    }
}

/// One signed log entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub data: Vec<u8>,
    /// Ed25519 signature over `block_sign_bytes(key, index, data)`
    pub signature: Vec<u8>,
}

/// Storage backend for a corestore
pub struct Storage {
    db: Db,
    /// Metadata tree: key -> value
    metadata: sled::Tree,
    /// Named cores: core key -> name
    names: sled::Tree,
}

impl Storage {
    /// Open storage at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::from_db(sled::open(path)?)
    }

    /// Open storage that is discarded on drop
    pub fn temporary() -> Result<Self, StoreError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, StoreError> {
        let metadata = db.open_tree("metadata")?;
        let names = db.open_tree("names")?;
        Ok(Self {
            db,
            metadata,
            names,
        })
    }

    /// Block tree of the core `key`: big-endian index -> Block
    pub(crate) fn blocks(&self, key: &PublicKey) -> Result<sled::Tree, StoreError> {
        Ok(self.db.open_tree(format!("core/{}", hex::encode(key.as_bytes())))?)
    }

    /// Number of contiguous blocks stored in `tree`
    pub(crate) fn block_count(tree: &sled::Tree) -> Result<u64, StoreError> {
        match tree.last()? {
            Some((key, _)) => {
                let index = u64::from_be_bytes(key.as_ref().try_into().unwrap_or([0; 8]));
                Ok(index + 1)
            }
            None => Ok(0),
        }
    }

    pub(crate) fn put_block(tree: &sled::Tree, index: u64, block: &Block) -> Result<(), StoreError> {
        let value = postcard::to_allocvec(block)?;
        tree.insert(index.to_be_bytes(), value)?;
        Ok(())
    }

    pub(crate) fn get_block(tree: &sled::Tree, index: u64) -> Result<Option<Block>, StoreError> {
        match tree.get(index.to_be_bytes())? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Remember that `key` was derived from `name`
    pub fn put_name(&self, key: &PublicKey, name: &str) -> Result<(), StoreError> {
        self.names.insert(key.as_bytes(), name.as_bytes())?;
        Ok(())
    }

    /// Name a core key was derived from, if it was derived here
    pub fn get_name(&self, key: &PublicKey) -> Result<Option<String>, StoreError> {
        Ok(self
            .names
            .get(key.as_bytes())?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    /// Store metadata
    pub fn put_metadata(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.metadata.insert(key, value)?;
        Ok(())
    }

    /// Get metadata
    pub fn get_metadata(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.metadata.get(key)?.map(|v| v.to_vec()))
    }

    /// Flush all pending writes
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_blocks_count_contiguously() {
        let storage = Storage::temporary().unwrap();
        let key = PublicKey([7; 32]);
        let tree = storage.blocks(&key).unwrap();
        assert_eq!(Storage::block_count(&tree).unwrap(), 0);

        let block = Block {
            data: b"hello".to_vec(),
            signature: vec![1; 64],
        };
        Storage::put_block(&tree, 0, &block).unwrap();
        Storage::put_block(&tree, 1, &block).unwrap();

        assert_eq!(Storage::block_count(&tree).unwrap(), 2);
        assert_eq!(Storage::get_block(&tree, 1).unwrap(), Some(block));
        assert_eq!(Storage::get_block(&tree, 2).unwrap(), None);
    }

    #[test]
    fn test_metadata_persists() {
        let dir = tempdir().unwrap();
        let key = PublicKey([3; 32]);
        {
            let storage = Storage::open(dir.path()).unwrap();
            storage.put_metadata("primary-seed", &[9; 32]).unwrap();
            storage.put_name(&key, "posts").unwrap();
            storage.flush().unwrap();
        }

        let storage = Storage::open(dir.path()).unwrap();
        assert_eq!(storage.get_metadata("primary-seed").unwrap(), Some(vec![9; 32]));
        assert_eq!(storage.get_name(&key).unwrap().as_deref(), Some("posts"));
        assert_eq!(storage.get_metadata("missing").unwrap(), None);
    }
}
