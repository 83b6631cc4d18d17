//! Path-addressed files on one core
//!
//! Every write or delete appends a [`DriveEntry`]; the latest entry for a
//! path wins. The index is rebuilt incrementally from the log, so a
//! replicated drive reads the same as the writer's.

use crate::log::Core;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use slashtag_core::{Error, PublicKey, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// One drive mutation as stored in the log
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveEntry {
    pub path: String,
    /// `None` marks a deletion
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct Index {
    /// Log length covered by `files`
    indexed: u64,
    files: BTreeMap<String, Vec<u8>>,
}

/// Key/value files backed by one core
#[derive(Debug, Clone)]
pub struct Drive {
    core: Arc<Core>,
    index: Arc<RwLock<Index>>,
}

fn check_path(path: &str) -> Result<()> {
    if path.len() < 2 || !path.starts_with('/') {
        return Err(Error::InvalidPath(path.to_string()));
    }
    Ok(())
}

impl Drive {
    pub fn new(core: Arc<Core>) -> Result<Self> {
        let drive = Self {
            core,
            index: Arc::new(RwLock::new(Index::default())),
        };
        drive.refresh()?;
        Ok(drive)
    }

    /// Key of the backing core
    pub fn key(&self) -> PublicKey {
        self.core.key()
    }

    pub fn core(&self) -> &Arc<Core> {
        &self.core
    }

    pub fn is_writable(&self) -> bool {
        self.core.is_writable()
    }

    /// Store `data` at `path`, replacing any previous content.
    pub fn write(&self, path: &str, data: impl Into<Vec<u8>>) -> Result<()> {
        check_path(path)?;
        self.append(DriveEntry {
            path: path.to_string(),
            value: Some(data.into()),
        })
    }

    /// Remove `path`. Deleting a missing path is not an error.
    pub fn delete(&self, path: &str) -> Result<()> {
        check_path(path)?;
        self.append(DriveEntry {
            path: path.to_string(),
            value: None,
        })
    }

    /// Content at `path`, if any
    pub fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        check_path(path)?;
        self.refresh()?;
        Ok(self.index.read().files.get(path).cloned())
    }

    pub fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.read(path)?.is_some())
    }

    /// All present paths, sorted
    pub fn list(&self) -> Result<Vec<String>> {
        self.refresh()?;
        Ok(self.index.read().files.keys().cloned().collect())
    }

    /// Index every entry already stored.
    pub fn ready(&self) -> Result<()> {
        self.refresh()
    }

    /// Fetch new entries from connected peers.
    pub async fn update(&self) -> Result<bool> {
        self.core.update().await
    }

    fn append(&self, entry: DriveEntry) -> Result<()> {
        if !self.core.is_writable() {
            return Err(Error::ReadOnly);
        }
        self.core.append(postcard::to_allocvec(&entry)?)?;
        Ok(())
    }

    /// Apply log entries not yet indexed.
    fn refresh(&self) -> Result<()> {
        let length = self.core.len();
        let mut index = self.index.write();
        while index.indexed < length {
            let position = index.indexed;
            if let Some(bytes) = self.core.get(position)? {
                match postcard::from_bytes::<DriveEntry>(&bytes) {
                    Ok(DriveEntry {
                        path,
                        value: Some(value),
                    }) => {
                        index.files.insert(path, value);
                    }
                    Ok(DriveEntry { path, value: None }) => {
                        index.files.remove(&path);
                    }
                    Err(e) => warn!("skipping bad drive entry {} of {}: {}", position, self.key(), e),
                }
            }
            index.indexed = position + 1;
        }
        Ok(())
    }
}
