//! Signed append-only log
//!
//! A [`Core`] is identified by its public key. Only the holder of the
//! matching secret appends; every block carries a signature over
//! `block_sign_bytes(key, index, data)`, so replicated blocks are verified
//! before they are stored.

use crate::bridge::StorageBridge;
use crate::storage::{Block, Storage};
use parking_lot::{Mutex, RwLock};
use slashtag_core::crypto::{block_sign_bytes, discovery_key};
use slashtag_core::{Bytes32, Error, KeyPair, PublicKey, Result};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;
use tracing::debug;

/// One append-only log
pub struct Core {
    key: PublicKey,
    discovery_key: Bytes32,
    /// Set once the secret is known; never cleared
    keypair: RwLock<Option<KeyPair>>,
    tree: sled::Tree,
    length: AtomicU64,
    /// Serializes appends and merges
    write_lock: Mutex<()>,
    bridge: Weak<StorageBridge>,
}

impl fmt::Debug for Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Core")
            .field("key", &self.key)
            .field("writable", &self.is_writable())
            .field("length", &self.len())
            .finish()
    }
}

impl Core {
    pub(crate) fn open(
        storage: &Storage,
        key: PublicKey,
        keypair: Option<KeyPair>,
        bridge: Weak<StorageBridge>,
    ) -> Result<Self> {
        if let Some(keypair) = &keypair {
            if keypair.public_key() != key {
                return Err(Error::InvalidReference(format!(
                    "keypair does not match core {key}"
                )));
            }
        }
        let tree = storage.blocks(&key)?;
        let length = Storage::block_count(&tree)?;
        Ok(Self {
            key,
            discovery_key: discovery_key(&key),
            keypair: RwLock::new(keypair),
            tree,
            length: AtomicU64::new(length),
            write_lock: Mutex::new(()),
            bridge,
        })
    }

    pub fn key(&self) -> PublicKey {
        self.key
    }

    /// Hash announced to peers instead of the key itself
    pub fn discovery_key(&self) -> Bytes32 {
        self.discovery_key
    }

    pub fn is_writable(&self) -> bool {
        self.keypair.read().is_some()
    }

    /// Make this core writable with its secret.
    ///
    /// Handles already shared keep working and see appends at once.
    pub(crate) fn upgrade(&self, keypair: KeyPair) -> Result<()> {
        if keypair.public_key() != self.key {
            return Err(Error::InvalidReference(format!(
                "keypair does not match core {}",
                self.key
            )));
        }
        let mut slot = self.keypair.write();
        if slot.is_none() {
            *slot = Some(keypair);
            debug!("core {} is now writable", self.key);
        }
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.length.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append one block and return its index.
    pub fn append(&self, data: impl AsRef<[u8]>) -> Result<u64> {
        let keypair = self.keypair.read().clone().ok_or(Error::ReadOnly)?;
        let data = data.as_ref();

        let index = {
            let _guard = self.write_lock.lock();
            let index = self.len();
            let signature = keypair.sign(&block_sign_bytes(&self.key, index, data));
            let block = Block {
                data: data.to_vec(),
                signature: signature.to_vec(),
            };
            Storage::put_block(&self.tree, index, &block)?;
            self.length.store(index + 1, Ordering::Release);
            index
        };

        debug!("appended block {} to {}", index, self.key);
        if let Some(bridge) = self.bridge.upgrade() {
            bridge.announce(self);
        }
        Ok(index)
    }

    /// Data of block `index`, if present locally
    pub fn get(&self, index: u64) -> Result<Option<Vec<u8>>> {
        Ok(self.block(index)?.map(|block| block.data))
    }

    /// Fetch new blocks from connected peers.
    ///
    /// Returns whether the length grew. Without replicating peers this
    /// returns `false` immediately.
    pub async fn update(&self) -> Result<bool> {
        match self.bridge.upgrade() {
            Some(bridge) => bridge.update(self).await,
            None => Ok(false),
        }
    }

    pub(crate) fn block(&self, index: u64) -> Result<Option<Block>> {
        if index >= self.len() {
            return Ok(None);
        }
        Ok(Storage::get_block(&self.tree, index)?)
    }

    /// Up to `max` blocks starting at `start`
    pub(crate) fn blocks(&self, start: u64, max: usize) -> Result<Vec<Block>> {
        let end = self.len().min(start.saturating_add(max as u64));
        let mut blocks = Vec::new();
        for index in start..end {
            match self.block(index)? {
                Some(block) => blocks.push(block),
                None => break,
            }
        }
        Ok(blocks)
    }

    /// Store verified remote blocks that extend this log.
    ///
    /// Blocks already present are skipped; a batch starting beyond the
    /// current length is ignored. Returns how many blocks were added.
    pub(crate) fn merge(&self, start: u64, blocks: Vec<Block>) -> Result<u64> {
        let _guard = self.write_lock.lock();
        let mut length = self.len();
        if start > length {
            return Ok(0);
        }

        let mut added = 0;
        for (offset, block) in blocks.into_iter().enumerate() {
            let index = start + offset as u64;
            if index < length {
                continue;
            }
            KeyPair::verify(
                &self.key,
                &block_sign_bytes(&self.key, index, &block.data),
                &block.signature,
            )?;
            Storage::put_block(&self.tree, index, &block)?;
            length = index + 1;
            self.length.store(length, Ordering::Release);
            added += 1;
        }
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(storage: &Storage, keypair: &KeyPair, writable: bool) -> Core {
        Core::open(
            storage,
            keypair.public_key(),
            writable.then(|| keypair.clone()),
            Weak::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_append_and_get() {
        let storage = Storage::temporary().unwrap();
        let kp = KeyPair::generate();
        let core = open(&storage, &kp, true);

        assert_eq!(core.append(b"hello").unwrap(), 0);
        assert_eq!(core.append(b"world").unwrap(), 1);
        assert_eq!(core.len(), 2);
        assert_eq!(core.get(0).unwrap().as_deref(), Some(&b"hello"[..]));
        assert_eq!(core.get(1).unwrap().as_deref(), Some(&b"world"[..]));
        assert_eq!(core.get(2).unwrap(), None);
    }

    #[test]
    fn test_read_only_rejects_append() {
        let storage = Storage::temporary().unwrap();
        let core = open(&storage, &KeyPair::generate(), false);
        assert!(!core.is_writable());
        assert!(matches!(core.append(b"nope"), Err(Error::ReadOnly)));
    }

    #[test]
    fn test_merge_verifies_and_extends() {
        let kp = KeyPair::generate();
        let source = open(&Storage::temporary().unwrap(), &kp, true);
        source.append(b"a").unwrap();
        source.append(b"b").unwrap();
        source.append(b"c").unwrap();

        let clone = open(&Storage::temporary().unwrap(), &kp, false);
        assert_eq!(clone.merge(0, source.blocks(0, 2).unwrap()).unwrap(), 2);
        // Overlapping batch only adds the tail
        assert_eq!(clone.merge(1, source.blocks(1, 10).unwrap()).unwrap(), 1);
        assert_eq!(clone.len(), 3);
        assert_eq!(clone.get(2).unwrap().as_deref(), Some(&b"c"[..]));
    }

    #[test]
    fn test_merge_rejects_forgery() {
        let kp = KeyPair::generate();
        let clone = open(&Storage::temporary().unwrap(), &kp, false);

        let mut forged = open(&Storage::temporary().unwrap(), &kp, true).blocks(0, 1).unwrap();
        assert!(forged.is_empty());
        forged.push(Block {
            data: b"evil".to_vec(),
            signature: KeyPair::generate().sign(b"evil").to_vec(),
        });

        assert!(matches!(clone.merge(0, forged), Err(Error::InvalidSignature)));
        assert_eq!(clone.len(), 0);
    }

    #[test]
    fn test_merge_ignores_gap() {
        let kp = KeyPair::generate();
        let source = open(&Storage::temporary().unwrap(), &kp, true);
        source.append(b"a").unwrap();
        source.append(b"b").unwrap();

        let clone = open(&Storage::temporary().unwrap(), &kp, false);
        assert_eq!(clone.merge(1, source.blocks(1, 1).unwrap()).unwrap(), 0);
        assert!(clone.is_empty());
    }

    #[test]
    fn test_length_survives_reopen() {
        let storage = Storage::temporary().unwrap();
        let kp = KeyPair::generate();
        open(&storage, &kp, true).append(b"kept").unwrap();

        let reopened = open(&storage, &kp, false);
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.get(0).unwrap().as_deref(), Some(&b"kept"[..]));
    }
}
