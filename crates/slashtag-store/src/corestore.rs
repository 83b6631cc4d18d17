//! Opens and caches cores
//!
//! Named cores derive their keypair from the store's primary seed, so the
//! same seed and name always yield the same writable core.

use crate::bridge::StorageBridge;
use crate::drive::Drive;
use crate::log::Core;
use crate::storage::Storage;
use parking_lot::Mutex;
use slashtag_core::crypto::{derive_core_keypair, random_seed};
use slashtag_core::{Bytes32, Error, Identity, KeyPair, PublicKey, Result};
use slashtag_net::Replicator;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const PRIMARY_SEED: &str = "primary-seed";

/// Collection of cores sharing one storage and one replication bridge
pub struct Corestore {
    storage: Arc<Storage>,
    primary_seed: Bytes32,
    bridge: Arc<StorageBridge>,
    cores: Mutex<HashMap<PublicKey, Arc<Core>>>,
}

impl std::fmt::Debug for Corestore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Corestore")
            .field("cores", &self.cores.lock().len())
            .finish_non_exhaustive()
    }
}

impl Corestore {
    /// Open an on-disk store.
    ///
    /// The primary seed is loaded from the store, or set from `seed` (random
    /// when absent) on first open. A `seed` that differs from the stored one
    /// is an error.
    pub fn open(path: impl AsRef<Path>, seed: Option<Bytes32>, update_timeout: Duration) -> Result<Self> {
        let storage = Storage::open(path.as_ref())?;
        info!("opened corestore at {}", path.as_ref().display());
        Self::with_storage(storage, seed, update_timeout)
    }

    /// Open a store discarded on drop.
    pub fn temporary(seed: Option<Bytes32>, update_timeout: Duration) -> Result<Self> {
        Self::with_storage(Storage::temporary()?, seed, update_timeout)
    }

    fn with_storage(storage: Storage, seed: Option<Bytes32>, update_timeout: Duration) -> Result<Self> {
        let stored = storage.get_metadata(PRIMARY_SEED)?;
        let primary_seed = match (stored, seed) {
            (Some(stored), Some(seed)) if stored.as_slice() != seed.as_slice() => {
                return Err(Error::Storage("primary seed does not match store".into()));
            }
            (Some(stored), _) => stored
                .as_slice()
                .try_into()
                .map_err(|_| Error::Storage("corrupt primary seed".into()))?,
            (None, seed) => {
                let seed = seed.unwrap_or_else(random_seed);
                storage.put_metadata(PRIMARY_SEED, &seed)?;
                seed
            }
        };

        Ok(Self {
            storage: Arc::new(storage),
            primary_seed,
            bridge: Arc::new(StorageBridge::new(update_timeout)),
            cores: Mutex::new(HashMap::new()),
        })
    }

    pub fn primary_seed(&self) -> &Bytes32 {
        &self.primary_seed
    }

    /// The bridge to install on connection managers
    pub fn replicator(&self) -> Arc<dyn Replicator> {
        self.bridge.clone()
    }

    pub fn bridge(&self) -> &Arc<StorageBridge> {
        &self.bridge
    }

    /// Writable core derived from the primary seed and `name`.
    pub fn get_named(&self, name: &str) -> Result<Arc<Core>> {
        let keypair = derive_core_keypair(&self.primary_seed, name);
        self.storage.put_name(&keypair.public_key(), name)?;
        self.get_writable(keypair)
    }

    /// Core owned by an explicit keypair.
    ///
    /// A read-only core already open for the key is upgraded in place.
    pub fn get_writable(&self, keypair: KeyPair) -> Result<Arc<Core>> {
        let key = keypair.public_key();
        let mut cores = self.cores.lock();
        if let Some(core) = cores.get(&key) {
            core.upgrade(keypair)?;
            return Ok(core.clone());
        }
        self.insert(&mut cores, key, Some(keypair))
    }

    /// Core for `key`, read-only unless this store derived its keypair.
    pub fn get_by_key(&self, key: PublicKey) -> Result<Arc<Core>> {
        let mut cores = self.cores.lock();
        if let Some(core) = cores.get(&key) {
            return Ok(core.clone());
        }
        let keypair = self
            .storage
            .get_name(&key)?
            .map(|name| derive_core_keypair(&self.primary_seed, &name))
            .filter(|keypair| keypair.public_key() == key);
        self.insert(&mut cores, key, keypair)
    }

    fn insert(
        &self,
        cores: &mut HashMap<PublicKey, Arc<Core>>,
        key: PublicKey,
        keypair: Option<KeyPair>,
    ) -> Result<Arc<Core>> {
        let core = Arc::new(Core::open(
            &self.storage,
            key,
            keypair,
            Arc::downgrade(&self.bridge),
        )?);
        cores.insert(key, core.clone());
        debug!("opened core {} (writable: {})", key, core.is_writable());
        self.bridge.add_core(core.clone());
        Ok(core)
    }

    /// Drive of `identity`, keyed by the identity key itself.
    ///
    /// Writable for local identities, read-only for remote ones.
    pub fn drive(&self, identity: &Identity) -> Result<Drive> {
        let core = match identity.keypair() {
            Some(keypair) => self.get_writable(keypair.clone())?,
            None => self.get_by_key(identity.key())?,
        };
        Drive::new(core)
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> Result<()> {
        Ok(self.storage.flush()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::DEFAULT_UPDATE_TIMEOUT;
    use tempfile::tempdir;

    #[test]
    fn test_named_cores_are_deterministic() {
        let seed = [5u8; 32];
        let a = Corestore::temporary(Some(seed), DEFAULT_UPDATE_TIMEOUT).unwrap();
        let b = Corestore::temporary(Some(seed), DEFAULT_UPDATE_TIMEOUT).unwrap();

        let core_a = a.get_named("posts").unwrap();
        let core_b = b.get_named("posts").unwrap();
        assert_eq!(core_a.key(), core_b.key());
        assert_ne!(core_a.key(), a.get_named("other").unwrap().key());
        assert!(Arc::ptr_eq(&core_a, &a.get_named("posts").unwrap()));
    }

    #[test]
    fn test_get_by_key_recovers_named_secret() {
        let store = Corestore::temporary(None, DEFAULT_UPDATE_TIMEOUT).unwrap();
        let foreign = KeyPair::generate().public_key();
        assert!(!store.get_by_key(foreign).unwrap().is_writable());

        let key = store.get_named("posts").unwrap().key();
        assert!(store.get_by_key(key).unwrap().is_writable());
    }

    #[test]
    fn test_seed_and_data_persist() {
        let dir = tempdir().unwrap();
        let (seed, key) = {
            let store = Corestore::open(dir.path(), None, DEFAULT_UPDATE_TIMEOUT).unwrap();
            let core = store.get_named("posts").unwrap();
            core.append(b"hello").unwrap();
            store.flush().unwrap();
            (*store.primary_seed(), core.key())
        };

        let store = Corestore::open(dir.path(), None, DEFAULT_UPDATE_TIMEOUT).unwrap();
        assert_eq!(store.primary_seed(), &seed);
        let core = store.get_by_key(key).unwrap();
        assert!(core.is_writable());
        assert_eq!(core.get(0).unwrap().as_deref(), Some(&b"hello"[..]));
    }

    #[test]
    fn test_seed_mismatch_rejected() {
        let dir = tempdir().unwrap();
        drop(Corestore::open(dir.path(), Some([1; 32]), DEFAULT_UPDATE_TIMEOUT).unwrap());
        assert!(matches!(
            Corestore::open(dir.path(), Some([2; 32]), DEFAULT_UPDATE_TIMEOUT),
            Err(Error::Storage(_))
        ));
    }

    #[test]
    fn test_get_writable_upgrades_cached_core() {
        let store = Corestore::temporary(None, DEFAULT_UPDATE_TIMEOUT).unwrap();
        let kp = KeyPair::generate();

        let reader = store.get_by_key(kp.public_key()).unwrap();
        assert!(!reader.is_writable());
        assert!(matches!(reader.append(b"nope"), Err(Error::ReadOnly)));

        let writer = store.get_writable(kp.clone()).unwrap();
        assert!(Arc::ptr_eq(&reader, &writer));
        writer.append(b"hello").unwrap();

        assert!(reader.is_writable());
        assert_eq!(reader.len(), 1);
        assert_eq!(reader.get(0).unwrap().as_deref(), Some(&b"hello"[..]));
    }

    #[test]
    fn test_identity_drive_key_is_identity_key() {
        let store = Corestore::temporary(None, DEFAULT_UPDATE_TIMEOUT).unwrap();
        let identity = Identity::local(KeyPair::generate(), Some("alice".into()));
        let drive = store.drive(&identity).unwrap();
        assert_eq!(drive.key(), identity.key());
        assert!(drive.is_writable());

        let remote = Identity::remote(KeyPair::generate().public_key());
        assert!(!store.drive(&remote).unwrap().is_writable());
    }
}
