//! SDK entry point

use crate::config::Config;
use crate::slashtag::Slashtag;
use parking_lot::Mutex;
use slashtag_core::crypto::derive_identity_keypair;
use slashtag_core::{Error, Identity, IdentityResolver, Result};
use slashtag_net::{ManagerConfig, Overlay};
use slashtag_store::Corestore;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Owns the corestore and resolver shared by every slashtag it opens
pub struct Sdk {
    overlay: Arc<dyn Overlay>,
    corestore: Arc<Corestore>,
    resolver: Arc<IdentityResolver>,
    manager_config: ManagerConfig,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    /// Local slashtags by name
    local: HashMap<String, Slashtag>,
    remote: Vec<Slashtag>,
    closed: bool,
}

impl Sdk {
    /// Open the corestore described by `config` on top of `overlay`.
    pub fn new(config: &Config, overlay: Arc<dyn Overlay>) -> anyhow::Result<Self> {
        config.validate()?;
        let seed = config.primary_seed()?;
        let corestore = match &config.storage {
            Some(path) => Corestore::open(path, seed, config.update_timeout())?,
            None => Corestore::temporary(seed, config.update_timeout())?,
        };

        Ok(Self {
            overlay,
            corestore: Arc::new(corestore),
            resolver: Arc::new(IdentityResolver::new()),
            manager_config: ManagerConfig {
                discovery_timeout: config.discovery_timeout(),
            },
            state: Mutex::new(State::default()),
        })
    }

    pub fn corestore(&self) -> &Arc<Corestore> {
        &self.corestore
    }

    pub fn resolver(&self) -> &Arc<IdentityResolver> {
        &self.resolver
    }

    /// Local slashtag `name`, derived from the primary seed.
    ///
    /// The same name always yields the same slashtag and key.
    pub fn slashtag(&self, name: &str) -> Result<Slashtag> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Closed);
        }
        if let Some(slashtag) = state.local.get(name) {
            return Ok(slashtag.clone());
        }

        let keypair = derive_identity_keypair(self.corestore.primary_seed(), name);
        let identity = Identity::local(keypair, Some(name.to_string()));
        let slashtag = self.open(identity)?;
        info!("slashtag {} is {}", name, slashtag.url());
        state.local.insert(name.to_string(), slashtag.clone());
        Ok(slashtag)
    }

    /// Read-only view of the slashtag at `url`.
    pub fn slashtag_from_url(&self, url: &str) -> Result<Slashtag> {
        let key = self.resolver.resolve(url)?;
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Closed);
        }
        let slashtag = self.open(Identity::remote(key))?;
        state.remote.push(slashtag.clone());
        Ok(slashtag)
    }

    fn open(&self, identity: Identity) -> Result<Slashtag> {
        Slashtag::open(
            identity,
            self.overlay.clone(),
            self.resolver.clone(),
            &self.corestore,
            self.manager_config.clone(),
        )
    }

    /// Close every slashtag and flush storage. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let slashtags: Vec<Slashtag> = {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            let mut all: Vec<_> = state.local.drain().map(|(_, s)| s).collect();
            all.append(&mut state.remote);
            all
        };

        for slashtag in &slashtags {
            slashtag.close().await;
        }
        self.corestore.flush()?;
        info!("sdk closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slashtag_net::Testnet;
    use tempfile::tempdir;

    fn sdk() -> Sdk {
        Sdk::new(&Config::default(), Arc::new(Testnet::new())).unwrap()
    }

    #[test]
    fn test_same_name_same_slashtag() {
        let sdk = sdk();
        let a = sdk.slashtag("alice").unwrap();
        let again = sdk.slashtag("alice").unwrap();
        let b = sdk.slashtag("bob").unwrap();

        assert_eq!(a.key(), again.key());
        assert_ne!(a.key(), b.key());
        assert!(!a.is_remote());
        assert_eq!(a.drive().key(), a.key());
    }

    #[test]
    fn test_seed_determines_keys() {
        let config = Config {
            seed: Some("11".repeat(32)),
            ..Config::default()
        };
        let one = Sdk::new(&config, Arc::new(Testnet::new())).unwrap();
        let two = Sdk::new(&config, Arc::new(Testnet::new())).unwrap();
        assert_eq!(
            one.slashtag("alice").unwrap().key(),
            two.slashtag("alice").unwrap().key()
        );
    }

    #[test]
    fn test_from_url_is_remote() {
        let sdk = sdk();
        let alice = sdk.slashtag("alice").unwrap();

        let other = Sdk::new(&Config::default(), Arc::new(Testnet::new())).unwrap();
        let remote = other.slashtag_from_url(&alice.url()).unwrap();
        assert!(remote.is_remote());
        assert_eq!(remote.key(), alice.key());
        assert_eq!(remote.url(), alice.url());
        assert!(!remote.drive().is_writable());

        assert!(matches!(
            other.slashtag_from_url("slash://not-a-key"),
            Err(Error::InvalidReference(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_sdk_refuses_slashtags() {
        let sdk = sdk();
        let alice = sdk.slashtag("alice").unwrap();
        sdk.close().await.unwrap();
        sdk.close().await.unwrap();

        assert!(alice.manager().is_closed());
        assert!(matches!(sdk.slashtag("bob"), Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_on_disk_store_keeps_keys_and_profile() {
        let dir = tempdir().unwrap();
        let config = Config {
            storage: Some(dir.path().to_path_buf()),
            ..Config::default()
        };

        let key = {
            let sdk = Sdk::new(&config, Arc::new(Testnet::new())).unwrap();
            let alice = sdk.slashtag("alice").unwrap();
            alice
                .set_profile(&serde_json::json!({ "name": "Alice" }))
                .unwrap();
            sdk.close().await.unwrap();
            alice.key()
        };

        let sdk = Sdk::new(&config, Arc::new(Testnet::new())).unwrap();
        let alice = sdk.slashtag("alice").unwrap();
        assert_eq!(alice.key(), key);
        alice.ready().await.unwrap();
        let profile: serde_json::Value = alice.get_profile().await.unwrap();
        assert_eq!(profile, serde_json::json!({ "name": "Alice" }));

        let other_seed = Config {
            seed: Some("22".repeat(32)),
            ..config.clone()
        };
        drop(alice);
        drop(sdk);
        assert!(Sdk::new(&other_seed, Arc::new(Testnet::new())).is_err());
    }
}
