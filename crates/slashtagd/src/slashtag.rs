//! A slashtag: one identity with its connections and drive

use slashtag_core::{Error, Identity, IdentityResolver, KeyPair, PublicKey, Reference, Result};
use slashtag_net::{
    Channel, Connection, ConnectionEvents, ConnectionManager, ManagerConfig, Overlay,
    ProtocolDefinition, ProtocolHandle,
};
use slashtag_store::{Corestore, Drive};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Identity plus the machinery to reach peers and publish data.
///
/// Local slashtags own their keypair and a writable drive. Remote slashtags
/// are opened from a URL: their drive is a read-only replica and they dial
/// out with an ephemeral transport keypair.
#[derive(Clone)]
pub struct Slashtag {
    inner: Arc<Inner>,
}

struct Inner {
    identity: Identity,
    manager: ConnectionManager,
    drive: Drive,
}

impl fmt::Debug for Slashtag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slashtag")
            .field("key", &self.key())
            .field("name", &self.inner.identity.name())
            .field("remote", &self.is_remote())
            .finish()
    }
}

impl Slashtag {
    pub(crate) fn open(
        identity: Identity,
        overlay: Arc<dyn Overlay>,
        resolver: Arc<IdentityResolver>,
        corestore: &Corestore,
        config: ManagerConfig,
    ) -> Result<Self> {
        let transport = match identity.keypair() {
            Some(keypair) => keypair.clone(),
            None => KeyPair::generate(),
        };
        let manager = ConnectionManager::new(transport, overlay, resolver, config);
        manager.set_replicator(corestore.replicator());
        let drive = corestore.drive(&identity)?;

        debug!(
            "opened slashtag {} (remote: {})",
            identity.key(),
            identity.is_remote()
        );
        Ok(Self {
            inner: Arc::new(Inner {
                identity,
                manager,
                drive,
            }),
        })
    }

    pub fn key(&self) -> PublicKey {
        self.inner.identity.key()
    }

    /// `slash://` URL of this identity
    pub fn url(&self) -> String {
        self.inner.identity.url()
    }

    /// Registered local id, or the bare z32 key
    pub fn id(&self) -> String {
        self.inner.manager.resolver().to_id(&self.key())
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    pub fn is_remote(&self) -> bool {
        self.inner.identity.is_remote()
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.inner.manager
    }

    /// Drive keyed by this identity's key
    pub fn drive(&self) -> &Drive {
        &self.inner.drive
    }

    /// Make the slashtag usable.
    ///
    /// A local slashtag only loads its drive; announcing it is left to
    /// [`Slashtag::listen`]. A remote one dials its owner and pulls the
    /// current drive, if reachable.
    pub async fn ready(&self) -> Result<()> {
        self.inner.drive.ready()?;
        if !self.is_remote() {
            return Ok(());
        }
        let conn = self.inner.manager.connect(self.key())?;
        if conn.opened().await {
            self.inner.drive.update().await?;
        }
        Ok(())
    }

    /// Announce this identity and accept inbound connections.
    pub async fn listen(&self) -> Result<()> {
        if self.is_remote() {
            return Err(Error::ReadOnly);
        }
        self.inner.manager.listen().await
    }

    pub fn connect(&self, reference: impl Into<Reference>) -> Result<Arc<Connection>> {
        self.inner.manager.connect(reference)
    }

    /// Inbound connection events
    pub fn connections(&self) -> ConnectionEvents {
        self.inner.manager.connections()
    }

    pub fn register_protocol(&self, definition: ProtocolDefinition) -> Result<ProtocolHandle> {
        self.inner.manager.register_protocol(definition)
    }

    pub fn get_channel(&self, conn: &Connection, name: &str) -> Result<Arc<Channel>> {
        self.inner.manager.get_channel(conn, name)
    }

    pub async fn close(&self) {
        self.inner.manager.close().await;
        info!("closed slashtag {}", self.key());
    }
}
