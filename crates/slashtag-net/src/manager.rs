//! Connection manager
//!
//! Owns the cache of live connections of one local keypair. Every remote
//! key maps to at most one [`Connection`]; whichever way the peer is named
//! and whichever side dialed, callers share the same `Arc`.

use crate::channel::{Channel, ChannelMultiplexer};
use crate::connection::Connection;
use crate::overlay::{Incoming, Overlay, OverlayError};
use crate::peer::Direction;
use crate::protocol::{ProtocolDefinition, ProtocolRegistry};
use crate::replicator::Replicator;
use parking_lot::{Mutex, RwLock};
use slashtag_core::{Error, IdentityResolver, KeyPair, PublicKey, Reference, Result};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Default bound on one discovery attempt
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Manager configuration
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Bound on locating and dialing a peer
    pub discovery_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
        }
    }
}

/// Connections of one local keypair
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    keypair: KeyPair,
    overlay: Arc<dyn Overlay>,
    resolver: Arc<IdentityResolver>,
    mux: ChannelMultiplexer,
    replicator: RwLock<Option<Arc<dyn Replicator>>>,
    config: ManagerConfig,
    state: Mutex<State>,
    cancel: CancellationToken,
    /// Held while announcing; the flag records a running accept loop
    listening: tokio::sync::Mutex<bool>,
}

#[derive(Default)]
struct State {
    connections: HashMap<PublicKey, Arc<Connection>>,
    subscribers: Vec<mpsc::UnboundedSender<Arc<Connection>>>,
    closed: bool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (connections, closed) = {
            let state = self.inner.state.lock();
            (state.connections.len(), state.closed)
        };
        f.debug_struct("ConnectionManager")
            .field("public_key", &self.public_key())
            .field("connections", &connections)
            .field("closed", &closed)
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(
        keypair: KeyPair,
        overlay: Arc<dyn Overlay>,
        resolver: Arc<IdentityResolver>,
        config: ManagerConfig,
    ) -> Self {
        let mux = ChannelMultiplexer::new(Arc::new(ProtocolRegistry::new()));
        Self {
            inner: Arc::new(Inner {
                keypair,
                overlay,
                resolver,
                mux,
                replicator: RwLock::new(None),
                config,
                state: Mutex::new(State::default()),
                cancel: CancellationToken::new(),
                listening: tokio::sync::Mutex::new(false),
            }),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.inner.keypair.public_key()
    }

    pub fn resolver(&self) -> &Arc<IdentityResolver> {
        &self.inner.resolver
    }

    pub fn registry(&self) -> &Arc<ProtocolRegistry> {
        self.inner.mux.registry()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Install the replicator for connections attached from now on.
    pub fn set_replicator(&self, replicator: Arc<dyn Replicator>) {
        *self.inner.replicator.write() = Some(replicator);
    }

    /// Connection to the peer named by `reference`.
    ///
    /// Returns immediately. A cached connection is returned as is; otherwise
    /// a new one is cached and a single dial attempt starts in the
    /// background. Unreachable peers surface as `opened() == false`.
    pub fn connect(&self, reference: impl Into<Reference>) -> Result<Arc<Connection>> {
        let key = self.inner.resolver.resolve(reference)?;
        if key == self.public_key() {
            return Err(Error::InvalidReference(format!(
                "cannot connect to own key {key}"
            )));
        }

        let conn = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(Error::Closed);
            }
            if let Some(existing) = state.connections.get(&key) {
                if !existing.is_closed() {
                    return Ok(existing.clone());
                }
            }
            let conn = Connection::new(key, self.inner.cancel.child_token());
            state.connections.insert(key, conn.clone());
            conn
        };

        debug!("connecting to {}", key);
        watch_eviction(&self.inner, &conn);
        tokio::spawn(dial(self.inner.clone(), conn.clone()));
        Ok(conn)
    }

    /// Cached connection to `reference`, without dialing.
    pub fn get(&self, reference: impl Into<Reference>) -> Option<Arc<Connection>> {
        let key = self.inner.resolver.resolve(reference).ok()?;
        self.inner
            .state
            .lock()
            .connections
            .get(&key)
            .filter(|conn| !conn.is_closed())
            .cloned()
    }

    /// All live cached connections
    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.inner
            .state
            .lock()
            .connections
            .values()
            .filter(|conn| !conn.is_closed())
            .cloned()
            .collect()
    }

    /// Announce the local key and start accepting peers. Idempotent.
    pub async fn listen(&self) -> Result<()> {
        let mut listening = self.inner.listening.lock().await;
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if *listening {
            return Ok(());
        }

        let mut server = self.inner.overlay.listen(&self.inner.keypair).await?;
        if self.is_closed() {
            // Closed while announcing; dropping the server withdraws it
            return Err(Error::Closed);
        }
        *listening = true;

        let weak = Arc::downgrade(&self.inner);
        let cancel = self.inner.cancel.clone();
        tokio::spawn(async move {
            loop {
                let incoming = tokio::select! {
                    _ = cancel.cancelled() => break,
                    incoming = server.accept() => match incoming {
                        Some(incoming) => incoming,
                        None => break,
                    },
                };
                let Some(inner) = weak.upgrade() else { break };
                handle_incoming(&inner, incoming);
            }
            debug!("accept loop for {} stopped", server.public_key());
        });

        info!("listening as {}", self.public_key());
        Ok(())
    }

    /// Subscribe to inbound connections.
    pub fn connections(&self) -> ConnectionEvents {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.state.lock();
        if !state.closed {
            state.subscribers.push(tx);
        }
        ConnectionEvents { rx }
    }

    /// Register a protocol and bind it to every live connection.
    pub fn register_protocol(&self, definition: ProtocolDefinition) -> Result<ProtocolHandle> {
        let protocol = self.inner.mux.registry().register(definition)?;
        for conn in self.all() {
            self.inner.mux.bind(&conn, protocol.clone());
        }
        debug!("registered protocol {}", protocol.name());
        Ok(ProtocolHandle {
            manager: self.clone(),
            protocol,
        })
    }

    /// Channel of protocol `name` on `conn`, created on first use.
    pub fn get_channel(&self, conn: &Connection, name: &str) -> Result<Arc<Channel>> {
        self.inner.mux.get_channel(conn, name)
    }

    /// Close the listener and every connection. Idempotent.
    ///
    /// Pending dial attempts resolve `opened()` to `false`; later calls to
    /// `connect` fail with [`Error::Closed`].
    pub async fn close(&self) {
        let connections: Vec<_> = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.subscribers.clear();
            state.connections.drain().map(|(_, conn)| conn).collect()
        };

        for conn in &connections {
            conn.close();
        }
        self.inner.cancel.cancel();
        *self.inner.listening.lock().await = false;
        info!(
            "closed manager {} ({} connections)",
            self.public_key(),
            connections.len()
        );
    }
}

/// Stream of inbound connections.
///
/// Ends once the manager closes. Dropping it unsubscribes.
#[derive(Debug)]
pub struct ConnectionEvents {
    rx: mpsc::UnboundedReceiver<Arc<Connection>>,
}

impl ConnectionEvents {
    pub async fn next(&mut self) -> Option<Arc<Connection>> {
        self.rx.recv().await
    }

    pub fn unsubscribe(self) {}
}

/// Capability handle returned by protocol registration
#[derive(Clone)]
pub struct ProtocolHandle {
    manager: ConnectionManager,
    protocol: Arc<ProtocolDefinition>,
}

impl std::fmt::Debug for ProtocolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolHandle")
            .field("name", &self.name())
            .finish()
    }
}

impl ProtocolHandle {
    pub fn name(&self) -> &str {
        self.protocol.name()
    }

    pub fn definition(&self) -> &Arc<ProtocolDefinition> {
        &self.protocol
    }

    /// Start accepting peers on the owning manager.
    pub async fn listen(&self) -> Result<()> {
        self.manager.listen().await
    }

    /// Connect to `reference` and return this protocol's channel on it.
    ///
    /// Messages sent before the connection opens are queued.
    pub fn request_channel(&self, reference: impl Into<Reference>) -> Result<Arc<Channel>> {
        let conn = self.manager.connect(reference)?;
        self.manager.get_channel(&conn, self.name())
    }
}

fn replicator(inner: &Inner) -> Option<Arc<dyn Replicator>> {
    inner.replicator.read().clone()
}

/// Evict `conn` from the cache once it closes, unless it was replaced.
fn watch_eviction(inner: &Arc<Inner>, conn: &Arc<Connection>) {
    let weak: Weak<Inner> = Arc::downgrade(inner);
    let conn = conn.clone();
    tokio::spawn(async move {
        conn.closed().await;
        let Some(inner) = weak.upgrade() else { return };
        let key = conn.remote_public_key();
        let mut state = inner.state.lock();
        if state
            .connections
            .get(&key)
            .is_some_and(|cached| Arc::ptr_eq(cached, &conn))
        {
            state.connections.remove(&key);
            debug!("evicted connection {} to {}", conn.id(), key);
        }
    });
}

/// Single bounded dial attempt for a cached, unattached connection.
///
/// A socket the peer dialed while this attempt was pending may be parked
/// on the connection. It is rejected if the attempt succeeds and adopted if
/// the attempt fails.
async fn dial(inner: Arc<Inner>, conn: Arc<Connection>) {
    let remote = conn.remote_public_key();
    let deadline = Instant::now() + inner.config.discovery_timeout;
    let attempt = inner.overlay.connect(&inner.keypair, remote);

    let result = tokio::select! {
        _ = conn.cancel.cancelled() => {
            conn.teardown();
            return;
        }
        result = tokio::time::timeout_at(deadline, attempt) => result,
    };

    match result {
        Ok(Ok(socket)) => {
            let attached = {
                let _state = inner.state.lock();
                let attached =
                    conn.attach(socket, Direction::Outbound, inner.mux.clone(), replicator(&inner));
                if attached {
                    if let Some(parked) = conn.take_parked() {
                        debug!("rejecting parked socket from {}: our dial won", remote);
                        parked.reject();
                    }
                }
                attached
            };
            if !attached {
                debug!("dropping redundant socket to {}", remote);
            }
        }
        Ok(Err(OverlayError::Rejected(_))) if remote < inner.keypair.public_key() => {
            // The peer keeps the socket it dialed; wait for it to arrive here.
            tokio::select! {
                _ = conn.cancel.cancelled() => conn.teardown(),
                _ = tokio::time::timeout_at(deadline, conn.opened()) => {}
            }
            if !conn.is_attached() {
                debug!("connection to {} never arrived", remote);
                conn.close();
            }
        }
        Ok(Err(e)) => {
            debug!("failed to connect to {}: {}", remote, e);
            settle_failed_dial(&inner, &conn);
        }
        Err(_) => {
            debug!("discovery of {} timed out", remote);
            settle_failed_dial(&inner, &conn);
        }
    }
}

/// Fall back to a parked inbound socket, or close the connection.
fn settle_failed_dial(inner: &Arc<Inner>, conn: &Arc<Connection>) {
    let adopted = {
        let state = inner.state.lock();
        if conn.is_attached() {
            return;
        }
        match conn.take_parked() {
            Some(incoming) if !state.closed => conn.attach(
                incoming.accept(),
                Direction::Inbound,
                inner.mux.clone(),
                replicator(inner),
            ),
            Some(incoming) => {
                incoming.reject();
                false
            }
            None => false,
        }
    };

    if adopted {
        debug!(
            "adopted parked socket from {} as connection {}",
            conn.remote_public_key(),
            conn.id()
        );
        publish_inbound(inner, conn);
    } else {
        conn.close();
    }
}

/// Bind registered protocols, then tell event subscribers.
fn publish_inbound(inner: &Inner, conn: &Arc<Connection>) {
    inner.mux.bind_all(conn);
    let mut state = inner.state.lock();
    if !state.closed {
        state
            .subscribers
            .retain(|tx| tx.send(conn.clone()).is_ok());
    }
}

/// Accept, park or reject one inbound socket.
///
/// With a dial of our own still pending, the socket initiated by the smaller
/// key wins on both ends. The smaller side parks the peer's socket instead
/// of rejecting it, so it can still fall back to it if its own dial fails.
fn handle_incoming(inner: &Arc<Inner>, incoming: Incoming) {
    let remote = incoming.remote_public_key();
    let conn = {
        let mut state = inner.state.lock();
        if state.closed {
            incoming.reject();
            return;
        }

        let existing = state
            .connections
            .get(&remote)
            .filter(|conn| !conn.is_closed())
            .cloned();
        let (conn, fresh) = match existing {
            Some(existing) => {
                if existing.is_attached() {
                    debug!("rejecting duplicate socket from {}", remote);
                    incoming.reject();
                    return;
                }
                if inner.keypair.public_key() < remote {
                    debug!("parking socket from {} while our dial is pending", remote);
                    existing.park(incoming);
                    return;
                }
                (existing, false)
            }
            None => {
                let conn = Connection::new(remote, inner.cancel.child_token());
                state.connections.insert(remote, conn.clone());
                (conn, true)
            }
        };

        let socket = incoming.accept();
        if !conn.attach(socket, Direction::Inbound, inner.mux.clone(), replicator(inner)) {
            return;
        }
        if fresh {
            watch_eviction(inner, &conn);
        }
        conn
    };

    debug!("accepted connection {} from {}", conn.id(), remote);
    publish_inbound(inner, &conn);
}
