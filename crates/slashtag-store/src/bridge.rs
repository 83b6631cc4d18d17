//! Replication of cores over connections
//!
//! Peers announce each core they hold by discovery key and length. When
//! both sides hold a core, the shorter side requests the missing range and
//! verifies every block it receives. `update()` adds an explicit sync round
//! trip so callers can wait for a peer's current state.

use crate::log::Core;
use crate::storage::Block;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use slashtag_core::{Bytes32, Error, Result};
use slashtag_net::{Connection, Replicator};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default bound on one `update()` round trip
pub const DEFAULT_UPDATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum blocks per data message
const MAX_BATCH: usize = 512;

/// Replication wire messages
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationMessage {
    /// Sender holds the core with this length
    Announce { discovery_key: Bytes32, length: u64 },
    /// Send blocks from `start`
    Request { discovery_key: Bytes32, start: u64 },
    /// Consecutive blocks from `start`
    Data {
        discovery_key: Bytes32,
        start: u64,
        blocks: Vec<Block>,
    },
    /// Send everything beyond `length`, then acknowledge `id`
    Sync {
        id: u64,
        discovery_key: Bytes32,
        length: u64,
    },
    /// All data for sync `id` has been sent
    SyncAck { id: u64 },
}

/// Replicates the cores of one corestore with every connected peer
pub struct StorageBridge {
    cores: RwLock<HashMap<Bytes32, Arc<Core>>>,
    /// Open connections, by connection id
    sessions: Mutex<HashMap<u64, Arc<Connection>>>,
    /// Outstanding syncs: id -> ack notifier
    pending: Mutex<HashMap<u64, mpsc::UnboundedSender<()>>>,
    next_sync_id: AtomicU64,
    update_timeout: Duration,
}

impl std::fmt::Debug for StorageBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageBridge")
            .field("cores", &self.cores.read().len())
            .field("sessions", &self.sessions.lock().len())
            .finish()
    }
}

impl StorageBridge {
    pub fn new(update_timeout: Duration) -> Self {
        Self {
            cores: RwLock::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_sync_id: AtomicU64::new(1),
            update_timeout,
        }
    }

    /// Number of connections currently replicating
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Start replicating `core` with every peer.
    pub(crate) fn add_core(&self, core: Arc<Core>) {
        self.cores.write().insert(core.discovery_key(), core.clone());
        self.announce(&core);
    }

    /// Tell every peer the current length of `core`.
    pub(crate) fn announce(&self, core: &Core) {
        let message = ReplicationMessage::Announce {
            discovery_key: core.discovery_key(),
            length: core.len(),
        };
        for conn in self.sessions() {
            send(&conn, &message);
        }
    }

    fn sessions(&self) -> Vec<Arc<Connection>> {
        self.sessions.lock().values().cloned().collect()
    }

    fn core(&self, discovery_key: &Bytes32) -> Option<Arc<Core>> {
        self.cores.read().get(discovery_key).cloned()
    }

    /// Run one sync round trip for `core` with every peer.
    pub(crate) async fn update(&self, core: &Core) -> Result<bool> {
        let sessions = self.sessions();
        if sessions.is_empty() {
            return Ok(false);
        }

        let before = core.len();
        let id = self.next_sync_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.pending.lock().insert(id, tx);

        let message = ReplicationMessage::Sync {
            id,
            discovery_key: core.discovery_key(),
            length: before,
        };
        let mut expected = 0;
        for conn in &sessions {
            if send(conn, &message) {
                expected += 1;
            }
        }

        let mut acked = 0;
        let deadline = tokio::time::Instant::now() + self.update_timeout;
        while acked < expected {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(())) => acked += 1,
                Ok(None) | Err(_) => break,
            }
        }
        self.pending.lock().remove(&id);

        if acked == 0 && expected > 0 {
            debug!("update of {} got no answer", core.key());
            return Err(Error::Timeout);
        }
        Ok(core.len() > before)
    }

    fn handle(&self, conn: &Arc<Connection>, message: ReplicationMessage) -> Result<()> {
        match message {
            ReplicationMessage::Announce {
                discovery_key,
                length,
            } => {
                let Some(core) = self.core(&discovery_key) else {
                    return Ok(());
                };
                let ours = core.len();
                if length > ours {
                    send(
                        conn,
                        &ReplicationMessage::Request {
                            discovery_key,
                            start: ours,
                        },
                    );
                } else if length < ours {
                    send(
                        conn,
                        &ReplicationMessage::Announce {
                            discovery_key,
                            length: ours,
                        },
                    );
                }
            }
            ReplicationMessage::Request {
                discovery_key,
                start,
            } => {
                if let Some(core) = self.core(&discovery_key) {
                    let blocks = core.blocks(start, MAX_BATCH)?;
                    if !blocks.is_empty() {
                        send(
                            conn,
                            &ReplicationMessage::Data {
                                discovery_key,
                                start,
                                blocks,
                            },
                        );
                    }
                }
            }
            ReplicationMessage::Data {
                discovery_key,
                start,
                blocks,
            } => {
                let Some(core) = self.core(&discovery_key) else {
                    return Ok(());
                };
                let full = blocks.len() == MAX_BATCH;
                let added = core.merge(start, blocks)?;
                if added > 0 {
                    debug!("merged {} blocks into {}", added, core.key());
                    self.announce(&core);
                }
                if full {
                    send(
                        conn,
                        &ReplicationMessage::Request {
                            discovery_key,
                            start: core.len(),
                        },
                    );
                }
            }
            ReplicationMessage::Sync {
                id,
                discovery_key,
                length,
            } => {
                if let Some(core) = self.core(&discovery_key) {
                    let mut start = length;
                    loop {
                        let blocks = core.blocks(start, MAX_BATCH)?;
                        if blocks.is_empty() {
                            break;
                        }
                        let count = blocks.len() as u64;
                        send(
                            conn,
                            &ReplicationMessage::Data {
                                discovery_key,
                                start,
                                blocks,
                            },
                        );
                        start += count;
                    }
                }
                send(conn, &ReplicationMessage::SyncAck { id });
            }
            ReplicationMessage::SyncAck { id } => {
                if let Some(tx) = self.pending.lock().get(&id) {
                    let _ = tx.send(());
                }
            }
        }
        Ok(())
    }
}

/// Encode and queue `message`; returns whether it was queued.
fn send(conn: &Connection, message: &ReplicationMessage) -> bool {
    let payload = match postcard::to_allocvec(message) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("failed to encode replication message: {}", e);
            return false;
        }
    };
    conn.replicate(payload).is_ok()
}

impl Replicator for StorageBridge {
    fn on_open(&self, connection: &Arc<Connection>) {
        self.sessions
            .lock()
            .insert(connection.id(), connection.clone());

        let cores: Vec<_> = self.cores.read().values().cloned().collect();
        for core in cores {
            send(
                connection,
                &ReplicationMessage::Announce {
                    discovery_key: core.discovery_key(),
                    length: core.len(),
                },
            );
        }
        debug!(
            "replicating with {} on connection {}",
            connection.remote_public_key(),
            connection.id()
        );
    }

    fn on_message(&self, connection: &Arc<Connection>, payload: Bytes) {
        let message = match postcard::from_bytes::<ReplicationMessage>(&payload) {
            Ok(message) => message,
            Err(e) => {
                debug!("malformed replication message from {}: {}", connection.remote_public_key(), e);
                return;
            }
        };
        if let Err(e) = self.handle(connection, message) {
            warn!("replication with {} failed: {}", connection.remote_public_key(), e);
        }
    }

    fn on_close(&self, connection: &Arc<Connection>) {
        self.sessions.lock().remove(&connection.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corestore::Corestore;
    use slashtag_core::{IdentityResolver, KeyPair};
    use slashtag_net::{ConnectionManager, ManagerConfig, Testnet};

    const WAIT: Duration = Duration::from_secs(2);

    fn peer(testnet: &Testnet) -> (ConnectionManager, Corestore) {
        let store = Corestore::temporary(None, DEFAULT_UPDATE_TIMEOUT).unwrap();
        let manager = ConnectionManager::new(
            KeyPair::generate(),
            Arc::new(testnet.clone()),
            Arc::new(IdentityResolver::new()),
            ManagerConfig::default(),
        );
        manager.set_replicator(store.replicator());
        (manager, store)
    }

    #[tokio::test]
    async fn test_update_without_peers_returns_false() {
        let store = Corestore::temporary(None, DEFAULT_UPDATE_TIMEOUT).unwrap();
        let core = store.get_named("posts").unwrap();
        assert!(!core.update().await.unwrap());
    }

    #[tokio::test]
    async fn test_clone_catches_up() {
        let testnet = Testnet::new();
        let (alice, alice_store) = peer(&testnet);
        let (bob, bob_store) = peer(&testnet);
        alice.listen().await.unwrap();

        let core = alice_store.get_named("posts").unwrap();
        core.append(b"hello").unwrap();
        core.append(b"world").unwrap();

        let clone = bob_store.get_by_key(core.key()).unwrap();
        assert!(!clone.is_writable());

        let conn = bob.connect(alice.public_key()).unwrap();
        assert!(tokio::time::timeout(WAIT, conn.opened()).await.unwrap());
        tokio::time::timeout(WAIT, clone.update()).await.unwrap().unwrap();

        assert_eq!(clone.len(), 2);
        assert_eq!(clone.get(0).unwrap().as_deref(), Some(&b"hello"[..]));
        assert_eq!(clone.get(1).unwrap().as_deref(), Some(&b"world"[..]));
        assert!(matches!(clone.append(b"!"), Err(Error::ReadOnly)));
    }

    #[tokio::test]
    async fn test_live_appends_propagate() {
        let testnet = Testnet::new();
        let (alice, alice_store) = peer(&testnet);
        let (bob, bob_store) = peer(&testnet);
        alice.listen().await.unwrap();

        let core = alice_store.get_named("feed").unwrap();
        let clone = bob_store.get_by_key(core.key()).unwrap();
        let conn = bob.connect(alice.public_key()).unwrap();
        assert!(tokio::time::timeout(WAIT, conn.opened()).await.unwrap());

        core.append(b"first").unwrap();
        tokio::time::timeout(WAIT, async {
            while clone.len() < 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(clone.get(0).unwrap().as_deref(), Some(&b"first"[..]));
    }

    #[test]
    fn test_message_encoding_is_stable() {
        let message = ReplicationMessage::SyncAck { id: 7 };
        let bytes = postcard::to_allocvec(&message).unwrap();
        assert_eq!(bytes, vec![4, 7]);
        assert_eq!(
            postcard::from_bytes::<ReplicationMessage>(&bytes).unwrap(),
            message
        );
    }
}
