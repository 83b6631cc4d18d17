//! In-memory overlay for tests and local demos
//!
//! Announced keys live in a shared table; connecting looks the key up and
//! hands the server one end of a `tokio::io::duplex` pipe. The dialer only
//! succeeds once the server side explicitly accepts.

use crate::overlay::{BoxedFuture, Incoming, Overlay, OverlayError, OverlayServer, OverlaySocket};
use parking_lot::Mutex;
use slashtag_core::{KeyPair, PublicKey};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Duplex buffer size per direction
const PIPE_CAPACITY: usize = 64 * 1024;

/// Shared in-memory overlay. Clones share the same announce table.
#[derive(Clone, Default)]
pub struct Testnet {
    inner: Arc<TestnetInner>,
}

#[derive(Default)]
struct TestnetInner {
    /// Announced key -> (server id, inbound queue)
    servers: Mutex<HashMap<PublicKey, (u64, mpsc::UnboundedSender<Incoming>)>>,
    /// Connect attempts per target key
    attempts: Mutex<HashMap<PublicKey, usize>>,
    /// Simulated lookup latency
    discovery_delay: Mutex<Duration>,
    next_server_id: AtomicU64,
}

impl Testnet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every lookup by `delay` before resolving the target.
    pub fn with_discovery_delay(self, delay: Duration) -> Self {
        *self.inner.discovery_delay.lock() = delay;
        self
    }

    /// Number of connect attempts made towards `key`
    pub fn attempts(&self, key: &PublicKey) -> usize {
        self.inner.attempts.lock().get(key).copied().unwrap_or(0)
    }

    /// Whether `key` is currently announced
    pub fn is_announced(&self, key: &PublicKey) -> bool {
        self.inner.servers.lock().contains_key(key)
    }
}

impl Overlay for Testnet {
    fn listen(&self, keypair: &KeyPair) -> BoxedFuture<Result<OverlayServer, OverlayError>> {
        let inner = self.inner.clone();
        let public_key = keypair.public_key();

        Box::pin(async move {
            let (tx, rx) = mpsc::unbounded_channel();
            let id = inner.next_server_id.fetch_add(1, Ordering::Relaxed);
            {
                let mut servers = inner.servers.lock();
                if servers.contains_key(&public_key) {
                    return Err(OverlayError::AlreadyAnnounced(public_key));
                }
                servers.insert(public_key, (id, tx));
            }
            debug!("testnet: announced {}", public_key);

            let table = inner.clone();
            Ok(OverlayServer::new(public_key, rx, move || {
                let mut servers = table.servers.lock();
                if servers.get(&public_key).map(|(sid, _)| *sid) == Some(id) {
                    servers.remove(&public_key);
                    debug!("testnet: unannounced {}", public_key);
                }
            }))
        })
    }

    fn connect(
        &self,
        keypair: &KeyPair,
        remote: PublicKey,
    ) -> BoxedFuture<Result<OverlaySocket, OverlayError>> {
        let inner = self.inner.clone();
        let local = keypair.public_key();

        Box::pin(async move {
            *inner.attempts.lock().entry(remote).or_insert(0) += 1;

            let delay = *inner.discovery_delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let server = inner
                .servers
                .lock()
                .get(&remote)
                .map(|(_, tx)| tx.clone())
                .ok_or(OverlayError::PeerNotFound(remote))?;

            let (ours, theirs) = tokio::io::duplex(PIPE_CAPACITY);
            let (decision_tx, decision_rx) = oneshot::channel();
            server
                .send(Incoming::new(local, Box::new(theirs), decision_tx))
                .map_err(|_| OverlayError::PeerNotFound(remote))?;

            match decision_rx.await {
                Ok(true) => Ok(OverlaySocket {
                    remote_public_key: remote,
                    stream: Box::new(ours),
                }),
                _ => Err(OverlayError::Rejected(remote)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_connect_to_announced_key() {
        let testnet = Testnet::new();
        let server_kp = KeyPair::generate();
        let client_kp = KeyPair::generate();

        let mut server = testnet.listen(&server_kp).await.unwrap();
        let accept = tokio::spawn(async move {
            let incoming = server.accept().await.unwrap();
            let remote = incoming.remote_public_key();
            let mut socket = incoming.accept();
            let mut buf = [0u8; 4];
            socket.stream.read_exact(&mut buf).await.unwrap();
            (remote, buf)
        });

        let mut socket = testnet
            .connect(&client_kp, server_kp.public_key())
            .await
            .unwrap();
        assert_eq!(socket.remote_public_key, server_kp.public_key());
        socket.stream.write_all(b"ping").await.unwrap();

        let (remote, buf) = accept.await.unwrap();
        assert_eq!(remote, client_kp.public_key());
        assert_eq!(&buf, b"ping");
        assert_eq!(testnet.attempts(&server_kp.public_key()), 1);
    }

    #[tokio::test]
    async fn test_unknown_key_not_found() {
        let testnet = Testnet::new();
        let target = KeyPair::generate().public_key();
        let result = testnet.connect(&KeyPair::generate(), target).await;
        assert!(matches!(result, Err(OverlayError::PeerNotFound(_))));
    }

    #[tokio::test]
    async fn test_rejected_and_unannounced() {
        let testnet = Testnet::new();
        let server_kp = KeyPair::generate();
        let mut server = testnet.listen(&server_kp).await.unwrap();
        assert!(testnet.is_announced(&server_kp.public_key()));

        let dial = {
            let testnet = testnet.clone();
            let target = server_kp.public_key();
            tokio::spawn(async move { testnet.connect(&KeyPair::generate(), target).await })
        };
        server.accept().await.unwrap().reject();
        assert!(matches!(
            dial.await.unwrap(),
            Err(OverlayError::Rejected(_))
        ));

        drop(server);
        assert!(!testnet.is_announced(&server_kp.public_key()));
    }

    #[tokio::test]
    async fn test_double_announce_fails() {
        let testnet = Testnet::new();
        let kp = KeyPair::generate();
        let _server = testnet.listen(&kp).await.unwrap();
        assert!(matches!(
            testnet.listen(&kp).await,
            Err(OverlayError::AlreadyAnnounced(_))
        ));
    }
}
