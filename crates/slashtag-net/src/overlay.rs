//! Overlay transport seam
//!
//! The overlay locates peers by public key and hands back a direct,
//! authenticated byte stream. Routing and the transport handshake live
//! behind this trait; [`crate::testnet::Testnet`] is the in-memory
//! implementation.

use slashtag_core::{KeyPair, PublicKey};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};

/// Boxed future returned by overlay operations
pub type BoxedFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Bidirectional byte stream produced by the overlay
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Owned, type-erased stream
pub type BoxStream = Box<dyn AsyncStream>;

/// Overlay errors
#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("Peer not found: {0}")]
    PeerNotFound(PublicKey),
    #[error("Connection rejected by {0}")]
    Rejected(PublicKey),
    #[error("Key already announced: {0}")]
    AlreadyAnnounced(PublicKey),
    #[error("Overlay unavailable: {0}")]
    Unavailable(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<OverlayError> for slashtag_core::Error {
    fn from(e: OverlayError) -> Self {
        slashtag_core::Error::Transport(e.to_string())
    }
}

/// An established socket to a peer
pub struct OverlaySocket {
    pub remote_public_key: PublicKey,
    pub stream: BoxStream,
}

impl std::fmt::Debug for OverlaySocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlaySocket")
            .field("remote_public_key", &self.remote_public_key)
            .finish_non_exhaustive()
    }
}

/// An inbound socket awaiting an accept/reject decision.
///
/// Dropping it without a decision rejects it.
pub struct Incoming {
    remote_public_key: PublicKey,
    stream: BoxStream,
    decision: oneshot::Sender<bool>,
}

impl Incoming {
    pub fn new(remote_public_key: PublicKey, stream: BoxStream, decision: oneshot::Sender<bool>) -> Self {
        Self {
            remote_public_key,
            stream,
            decision,
        }
    }

    pub fn remote_public_key(&self) -> PublicKey {
        self.remote_public_key
    }

    /// Accept the socket; the dialer's connect attempt succeeds.
    pub fn accept(self) -> OverlaySocket {
        let _ = self.decision.send(true);
        OverlaySocket {
            remote_public_key: self.remote_public_key,
            stream: self.stream,
        }
    }

    /// Refuse the socket; the dialer's connect attempt fails.
    pub fn reject(self) {
        let _ = self.decision.send(false);
    }
}

/// Announced server for one keypair.
///
/// Dropping the server withdraws the announcement.
pub struct OverlayServer {
    public_key: PublicKey,
    incoming: mpsc::UnboundedReceiver<Incoming>,
    unannounce: Option<Box<dyn FnOnce() + Send>>,
}

impl OverlayServer {
    pub fn new(
        public_key: PublicKey,
        incoming: mpsc::UnboundedReceiver<Incoming>,
        unannounce: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            public_key,
            incoming,
            unannounce: Some(Box::new(unannounce)),
        }
    }

    /// The announced key
    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    /// Next inbound socket, or `None` once the overlay shut down
    pub async fn accept(&mut self) -> Option<Incoming> {
        self.incoming.recv().await
    }
}

impl Drop for OverlayServer {
    fn drop(&mut self) {
        if let Some(unannounce) = self.unannounce.take() {
            unannounce();
        }
    }
}

/// Peer discovery and direct-socket establishment
pub trait Overlay: Send + Sync + 'static {
    /// Announce `keypair` as reachable and start receiving inbound sockets.
    fn listen(&self, keypair: &KeyPair) -> BoxedFuture<Result<OverlayServer, OverlayError>>;

    /// Locate `remote` and open a direct socket to it as `keypair`.
    ///
    /// Performs a single attempt; callers bound it with their own timeout.
    fn connect(
        &self,
        keypair: &KeyPair,
        remote: PublicKey,
    ) -> BoxedFuture<Result<OverlaySocket, OverlayError>>;
}
