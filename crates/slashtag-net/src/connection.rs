//! A direct connection to one peer
//!
//! A [`Connection`] exists before its socket does: it is handed out by
//! `connect()` immediately and attached once the overlay produces a socket.
//! Frames sent in the meantime are queued and flushed on attach.
//!
//! Raw bytes that arrive before anyone subscribed are held back and handed
//! to the first subscriber.

use crate::channel::{Channel, ChannelMultiplexer};
use crate::framing::{ChannelFrame, Frame, FrameCodec, FrameType};
use crate::overlay::{Incoming, OverlaySocket};
use crate::peer::{Direction, PeerInfo};
use crate::replicator::Replicator;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use slashtag_core::{Error, PublicKey, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Raw chunks held for the first subscriber before older ones are dropped
const MAX_DATA_BACKLOG: usize = 1024;

/// Connection to a peer
pub struct Connection {
    id: u64,
    remote_public_key: PublicKey,
    /// `None` while pending, then settled once
    opened: watch::Sender<Option<bool>>,
    peer: Mutex<Option<PeerInfo>>,
    outbound: mpsc::UnboundedSender<Frame>,
    /// Queue drained by the writer task once attached
    queued: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,
    data: Mutex<DataState>,
    /// Inbound socket held back while our own dial decides the tie-break
    parked: Mutex<Option<Incoming>>,
    pub(crate) channels: Mutex<HashMap<String, Arc<Channel>>>,
    pub(crate) cancel: CancellationToken,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_public_key", &self.remote_public_key)
            .field("opened", &*self.opened.borrow())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(remote_public_key: PublicKey, cancel: CancellationToken) -> Arc<Self> {
        let (outbound, queued) = mpsc::unbounded_channel();
        let (opened, _) = watch::channel(None);
        Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            remote_public_key,
            opened,
            peer: Mutex::new(None),
            outbound,
            queued: Mutex::new(Some(queued)),
            data: Mutex::new(DataState::default()),
            parked: Mutex::new(None),
            channels: Mutex::new(HashMap::new()),
            cancel,
        })
    }

    /// Process-unique connection id
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_public_key(&self) -> PublicKey {
        self.remote_public_key
    }

    /// Peer info, available once a socket is attached
    pub fn peer(&self) -> Option<PeerInfo> {
        self.peer.lock().clone()
    }

    /// Resolves `true` once a socket is attached, `false` if the attempt
    /// failed or was cancelled. Never errors.
    pub async fn opened(&self) -> bool {
        let mut rx = self.opened.subscribe();
        let settled = rx
            .wait_for(Option::is_some)
            .await
            .map(|state| state.unwrap_or(false));
        settled.unwrap_or(false)
    }

    /// Whether the connection is attached and not closed
    pub fn is_open(&self) -> bool {
        *self.opened.borrow() == Some(true) && !self.is_closed()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.peer.lock().is_some()
    }

    /// Completes when the connection is closed for any reason.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    /// Write unframed application bytes.
    ///
    /// Raw bytes share the stream with protocol channels and replication.
    pub fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send_frame(Frame::raw(data))
    }

    /// Subscribe to raw bytes written by the peer.
    ///
    /// The first subscriber also receives whatever arrived before it.
    pub fn subscribe_data(&self) -> DataSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut data = self.data.lock();
        if let Some(backlog) = data.backlog.take() {
            for chunk in backlog {
                let _ = tx.send(chunk);
            }
        }
        if !self.is_closed() {
            data.subscribers.push(tx);
        }
        DataSubscription { rx }
    }

    /// Send a replication frame.
    pub fn replicate(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.send_frame(Frame::new(FrameType::Replicate, payload))
    }

    pub(crate) fn send_frame(&self, frame: Frame) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.outbound.send(frame).map_err(|_| Error::Closed)
    }

    pub(crate) fn outbound(&self) -> mpsc::UnboundedSender<Frame> {
        self.outbound.clone()
    }

    /// Channels bound so far, by protocol name
    pub fn channel_names(&self) -> Vec<String> {
        self.channels.lock().keys().cloned().collect()
    }

    /// Close gracefully: the peer is told, queued frames are flushed, and a
    /// pending attempt resolves `opened()` to `false`. Idempotent.
    pub fn close(&self) {
        if self.is_closed() {
            return;
        }
        let _ = self.outbound.send(Frame::close());
        self.teardown();
    }

    pub(crate) fn teardown(&self) {
        self.settle(false);
        self.cancel.cancel();
        self.data.lock().subscribers.clear();
        self.channels.lock().clear();
        if let Some(incoming) = self.parked.lock().take() {
            incoming.reject();
        }
    }

    /// Hold an inbound socket until the pending dial settles. A socket
    /// parked earlier is rejected.
    pub(crate) fn park(&self, incoming: Incoming) {
        if let Some(previous) = self.parked.lock().replace(incoming) {
            previous.reject();
        }
    }

    pub(crate) fn take_parked(&self) -> Option<Incoming> {
        self.parked.lock().take()
    }

    /// Settle `opened` if still pending. Returns whether this call settled it.
    pub(crate) fn settle(&self, value: bool) -> bool {
        self.opened.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(value);
                true
            } else {
                false
            }
        })
    }

    /// Bind a socket to this connection and start its tasks.
    ///
    /// Returns `false`, dropping the socket, if a socket is already attached
    /// or the connection is closed.
    pub(crate) fn attach(
        self: &Arc<Self>,
        socket: OverlaySocket,
        direction: Direction,
        mux: ChannelMultiplexer,
        replicator: Option<Arc<dyn Replicator>>,
    ) -> bool {
        if self.is_closed() {
            return false;
        }
        let queued = {
            let mut peer = self.peer.lock();
            if peer.is_some() {
                return false;
            }
            let Some(queued) = self.queued.lock().take() else {
                return false;
            };
            *peer = Some(PeerInfo::new(self.remote_public_key, direction));
            queued
        };

        let (read, write) = tokio::io::split(socket.stream);
        tokio::spawn(write_loop(
            FramedWrite::new(write, FrameCodec::new()),
            queued,
            self.cancel.clone(),
            self.remote_public_key,
        ));

        let replication = replicator.map(|replicator| {
            replicator.on_open(self);
            spawn_replication(self, replicator)
        });
        tokio::spawn(read_loop(
            self.clone(),
            FramedRead::new(read, FrameCodec::new()),
            mux,
            replication,
        ));

        self.settle(true);
        debug!(
            "connection {} to {} attached ({:?})",
            self.id, self.remote_public_key, direction
        );
        true
    }

    fn deliver_data(&self, chunk: Bytes) {
        let mut data = self.data.lock();
        if let Some(backlog) = data.backlog.as_mut() {
            if backlog.len() == MAX_DATA_BACKLOG {
                backlog.pop_front();
                debug!("data backlog of connection {} full, dropping oldest", self.id);
            }
            backlog.push_back(chunk);
            return;
        }
        data.subscribers.retain(|tx| tx.send(chunk.clone()).is_ok());
    }
}

struct DataState {
    subscribers: Vec<mpsc::UnboundedSender<Bytes>>,
    /// `Some` until the first subscriber attaches
    backlog: Option<VecDeque<Bytes>>,
}

impl Default for DataState {
    fn default() -> Self {
        Self {
            subscribers: Vec::new(),
            backlog: Some(VecDeque::new()),
        }
    }
}

/// Ordered stream of raw bytes from the peer.
///
/// Dropping the subscription (or calling [`DataSubscription::unsubscribe`])
/// stops delivery.
#[derive(Debug)]
pub struct DataSubscription {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl DataSubscription {
    /// Next chunk, or `None` once the connection closed
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    pub fn unsubscribe(self) {}
}

async fn write_loop<W>(
    mut sink: FramedWrite<W, FrameCodec>,
    mut queued: mpsc::UnboundedReceiver<Frame>,
    cancel: CancellationToken,
    remote: PublicKey,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            frame = queued.recv() => {
                let Some(frame) = frame else { break };
                let closing = frame.frame_type == FrameType::Close;
                if let Err(e) = sink.send(frame).await {
                    debug!("write to {} failed: {}", remote, e);
                    break;
                }
                if closing {
                    break;
                }
            }
            _ = cancel.cancelled() => {
                // Flush what was queued before the close, close frame included
                while let Ok(frame) = queued.try_recv() {
                    let closing = frame.frame_type == FrameType::Close;
                    if sink.feed(frame).await.is_err() || closing {
                        break;
                    }
                }
                let _ = sink.flush().await;
                break;
            }
        }
    }
    let _ = sink.close().await;
}

async fn read_loop<R>(
    conn: Arc<Connection>,
    mut stream: FramedRead<R, FrameCodec>,
    mux: ChannelMultiplexer,
    replication: Option<mpsc::UnboundedSender<Bytes>>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = conn.cancel.cancelled() => break,
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(frame)) => match frame.frame_type {
                FrameType::Raw => conn.deliver_data(frame.payload),
                FrameType::Channel => match ChannelFrame::from_frame(&frame) {
                    Ok(message) => mux.dispatch(&conn, message),
                    Err(e) => debug!("malformed channel frame from {}: {}", conn.remote_public_key, e),
                },
                FrameType::Replicate => {
                    if let Some(tx) = &replication {
                        let _ = tx.send(frame.payload);
                    }
                }
                FrameType::Close => {
                    debug!("{} closed connection {}", conn.remote_public_key, conn.id);
                    break;
                }
            },
            Some(Err(e)) => {
                warn!("stream error from {}: {}", conn.remote_public_key, e);
                break;
            }
            None => break,
        }
    }
    conn.teardown();
}

fn spawn_replication(
    conn: &Arc<Connection>,
    replicator: Arc<dyn Replicator>,
) -> mpsc::UnboundedSender<Bytes> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let conn = conn.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = conn.cancel.cancelled() => break,
                payload = rx.recv() => match payload {
                    Some(payload) => replicator.on_message(&conn, payload),
                    None => break,
                },
            }
        }
        replicator.on_close(&conn);
    });
    tx
}
