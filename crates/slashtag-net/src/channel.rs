//! Protocol channels multiplexed over one connection
//!
//! Every channel frame is tagged with its protocol name. Inbound frames are
//! routed to the channel of that protocol, which runs its handlers from a
//! dedicated task so protocols never wait on each other.

use crate::connection::Connection;
use crate::encoding::{Encoding, Value};
use crate::framing::{ChannelFrame, Frame};
use crate::protocol::{ProtocolDefinition, ProtocolRegistry};
use slashtag_core::{Error, PublicKey, Result};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Send handle for one message kind of a channel
#[derive(Clone)]
pub struct MessageSender {
    protocol: String,
    ordinal: u32,
    encoding: Encoding,
    outbound: mpsc::UnboundedSender<Frame>,
    cancel: CancellationToken,
}

impl fmt::Debug for MessageSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageSender")
            .field("protocol", &self.protocol)
            .field("ordinal", &self.ordinal)
            .field("encoding", &self.encoding)
            .finish()
    }
}

impl MessageSender {
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Encode `value` and queue it on the connection.
    pub fn send(&self, value: impl Into<Value>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Closed);
        }
        let body = self.encoding.encode(&value.into())?;
        let frame = ChannelFrame {
            protocol: self.protocol.clone(),
            ordinal: self.ordinal,
            body,
        }
        .to_frame()?;
        self.outbound.send(frame).map_err(|_| Error::Closed)
    }
}

/// Binding of one protocol to one connection
pub struct Channel {
    protocol: Arc<ProtocolDefinition>,
    remote_public_key: PublicKey,
    senders: Vec<MessageSender>,
    inbox: mpsc::UnboundedSender<(u32, Vec<u8>)>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("protocol", &self.protocol.name())
            .field("remote_public_key", &self.remote_public_key)
            .finish()
    }
}

impl Channel {
    fn open(conn: &Connection, protocol: Arc<ProtocolDefinition>) -> Arc<Self> {
        let senders = protocol
            .messages()
            .iter()
            .enumerate()
            .map(|(ordinal, spec)| MessageSender {
                protocol: protocol.name().to_string(),
                ordinal: ordinal as u32,
                encoding: spec.encoding,
                outbound: conn.outbound(),
                cancel: conn.cancel.clone(),
            })
            .collect();

        let (inbox, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            protocol,
            remote_public_key: conn.remote_public_key(),
            senders,
            inbox,
        });
        tokio::spawn(dispatch_loop(channel.clone(), rx, conn.cancel.clone()));
        channel
    }

    /// Protocol name, which is also the wire tag
    pub fn name(&self) -> &str {
        self.protocol.name()
    }

    pub fn remote_public_key(&self) -> PublicKey {
        self.remote_public_key
    }

    /// Send handles, indexed by declaration order
    pub fn messages(&self) -> &[MessageSender] {
        &self.senders
    }

    pub fn message(&self, ordinal: usize) -> Option<&MessageSender> {
        self.senders.get(ordinal)
    }

    /// Send `value` as message kind `ordinal`.
    pub fn send(&self, ordinal: usize, value: impl Into<Value>) -> Result<()> {
        self.senders
            .get(ordinal)
            .ok_or_else(|| {
                Error::NotFound(format!("message {ordinal} of protocol {}", self.name()))
            })?
            .send(value)
    }

    fn deliver(&self, ordinal: u32, body: Vec<u8>) {
        if ordinal as usize >= self.senders.len() {
            debug!(
                "dropping message {} of {} from {}: no such message",
                ordinal,
                self.name(),
                self.remote_public_key
            );
            return;
        }
        let _ = self.inbox.send((ordinal, body));
    }
}

/// Runs the handlers of one channel, one message at a time.
async fn dispatch_loop(
    channel: Arc<Channel>,
    mut rx: mpsc::UnboundedReceiver<(u32, Vec<u8>)>,
    cancel: CancellationToken,
) {
    loop {
        let (ordinal, body) = tokio::select! {
            _ = cancel.cancelled() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let spec = &channel.protocol.messages()[ordinal as usize];
        let Some(handler) = spec.handler.clone() else {
            continue;
        };
        let value = match spec.encoding.decode(&body) {
            Ok(value) => value,
            Err(e) => {
                warn!("{}: undecodable message {}: {}", channel.name(), ordinal, e);
                continue;
            }
        };

        let ch = channel.clone();
        match tokio::task::spawn_blocking(move || handler(&ch, value)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{}: handler for message {} failed: {:#}", channel.name(), ordinal, e),
            Err(e) if e.is_panic() => warn!("{}: handler for message {} panicked", channel.name(), ordinal),
            Err(e) => debug!("{}: handler cancelled: {}", channel.name(), e),
        }
    }
}

/// Routes channel frames of every connection to their channels.
#[derive(Clone, Debug)]
pub struct ChannelMultiplexer {
    registry: Arc<ProtocolRegistry>,
}

impl ChannelMultiplexer {
    pub fn new(registry: Arc<ProtocolRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ProtocolRegistry> {
        &self.registry
    }

    /// Channel of protocol `name` on `conn`, created on first use.
    pub fn get_channel(&self, conn: &Connection, name: &str) -> Result<Arc<Channel>> {
        if conn.is_closed() {
            return Err(Error::Closed);
        }
        let protocol = self
            .registry
            .get(name)
            .ok_or_else(|| Error::UnknownProtocol(name.to_string()))?;
        Ok(self.bind(conn, protocol))
    }

    pub(crate) fn bind(&self, conn: &Connection, protocol: Arc<ProtocolDefinition>) -> Arc<Channel> {
        conn.channels
            .lock()
            .entry(protocol.name().to_string())
            .or_insert_with(|| Channel::open(conn, protocol))
            .clone()
    }

    /// Create channels for every registered protocol.
    pub(crate) fn bind_all(&self, conn: &Connection) {
        for protocol in self.registry.all() {
            self.bind(conn, protocol);
        }
    }

    pub(crate) fn dispatch(&self, conn: &Connection, frame: ChannelFrame) {
        let existing = conn.channels.lock().get(&frame.protocol).cloned();
        let channel = match existing {
            Some(channel) => channel,
            None => match self.registry.get(&frame.protocol) {
                Some(protocol) => self.bind(conn, protocol),
                None => {
                    debug!(
                        "dropping frame for unregistered protocol {:?} from {}",
                        frame.protocol,
                        conn.remote_public_key()
                    );
                    return;
                }
            },
        };
        channel.deliver(frame.ordinal, frame.body);
    }
}
