//! Slashtag Networking
//!
//! Direct peer connections for slashtag identities:
//!
//! - [`overlay`]: the discovery/transport seam, with the in-memory [`testnet`]
//! - [`framing`]: length-prefixed frames sharing one byte stream
//! - [`connection`]: one connection per remote key, raw bytes and frames
//! - [`manager`]: the connection cache, listener and tie-break
//! - [`protocol`], [`channel`], [`encoding`]: named protocols multiplexed as
//!   independent channels
//! - [`replicator`]: hook for storage replication traffic

pub mod channel;
pub mod connection;
pub mod encoding;
pub mod framing;
pub mod manager;
pub mod overlay;
pub mod peer;
pub mod protocol;
pub mod replicator;
pub mod testnet;

pub use channel::{Channel, ChannelMultiplexer, MessageSender};
pub use connection::{Connection, DataSubscription};
pub use encoding::{Encoding, Value};
pub use framing::{ChannelFrame, Frame, FrameCodec, FrameError, FrameType};
pub use manager::{ConnectionEvents, ConnectionManager, ManagerConfig, ProtocolHandle};
pub use overlay::{Incoming, Overlay, OverlayError, OverlayServer, OverlaySocket};
pub use peer::{Direction, PeerInfo};
pub use protocol::{MessageHandler, MessageSpec, ProtocolDefinition, ProtocolRegistry};
pub use replicator::Replicator;
pub use testnet::Testnet;
