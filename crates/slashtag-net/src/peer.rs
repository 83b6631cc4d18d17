//! Peer information attached to an established connection

use slashtag_core::PublicKey;
use std::time::{SystemTime, UNIX_EPOCH};

/// Which side opened the underlying socket
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// We dialed the peer
    Outbound,
    /// The peer dialed us
    Inbound,
}

/// Information about a connected peer
#[derive(Clone, Debug)]
pub struct PeerInfo {
    /// Remote canonical key
    pub public_key: PublicKey,
    /// Who initiated the socket that won
    pub direction: Direction,
    /// Connected timestamp (unix millis)
    pub connected_at: u64,
}

impl PeerInfo {
    pub fn new(public_key: PublicKey, direction: Direction) -> Self {
        Self {
            public_key,
            direction,
            connected_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }

    /// Whether we initiated the connection
    pub fn is_initiator(&self) -> bool {
        self.direction == Direction::Outbound
    }
}
