//! Seam through which storage replication rides on connections

use crate::connection::Connection;
use bytes::Bytes;
use std::sync::Arc;

/// Receives replication traffic for every connection of a manager.
///
/// Calls for one connection arrive in order: `on_open` while the socket is
/// attached, before `opened()` resolves; then `on_message` for each inbound
/// replication frame and finally `on_close`, both from the connection's
/// replication task. Implementations answer through
/// [`Connection::replicate`].
pub trait Replicator: Send + Sync + 'static {
    /// The connection is attached and ready to carry frames.
    fn on_open(&self, connection: &Arc<Connection>);

    /// A replication frame arrived.
    fn on_message(&self, connection: &Arc<Connection>, payload: Bytes);

    /// The connection is gone.
    fn on_close(&self, connection: &Arc<Connection>);
}
