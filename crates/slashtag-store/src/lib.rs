//! Slashtag Storage
//!
//! Signed append-only logs ("cores") persisted in sled, the path-addressed
//! [`Drive`] built on one core, and the [`StorageBridge`] that replicates
//! cores over connections.
//!
//! # Modules
//!
//! - [`storage`]: sled trees for blocks and store metadata
//! - [`log`]: one signed append-only log (a [`Core`])
//! - [`drive`]: key/value files on a core
//! - [`bridge`]: replication sessions
//! - [`corestore`]: opens and caches cores by name or key

pub mod bridge;
pub mod corestore;
pub mod drive;
pub mod log;
pub mod storage;

pub use bridge::{ReplicationMessage, StorageBridge, DEFAULT_UPDATE_TIMEOUT};
pub use corestore::Corestore;
pub use drive::Drive;
pub use log::Core;
pub use storage::{Block, Storage, StoreError};
