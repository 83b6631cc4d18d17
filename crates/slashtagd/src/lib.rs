//! slashtagd - Slashtag SDK
//!
//! Ties identities, connections and storage together:
//! - [`Sdk`]: one corestore, one resolver, many slashtags
//! - [`Slashtag`]: an identity with its connection manager and drive
//! - [`profile`]: the JSON profile document in a slashtag's drive
//! - [`config`]: command line and environment configuration

pub mod config;
pub mod profile;
pub mod sdk;
pub mod slashtag;

pub use config::Config;
pub use profile::PROFILE_PATH;
pub use sdk::Sdk;
pub use slashtag::Slashtag;
