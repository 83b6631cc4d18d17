//! Slashtag Core Library
//!
//! This crate provides the identity primitives shared by every other slashtag
//! crate: public keys, keypairs and their derivations, the reference resolver
//! that maps keys, URLs and local ids onto one canonical key, and the error
//! taxonomy.
//!
//! # Modules
//!
//! - [`types`]: Fixed-size key types
//! - [`crypto`]: Keypairs, key derivation and block signing
//! - [`identity`]: Identities, URLs and the [`IdentityResolver`]
//! - [`error`]: Error types

pub mod crypto;
pub mod error;
pub mod identity;
pub mod types;

pub use crypto::KeyPair;
pub use error::{Error, Result};
pub use identity::{Identity, IdentityResolver, Reference, URL_SCHEME};
pub use types::*;
