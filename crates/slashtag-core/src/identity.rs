//! Identities and reference resolution
//!
//! A peer can be addressed three ways: by its raw public key, by its URL
//! (`slash://<z32 key>`), or by a short id. Ids are either the bare z32 key
//! or a human name registered in the local [`IdentityResolver`]. All three
//! collapse onto one canonical [`PublicKey`].

use crate::crypto::KeyPair;
use crate::error::{Error, Result};
use crate::types::{Bytes32, PublicKey};
use parking_lot::RwLock;
use std::collections::HashMap;

/// URL scheme prefix for slashtag URLs
pub const URL_SCHEME: &str = "slash://";

/// Anything that can name a peer
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reference {
    /// Raw canonical key
    Key(PublicKey),
    /// URL, bare z32 key, or registered local id
    Text(String),
}

impl From<PublicKey> for Reference {
    fn from(key: PublicKey) -> Self {
        Self::Key(key)
    }
}

impl From<&PublicKey> for Reference {
    fn from(key: &PublicKey) -> Self {
        Self::Key(*key)
    }
}

impl From<Bytes32> for Reference {
    fn from(bytes: Bytes32) -> Self {
        Self::Key(PublicKey(bytes))
    }
}

impl From<&str> for Reference {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for Reference {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&String> for Reference {
    fn from(text: &String) -> Self {
        Self::Text(text.clone())
    }
}

/// Format the URL of a key.
pub fn to_url(key: &PublicKey) -> String {
    format!("{URL_SCHEME}{}", key.to_z32())
}

/// Parse a slashtag URL into its key.
///
/// Anything after the key must be a path starting with `/`; it is ignored.
pub fn parse_url(url: &str) -> Result<PublicKey> {
    let rest = url
        .strip_prefix(URL_SCHEME)
        .ok_or_else(|| Error::InvalidReference(format!("not a slashtag url: {url}")))?;
    let encoded = match rest.split_once('/') {
        Some((encoded, _path)) => encoded,
        None => rest,
    };
    PublicKey::from_z32(encoded)
}

/// A participant identity.
///
/// Local identities hold their keypair; remote identities only know the key.
#[derive(Clone, Debug)]
pub struct Identity {
    key: PublicKey,
    keypair: Option<KeyPair>,
    name: Option<String>,
}

impl Identity {
    /// Identity controlled by this process
    pub fn local(keypair: KeyPair, name: Option<String>) -> Self {
        Self {
            key: keypair.public_key(),
            keypair: Some(keypair),
            name,
        }
    }

    /// Identity known only by its key
    pub fn remote(key: PublicKey) -> Self {
        Self {
            key,
            keypair: None,
            name: None,
        }
    }

    pub fn key(&self) -> PublicKey {
        self.key
    }

    pub fn keypair(&self) -> Option<&KeyPair> {
        self.keypair.as_ref()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Whether this process lacks the secret key
    pub fn is_remote(&self) -> bool {
        self.keypair.is_none()
    }

    pub fn url(&self) -> String {
        to_url(&self.key)
    }
}

/// Maps keys, URLs and local ids onto canonical keys.
#[derive(Debug, Default)]
pub struct IdentityResolver {
    names: RwLock<Names>,
}

#[derive(Debug, Default)]
struct Names {
    by_id: HashMap<String, PublicKey>,
    /// First id registered for each key, returned by `to_id`
    by_key: HashMap<PublicKey, String>,
}

impl IdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a human-readable local id to a key.
    ///
    /// Ids that could be mistaken for a key encoding or URL are rejected, and
    /// an id cannot be rebound to a different key.
    pub fn register(&self, id: impl Into<String>, key: PublicKey) -> Result<()> {
        let id = id.into();
        if id.is_empty() || id.starts_with(URL_SCHEME) || PublicKey::from_z32(&id).is_ok() {
            return Err(Error::InvalidReference(format!("ambiguous local id: {id}")));
        }

        let mut names = self.names.write();
        match names.by_id.get(&id) {
            Some(existing) if *existing == key => return Ok(()),
            Some(_) => return Err(Error::NameTaken(id)),
            None => {}
        }
        names.by_key.entry(key).or_insert_with(|| id.clone());
        names.by_id.insert(id, key);
        Ok(())
    }

    /// Resolve any reference to its canonical key.
    pub fn resolve(&self, reference: impl Into<Reference>) -> Result<PublicKey> {
        match reference.into() {
            Reference::Key(key) => Ok(key),
            Reference::Text(text) => {
                if text.starts_with(URL_SCHEME) {
                    return parse_url(&text);
                }
                if let Some(key) = self.names.read().by_id.get(&text) {
                    return Ok(*key);
                }
                PublicKey::from_z32(&text)
                    .map_err(|_| Error::InvalidReference(format!("unresolvable reference: {text}")))
            }
        }
    }

    pub fn to_url(&self, key: &PublicKey) -> String {
        to_url(key)
    }

    /// Registered local id of `key`, or its bare z32 encoding.
    pub fn to_id(&self, key: &PublicKey) -> String {
        self.names
            .read()
            .by_key
            .get(key)
            .cloned()
            .unwrap_or_else(|| key.to_z32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> PublicKey {
        PublicKey([byte; 32])
    }

    #[test]
    fn test_all_forms_resolve_to_same_key() {
        let resolver = IdentityResolver::new();
        let k = key(1);
        resolver.register("alice", k).unwrap();

        assert_eq!(resolver.resolve(k).unwrap(), k);
        assert_eq!(resolver.resolve(resolver.to_url(&k)).unwrap(), k);
        assert_eq!(resolver.resolve("alice").unwrap(), k);
        assert_eq!(resolver.resolve(k.to_z32()).unwrap(), k);
    }

    #[test]
    fn test_to_id_prefers_registered_name() {
        let resolver = IdentityResolver::new();
        let k = key(2);
        assert_eq!(resolver.to_id(&k), k.to_z32());

        resolver.register("bob", k).unwrap();
        resolver.register("robert", k).unwrap();
        assert_eq!(resolver.to_id(&k), "bob");
    }

    #[test]
    fn test_url_with_path() {
        let k = key(3);
        let url = format!("{}/profile.json", to_url(&k));
        assert_eq!(parse_url(&url).unwrap(), k);
    }

    #[test]
    fn test_invalid_references() {
        let resolver = IdentityResolver::new();
        assert!(matches!(
            resolver.resolve("nobody"),
            Err(Error::InvalidReference(_))
        ));
        assert!(matches!(
            resolver.resolve("slash://not-a-key"),
            Err(Error::InvalidReference(_))
        ));
        assert!(matches!(
            resolver.resolve(key(4).to_z32().to_uppercase()),
            Err(Error::InvalidReference(_))
        ));
        assert!(matches!(
            resolver.resolve(format!("SLASH://{}", key(4).to_z32())),
            Err(Error::InvalidReference(_))
        ));
    }

    #[test]
    fn test_register_conflicts() {
        let resolver = IdentityResolver::new();
        resolver.register("carol", key(5)).unwrap();
        resolver.register("carol", key(5)).unwrap();

        assert!(matches!(
            resolver.register("carol", key(6)),
            Err(Error::NameTaken(_))
        ));
        assert!(matches!(
            resolver.register(key(6).to_z32(), key(6)),
            Err(Error::InvalidReference(_))
        ));
        assert!(matches!(
            resolver.register(to_url(&key(6)), key(6)),
            Err(Error::InvalidReference(_))
        ));
    }

    #[test]
    fn test_identity_forms() {
        let kp = KeyPair::from_seed(&[8u8; 32]);
        let local = Identity::local(kp.clone(), Some("me".into()));
        assert!(!local.is_remote());
        assert_eq!(local.key(), kp.public_key());
        assert_eq!(parse_url(&local.url()).unwrap(), local.key());

        let remote = Identity::remote(local.key());
        assert!(remote.is_remote());
        assert_eq!(remote.url(), local.url());
    }
}
