//! Fixed-size key types

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 32-byte fixed-size array used for keys, seeds and hashes.
pub type Bytes32 = [u8; 32];

/// Canonical ed25519 public key identifying a peer, a log or a drive.
///
/// Equality is byte-exact; the textual form is z-base-32.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey(pub Bytes32);

impl PublicKey {
    /// Wrap raw key bytes
    pub const fn from_bytes(bytes: Bytes32) -> Self {
        Self(bytes)
    }

    /// Parse from a slice, which must be exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: Bytes32 = bytes.try_into().map_err(|_| {
            Error::InvalidReference(format!("expected 32 key bytes, got {}", bytes.len()))
        })?;
        Ok(Self(bytes))
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &Bytes32 {
        &self.0
    }

    /// z-base-32 encoding, the canonical textual form
    pub fn to_z32(&self) -> String {
        z32::encode(&self.0)
    }

    /// Decode a canonical z-base-32 key.
    ///
    /// Input that does not re-encode to itself (wrong case, non-zero padding
    /// bits) is rejected.
    pub fn from_z32(s: &str) -> Result<Self> {
        let bytes = z32::decode(s.as_bytes())
            .map_err(|_| Error::InvalidReference(format!("not a z32 key: {s}")))?;
        let key = Self::from_slice(&bytes)?;
        if key.to_z32() != s {
            return Err(Error::InvalidReference(format!("non-canonical key encoding: {s}")));
        }
        Ok(key)
    }
}

impl From<Bytes32> for PublicKey {
    fn from(bytes: Bytes32) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_z32())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.0[..8]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_z32_roundtrip_is_canonical() {
        let key = PublicKey([7u8; 32]);
        let text = key.to_z32();
        assert_eq!(PublicKey::from_z32(&text).unwrap(), key);
    }

    #[test]
    fn test_uppercase_rejected() {
        let key = PublicKey([42u8; 32]);
        let upper = key.to_z32().to_uppercase();
        assert!(matches!(
            PublicKey::from_z32(&upper),
            Err(Error::InvalidReference(_))
        ));
    }

    #[test]
    fn test_wrong_length_rejected() {
        assert!(PublicKey::from_slice(&[1, 2, 3]).is_err());
        let short = z32::encode(&[1u8; 16]);
        assert!(PublicKey::from_z32(&short).is_err());
    }
}
