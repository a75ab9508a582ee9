//! Content identifiers

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Fixed-size content identifier (BLAKE3 digest)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash([u8; Hash::LEN]);

impl Hash {
    /// Digest length in bytes
    pub const LEN: usize = 32;

    /// All-zero hash, never produced by hashing real content
    pub const ZERO: Hash = Hash([0u8; Hash::LEN]);

    /// Hash arbitrary content
    pub fn of(data: &[u8]) -> Self {
        Hash(*blake3::hash(data).as_bytes())
    }

    /// Wrap raw digest bytes
    pub fn from_bytes(bytes: [u8; Hash::LEN]) -> Self {
        Hash(bytes)
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; Hash::LEN] {
        &self.0
    }

    /// Lowercase hex form
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the lowercase (or uppercase) hex form
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| Error::InvalidArgument(format!("bad hash {:?}: {}", s, e)))?;
        let bytes: [u8; Hash::LEN] = bytes.try_into().map_err(|_| {
            Error::InvalidArgument(format!("bad hash {:?}: expected {} bytes", s, Hash::LEN))
        })?;
        Ok(Hash(bytes))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", &self.to_hex()[..12])
    }
}

impl FromStr for Hash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Hash::from_hex(s)
    }
}
