//! File content objects

use super::Hash;
use bytes::Bytes;

/// Immutable backing content of a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    hash: Hash,
    data: Bytes,
}

impl Blob {
    /// Create a blob, computing its content hash
    pub fn new(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Blob {
            hash: Hash::of(&data),
            data,
        }
    }

    /// Create a blob whose identifier was assigned by the backing store
    pub fn with_hash(hash: Hash, data: impl Into<Bytes>) -> Self {
        Blob {
            hash,
            data: data.into(),
        }
    }

    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// Content bytes (cheap to clone)
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
