//! Backing store seam
//!
//! The backing store is the remote, authoritative source of immutable
//! objects. How it reaches them (network protocol, on-disk pack, ...) is up
//! to the implementation.

use crate::error::Result;
use crate::model::{Blob, Hash, Tree};
use async_trait::async_trait;

/// Source of immutable trees, blobs and commit roots.
///
/// Implementations report `Error::ObjectMissing` for hashes they will never
/// be able to supply and `Error::Fetch` for failures worth retrying.
#[async_trait]
pub trait BackingStore: Send + Sync + 'static {
    async fn get_tree(&self, hash: Hash) -> Result<Tree>;

    async fn get_blob(&self, hash: Hash) -> Result<Blob>;

    /// Root tree hash of a snapshot (commit)
    async fn get_root_tree_hash(&self, commit: Hash) -> Result<Hash>;

    /// Short name used in log messages
    fn name(&self) -> &str {
        "backing"
    }
}
