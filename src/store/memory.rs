//! In-memory backing store
//!
//! Holds objects in hash maps. Supports fault injection (failed fetches,
//! added latency) and counts fetches per hash, which makes it the backing
//! store of choice for tests and demos.

use super::BackingStore;
use crate::error::{Error, Result};
use crate::model::{Blob, EntryKind, Hash, Tree, TreeEntry};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Backing store held entirely in memory
#[derive(Default)]
pub struct MemoryBackingStore {
    trees: RwLock<HashMap<Hash, Tree>>,
    blobs: RwLock<HashMap<Hash, Bytes>>,
    commits: RwLock<HashMap<Hash, Hash>>,
    /// Number of upcoming fetches that fail with `Error::Fetch`
    fail_next: AtomicU32,
    /// Delay applied before answering each fetch
    latency: Mutex<Duration>,
    /// Fetches served (or attempted) per hash
    fetches: DashMap<Hash, u64>,
    total_fetches: AtomicU64,
}

impl MemoryBackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store file content, returning its hash
    pub fn put_blob(&self, data: impl Into<Bytes>) -> Hash {
        let blob = Blob::new(data);
        let hash = blob.hash();
        self.blobs.write().insert(hash, blob.data().clone());
        hash
    }

    /// Store a tree built from entries, returning its hash
    pub fn put_tree(&self, entries: Vec<TreeEntry>) -> Hash {
        let tree = Tree::new(entries);
        let hash = tree.hash();
        self.trees.write().insert(hash, tree);
        hash
    }

    /// Record a snapshot pointing at `root_tree`, returning the snapshot id
    pub fn put_commit(&self, root_tree: Hash) -> Hash {
        let mut id_source = b"commit ".to_vec();
        id_source.extend_from_slice(root_tree.as_bytes());
        let commit = Hash::of(&id_source);
        self.commits.write().insert(commit, root_tree);
        commit
    }

    /// Convenience: store `files` (name, content) as a flat tree plus commit
    pub fn put_flat_commit(&self, files: &[(&str, &[u8])]) -> Hash {
        let entries = files
            .iter()
            .map(|(name, content)| {
                TreeEntry::new(*name, self.put_blob(content.to_vec()), EntryKind::Regular)
            })
            .collect();
        let root = self.put_tree(entries);
        self.put_commit(root)
    }

    /// Make the next `count` fetches fail with a retryable error
    pub fn fail_next_fetches(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Delay every fetch by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Fetches requested for `hash` so far
    pub fn fetch_count(&self, hash: &Hash) -> u64 {
        self.fetches.get(hash).map(|c| *c).unwrap_or(0)
    }

    pub fn total_fetches(&self) -> u64 {
        self.total_fetches.load(Ordering::SeqCst)
    }

    async fn before_fetch(&self, hash: Hash) -> Result<()> {
        *self.fetches.entry(hash).or_insert(0) += 1;
        self.total_fetches.fetch_add(1, Ordering::SeqCst);

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::Fetch(format!("injected failure fetching {}", hash)));
        }
        Ok(())
    }
}

#[async_trait]
impl BackingStore for MemoryBackingStore {
    async fn get_tree(&self, hash: Hash) -> Result<Tree> {
        self.before_fetch(hash).await?;
        self.trees
            .read()
            .get(&hash)
            .cloned()
            .ok_or(Error::ObjectMissing(hash))
    }

    async fn get_blob(&self, hash: Hash) -> Result<Blob> {
        self.before_fetch(hash).await?;
        self.blobs
            .read()
            .get(&hash)
            .map(|data| Blob::with_hash(hash, data.clone()))
            .ok_or(Error::ObjectMissing(hash))
    }

    async fn get_root_tree_hash(&self, commit: Hash) -> Result<Hash> {
        self.before_fetch(commit).await?;
        self.commits
            .read()
            .get(&commit)
            .copied()
            .ok_or(Error::ObjectMissing(commit))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip_objects() {
        let store = MemoryBackingStore::new();
        let commit = store.put_flat_commit(&[("foo.txt", &b"hello"[..])]);

        let root = store.get_root_tree_hash(commit).await.unwrap();
        let tree = store.get_tree(root).await.unwrap();
        let entry = tree.get("foo.txt").unwrap();
        let blob = store.get_blob(entry.hash).await.unwrap();
        assert_eq!(&blob.data()[..], b"hello");
    }

    #[tokio::test]
    async fn test_missing_object() {
        let store = MemoryBackingStore::new();
        let err = store.get_blob(Hash::of(b"nope")).await.unwrap_err();
        assert!(matches!(err, Error::ObjectMissing(_)));
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = MemoryBackingStore::new();
        let hash = store.put_blob(b"x".to_vec());
        store.fail_next_fetches(1);

        assert!(store.get_blob(hash).await.unwrap_err().is_retryable());
        assert!(store.get_blob(hash).await.is_ok());
        assert_eq!(store.fetch_count(&hash), 2);
    }
}
