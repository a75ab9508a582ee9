//! Content-addressed object store
//!
//! Resolves hashes to trees and blobs through three tiers:
//! - in-memory LRU caches (bounded by bytes)
//! - an optional persistent local store (sled)
//! - the backing store, fetched with a concurrency limit, a per-attempt
//!   timeout and bounded retries for transient failures
//!
//! Concurrent requests for the same object share one in-flight fetch.

mod backing;
mod cache;
mod compression;
mod dir;
mod limit;
mod local;
mod lru;
mod memory;

pub use backing::BackingStore;
pub use cache::{CacheStats, ObjectCache, Weighted};
pub use compression::{compress, decompress};
pub use dir::DirBackingStore;
pub use limit::{ExponentialBackoff, FetchLimiter};
pub use local::LocalStore;
pub use lru::LruCache;
pub use memory::MemoryBackingStore;

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::model::{Blob, Hash, Tree};
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Fetch behaviour for backing store requests
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    /// Maximum concurrent backing fetches
    pub parallelism: usize,
    /// Timeout for one attempt
    pub timeout: Duration,
    /// Extra attempts after a retryable failure
    pub retry_attempts: u32,
    /// First backoff delay (ms)
    pub retry_base_delay_ms: u64,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        FetchPolicy {
            parallelism: crate::config::DEFAULT_FETCH_PARALLELISM,
            timeout: Duration::from_millis(crate::config::DEFAULT_FETCH_TIMEOUT_MS),
            retry_attempts: 3,
            retry_base_delay_ms: 100,
        }
    }
}

impl From<&StoreConfig> for FetchPolicy {
    fn from(config: &StoreConfig) -> Self {
        FetchPolicy {
            parallelism: config.fetch_parallelism,
            timeout: config.fetch_timeout(),
            retry_attempts: config.retry_attempts,
            retry_base_delay_ms: config.retry_base_delay_ms,
        }
    }
}

/// Request counters, counted at the public API (cache hits included)
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub tree_requests: u64,
    pub blob_requests: u64,
    pub commit_requests: u64,
    /// Requests that reached the backing store
    pub backing_fetches: u64,
    /// Requests that joined an in-flight fetch
    pub coalesced: u64,
    pub trees: CacheStats,
    pub blobs: CacheStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ObjectKey {
    Tree(Hash),
    Blob(Hash),
    Commit(Hash),
}

#[derive(Clone)]
enum Fetched {
    Tree(Arc<Tree>),
    Blob(Blob),
    Root(Hash),
}

type SharedFetch = Shared<BoxFuture<'static, std::result::Result<Fetched, Arc<Error>>>>;

struct StoreInner {
    backing: Arc<dyn BackingStore>,
    local: Option<LocalStore>,
    trees: ObjectCache<Arc<Tree>>,
    blobs: ObjectCache<Blob>,
    in_flight: DashMap<ObjectKey, (u64, SharedFetch)>,
    limiter: FetchLimiter,
    policy: FetchPolicy,
    next_fetch_id: AtomicU64,
    tree_requests: AtomicU64,
    blob_requests: AtomicU64,
    commit_requests: AtomicU64,
    backing_fetches: AtomicU64,
    coalesced: AtomicU64,
}

/// Lazily resolves trees and blobs by hash
#[derive(Clone)]
pub struct ObjectStore {
    inner: Arc<StoreInner>,
}

impl ObjectStore {
    pub fn new(
        backing: Arc<dyn BackingStore>,
        local: Option<LocalStore>,
        policy: FetchPolicy,
        tree_cache_size: u64,
        blob_cache_size: u64,
    ) -> Self {
        ObjectStore {
            inner: Arc::new(StoreInner {
                backing,
                local,
                trees: ObjectCache::new(tree_cache_size),
                blobs: ObjectCache::new(blob_cache_size),
                in_flight: DashMap::new(),
                limiter: FetchLimiter::new(policy.parallelism),
                policy,
                next_fetch_id: AtomicU64::new(0),
                tree_requests: AtomicU64::new(0),
                blob_requests: AtomicU64::new(0),
                commit_requests: AtomicU64::new(0),
                backing_fetches: AtomicU64::new(0),
                coalesced: AtomicU64::new(0),
            }),
        }
    }

    /// Build the store described by `config` on top of `backing`
    pub fn from_config(backing: Arc<dyn BackingStore>, config: &StoreConfig) -> Result<Self> {
        let local = if config.local_cache_enabled {
            Some(LocalStore::open(
                &config.local_cache_dir,
                config.compression_threshold,
            )?)
        } else {
            None
        };
        Ok(Self::new(
            backing,
            local,
            FetchPolicy::from(config),
            config.tree_cache_size,
            config.blob_cache_size,
        ))
    }

    /// Store with default caches and no local persistence
    pub fn in_memory(backing: Arc<dyn BackingStore>, policy: FetchPolicy) -> Self {
        Self::new(
            backing,
            None,
            policy,
            crate::config::DEFAULT_TREE_CACHE_SIZE,
            crate::config::DEFAULT_BLOB_CACHE_SIZE,
        )
    }

    pub async fn get_tree(&self, hash: Hash) -> Result<Arc<Tree>> {
        self.inner.tree_requests.fetch_add(1, Ordering::Relaxed);
        if let Some(tree) = self.inner.trees.get(&hash) {
            return Ok(tree);
        }
        match self.fetch(ObjectKey::Tree(hash)).await? {
            Fetched::Tree(tree) => Ok(tree),
            _ => Err(Error::Internal(format!("tree fetch for {} returned another kind", hash))),
        }
    }

    pub async fn get_blob(&self, hash: Hash) -> Result<Blob> {
        self.inner.blob_requests.fetch_add(1, Ordering::Relaxed);
        if let Some(blob) = self.inner.blobs.get(&hash) {
            return Ok(blob);
        }
        match self.fetch(ObjectKey::Blob(hash)).await? {
            Fetched::Blob(blob) => Ok(blob),
            _ => Err(Error::Internal(format!("blob fetch for {} returned another kind", hash))),
        }
    }

    /// Root tree hash of a snapshot
    pub async fn get_root_tree_hash(&self, commit: Hash) -> Result<Hash> {
        self.inner.commit_requests.fetch_add(1, Ordering::Relaxed);
        match self.fetch(ObjectKey::Commit(commit)).await? {
            Fetched::Root(root) => Ok(root),
            _ => Err(Error::Internal(format!("commit fetch for {} returned another kind", commit))),
        }
    }

    /// Root tree of a snapshot
    pub async fn get_tree_for_commit(&self, commit: Hash) -> Result<Arc<Tree>> {
        let root = self.get_root_tree_hash(commit).await?;
        self.get_tree(root).await
    }

    pub fn stats(&self) -> StoreStats {
        let inner = &self.inner;
        StoreStats {
            tree_requests: inner.tree_requests.load(Ordering::Relaxed),
            blob_requests: inner.blob_requests.load(Ordering::Relaxed),
            commit_requests: inner.commit_requests.load(Ordering::Relaxed),
            backing_fetches: inner.backing_fetches.load(Ordering::Relaxed),
            coalesced: inner.coalesced.load(Ordering::Relaxed),
            trees: inner.trees.stats(),
            blobs: inner.blobs.stats(),
        }
    }

    /// Drop all in-memory cached objects
    pub fn clear_memory_caches(&self) {
        self.inner.trees.clear();
        self.inner.blobs.clear();
    }

    pub fn flush(&self) -> Result<()> {
        match &self.inner.local {
            Some(local) => local.flush(),
            None => Ok(()),
        }
    }

    /// Join the in-flight fetch for `key`, starting one if none is running
    async fn fetch(&self, key: ObjectKey) -> Result<Fetched> {
        let (id, fetch) = {
            let entry = self.inner.in_flight.entry(key);
            match entry {
                dashmap::mapref::entry::Entry::Occupied(e) => {
                    self.inner.coalesced.fetch_add(1, Ordering::Relaxed);
                    e.get().clone()
                }
                dashmap::mapref::entry::Entry::Vacant(e) => {
                    let id = self.inner.next_fetch_id.fetch_add(1, Ordering::Relaxed);
                    let inner = self.inner.clone();
                    let fut: BoxFuture<'static, std::result::Result<Fetched, Arc<Error>>> =
                        async move { inner.load(key).await.map_err(Arc::new) }.boxed();
                    let shared = fut.shared();
                    e.insert((id, shared.clone()));
                    (id, shared)
                }
            }
        };

        let result = fetch.await;
        self.inner.in_flight.remove_if(&key, |_, (current, _)| *current == id);
        result.map_err(|e| e.duplicate())
    }
}

impl StoreInner {
    /// Local store first, then the backing store; populates every tier
    async fn load(&self, key: ObjectKey) -> Result<Fetched> {
        // Another fetch may have completed between the caller's cache miss
        // and this fetch being registered
        match key {
            ObjectKey::Tree(hash) => {
                if let Some(tree) = self.trees.get(&hash) {
                    return Ok(Fetched::Tree(tree));
                }
            }
            ObjectKey::Blob(hash) => {
                if let Some(blob) = self.blobs.get(&hash) {
                    return Ok(Fetched::Blob(blob));
                }
            }
            ObjectKey::Commit(_) => {}
        }

        if let Some(fetched) = self.load_local(key) {
            return Ok(fetched);
        }

        self.backing_fetches.fetch_add(1, Ordering::Relaxed);
        let fetched = self.fetch_with_retry(key).await?;

        match &fetched {
            Fetched::Tree(tree) => {
                if let Some(local) = &self.local {
                    if let Err(e) = local.put_tree(tree) {
                        warn!("Failed to cache tree {} locally: {}", tree.hash(), e);
                    }
                }
                self.trees.insert(tree.hash(), tree.clone());
            }
            Fetched::Blob(blob) => {
                if let Some(local) = &self.local {
                    if let Err(e) = local.put_blob(blob) {
                        warn!("Failed to cache blob {} locally: {}", blob.hash(), e);
                    }
                }
                self.blobs.insert(blob.hash(), blob.clone());
            }
            Fetched::Root(root) => {
                if let (Some(local), ObjectKey::Commit(commit)) = (&self.local, key) {
                    if let Err(e) = local.put_commit_root(&commit, root) {
                        warn!("Failed to cache commit {} locally: {}", commit, e);
                    }
                }
            }
        }

        Ok(fetched)
    }

    fn load_local(&self, key: ObjectKey) -> Option<Fetched> {
        let local = self.local.as_ref()?;
        let found = match key {
            ObjectKey::Tree(hash) => local.get_tree(&hash).map(|t| {
                t.map(|tree| {
                    let tree = Arc::new(tree);
                    self.trees.insert(hash, tree.clone());
                    Fetched::Tree(tree)
                })
            }),
            ObjectKey::Blob(hash) => local.get_blob(&hash).map(|b| {
                b.map(|blob| {
                    self.blobs.insert(hash, blob.clone());
                    Fetched::Blob(blob)
                })
            }),
            ObjectKey::Commit(commit) => local
                .get_commit_root(&commit)
                .map(|r| r.map(Fetched::Root)),
        };

        match found {
            Ok(found) => found,
            Err(e) => {
                warn!("Local store lookup failed for {:?}: {}", key, e);
                None
            }
        }
    }

    async fn fetch_with_retry(&self, key: ObjectKey) -> Result<Fetched> {
        let mut backoff = ExponentialBackoff::new(
            self.policy.retry_base_delay_ms,
            self.policy.retry_attempts,
        )
        .with_jitter();

        loop {
            match self.fetch_once(key).await {
                Ok(fetched) => return Ok(fetched),
                Err(e) if e.is_retryable() => match backoff.next_delay() {
                    Some(delay) => {
                        debug!("Retrying {:?} in {:?} after: {}", key, delay, e);
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        warn!("Giving up on {:?}: {}", key, e);
                        return Err(e);
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_once(&self, key: ObjectKey) -> Result<Fetched> {
        let _permit = self.limiter.acquire().await?;
        debug!("Fetching {:?} from {}", key, self.backing.name());

        let request = async {
            match key {
                ObjectKey::Tree(hash) => self
                    .backing
                    .get_tree(hash)
                    .await
                    .map(|tree| Fetched::Tree(Arc::new(tree))),
                ObjectKey::Blob(hash) => self.backing.get_blob(hash).await.map(Fetched::Blob),
                ObjectKey::Commit(commit) => self
                    .backing
                    .get_root_tree_hash(commit)
                    .await
                    .map(Fetched::Root),
            }
        };

        match tokio::time::timeout(self.policy.timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(Error::Fetch(format!(
                "{:?} timed out after {:?}",
                key, self.policy.timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntryKind, TreeEntry};

    fn policy(timeout_ms: u64, retries: u32) -> FetchPolicy {
        FetchPolicy {
            parallelism: 4,
            timeout: Duration::from_millis(timeout_ms),
            retry_attempts: retries,
            retry_base_delay_ms: 1,
        }
    }

    #[tokio::test]
    async fn test_caches_after_first_fetch() {
        let backing = Arc::new(MemoryBackingStore::new());
        let hash = backing.put_blob(b"content".to_vec());
        let store = ObjectStore::in_memory(backing.clone(), policy(1000, 0));

        store.get_blob(hash).await.unwrap();
        store.get_blob(hash).await.unwrap();

        assert_eq!(backing.fetch_count(&hash), 1);
        assert_eq!(store.stats().blob_requests, 2);
    }

    #[tokio::test]
    async fn test_concurrent_fetches_coalesce() {
        let backing = Arc::new(MemoryBackingStore::new());
        let hash = backing.put_tree(vec![TreeEntry::new(
            "a",
            Hash::of(b"a"),
            EntryKind::Regular,
        )]);
        backing.set_latency(Duration::from_millis(50));
        let store = ObjectStore::in_memory(backing.clone(), policy(5000, 0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.get_tree(hash).await })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().hash(), hash);
        }

        assert_eq!(backing.fetch_count(&hash), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let backing = Arc::new(MemoryBackingStore::new());
        let hash = backing.put_blob(b"x".to_vec());
        backing.fail_next_fetches(2);
        let store = ObjectStore::in_memory(backing.clone(), policy(1000, 3));

        assert!(store.get_blob(hash).await.is_ok());
        assert_eq!(backing.fetch_count(&hash), 3);
    }

    #[tokio::test]
    async fn test_missing_object_not_retried() {
        let backing = Arc::new(MemoryBackingStore::new());
        let store = ObjectStore::in_memory(backing.clone(), policy(1000, 3));
        let hash = Hash::of(b"gone");

        let err = store.get_tree(hash).await.unwrap_err();
        assert!(matches!(err, Error::ObjectMissing(_)));
        assert_eq!(backing.fetch_count(&hash), 1);
    }

    #[tokio::test]
    async fn test_timeout_then_recovery() {
        let backing = Arc::new(MemoryBackingStore::new());
        let hash = backing.put_blob(b"slow".to_vec());
        backing.set_latency(Duration::from_millis(200));
        let store = ObjectStore::in_memory(backing.clone(), policy(20, 0));

        let err = store.get_blob(hash).await.unwrap_err();
        assert!(err.is_retryable());

        backing.set_latency(Duration::ZERO);
        assert!(store.get_blob(hash).await.is_ok());
    }

    #[tokio::test]
    async fn test_local_store_survives_memory_clear() {
        let backing = Arc::new(MemoryBackingStore::new());
        let hash = backing.put_blob(vec![1u8; 2048]);
        let store = ObjectStore::new(
            backing.clone(),
            Some(LocalStore::temporary().unwrap()),
            policy(1000, 0),
            1 << 20,
            1 << 20,
        );

        store.get_blob(hash).await.unwrap();
        store.clear_memory_caches();
        let blob = store.get_blob(hash).await.unwrap();

        assert_eq!(blob.len(), 2048);
        assert_eq!(backing.fetch_count(&hash), 1);
    }

    #[tokio::test]
    async fn test_tree_for_commit() {
        let backing = Arc::new(MemoryBackingStore::new());
        let commit = backing.put_flat_commit(&[("foo.txt", &b"hi"[..])]);
        let store = ObjectStore::in_memory(backing, policy(1000, 0));

        let tree = store.get_tree_for_commit(commit).await.unwrap();
        assert!(tree.get("foo.txt").is_some());
    }
}
