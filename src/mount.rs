//! Mount runtime
//!
//! Owns the overlay, object store, journal and root inode of one mounted
//! working copy and exposes the operations the kernel bridge calls.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::inodes::{
    DirContents, GenerationSource, Inode, InodeMap, InodeNumber, Location, MountGeneration,
    TreeInode,
};
use crate::journal::Journal;
use crate::model::{split_path, Hash, Tree};
use crate::overlay::{Overlay, Timestamps};
use crate::store::{DirBackingStore, ObjectStore};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{error, info, warn};

/// Journal database name inside the overlay directory
pub const JOURNAL_DIR: &str = "journal";

/// State shared by every inode of one mount
pub struct MountContext {
    pub(crate) overlay: Overlay,
    pub(crate) store: ObjectStore,
    pub(crate) journal: Journal,
    pub(crate) inodes: InodeMap,
    /// Serializes renames so ancestry checks stay valid while locking
    pub(crate) rename_lock: Mutex<()>,
    generation: MountGeneration,
    snapshot: RwLock<Hash>,
    last_checkout: RwLock<SystemTime>,
    uid: u32,
    gid: u32,
}

impl MountContext {
    pub fn generation(&self) -> MountGeneration {
        self.generation
    }

    /// Snapshot the mount is currently based on
    pub fn snapshot(&self) -> Hash {
        *self.snapshot.read()
    }

    /// Time reported for inodes that were never modified
    pub fn last_checkout(&self) -> SystemTime {
        *self.last_checkout.read()
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    /// Append a local-change delta. The mutation itself has already been
    /// applied, so a journal failure is not returned to the caller; the
    /// journal poisons itself instead, and readers get `JournalCorrupt`
    /// until it is repaired.
    pub(crate) fn record_change(&self, changed_paths: Vec<String>) {
        if let Err(e) = self.journal.record_change(self.snapshot(), changed_paths) {
            error!("Failed to journal change: {}", e);
        }
    }
}

/// Mount settings not owned by a subsystem
#[derive(Debug, Clone)]
pub struct MountOptions {
    pub uid: u32,
    pub gid: u32,
    /// Journal retention (0 keeps every delta)
    pub journal_max_deltas: usize,
}

impl Default for MountOptions {
    fn default() -> Self {
        MountOptions {
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            journal_max_deltas: crate::config::DEFAULT_JOURNAL_RETENTION,
        }
    }
}

impl From<&Config> for MountOptions {
    fn from(config: &Config) -> Self {
        MountOptions {
            uid: config.mount.uid,
            gid: config.mount.gid,
            journal_max_deltas: config.journal.max_deltas,
        }
    }
}

/// Read-only view of a mount's state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountStatus {
    pub generation: u64,
    pub snapshot: String,
    pub root_materialized: bool,
    pub journal_length: u64,
    pub journal_latest: Option<u64>,
    pub journal_corrupt: bool,
    pub journal_subscribers: usize,
    pub loaded_inodes: usize,
    pub next_inode: u64,
    pub backing_fetches: u64,
    pub tree_cache_hits: u64,
    pub blob_cache_hits: u64,
}

/// One mounted working copy
pub struct MountRuntime {
    ctx: Arc<MountContext>,
    root: Arc<TreeInode>,
}

impl MountRuntime {
    /// Mount `snapshot` with local state in `overlay_dir`.
    ///
    /// The root comes from the overlay when it has a root record, otherwise
    /// from the snapshot's root tree. A damaged root record, a corrupt
    /// journal or an unresolvable snapshot fail with
    /// `Error::Initialization`.
    pub async fn initialize(
        snapshot: Hash,
        overlay_dir: &Path,
        store: ObjectStore,
        generations: &GenerationSource,
        options: MountOptions,
    ) -> Result<Self> {
        let overlay = Overlay::open(overlay_dir).map_err(|e| {
            Error::Initialization(format!("cannot open overlay {:?}: {}", overlay_dir, e))
        })?;

        let journal = Journal::open(&overlay_dir.join(JOURNAL_DIR), options.journal_max_deltas)
            .map_err(|e| Error::Initialization(format!("cannot open journal: {}", e)))?;
        if journal.is_corrupt() {
            return Err(Error::Initialization(
                "journal is corrupt and must be repaired before mounting".to_string(),
            ));
        }

        let root_record = overlay
            .load_root_dir()
            .map_err(|e| Error::Initialization(format!("root overlay record: {}", e)))?;

        let root_tree = store
            .get_root_tree_hash(snapshot)
            .await
            .map_err(|e| Error::Initialization(format!("cannot resolve snapshot {}: {}", snapshot, e)))?;

        let now = SystemTime::now();
        let ctx = Arc::new(MountContext {
            overlay,
            store,
            journal,
            inodes: InodeMap::new(),
            rename_lock: Mutex::new(()),
            generation: generations.next(),
            snapshot: RwLock::new(snapshot),
            last_checkout: RwLock::new(now),
            uid: options.uid,
            gid: options.gid,
        });

        let contents = match root_record {
            Some(record) => {
                info!("Mounting from overlay root ({} entries)", record.entries.len());
                DirContents::materialized(record)
            }
            None => {
                info!("Mounting snapshot {} (root tree {})", snapshot, root_tree);
                DirContents::unmaterialized(root_tree, Timestamps::at(now))
            }
        };
        let root = Arc::new(TreeInode::new(
            InodeNumber::ROOT,
            ctx.clone(),
            Location::root(),
            contents,
        ));
        ctx.inodes.insert(&Inode::Directory(root.clone()));

        match ctx.journal.ensure_snapshot(snapshot) {
            Ok(Some(sequence)) => info!("Journal at snapshot {} (sequence {})", snapshot, sequence),
            Ok(None) => {}
            Err(e) => return Err(Error::Initialization(format!("cannot journal snapshot: {}", e))),
        }

        info!("Mount initialized with generation {}", ctx.generation);
        Ok(MountRuntime { ctx, root })
    }

    /// Mount the configured snapshot over the configured object directory
    pub async fn from_config(config: &Config, generations: &GenerationSource) -> Result<Self> {
        config.ensure_directories()?;
        let backing = DirBackingStore::open(&config.store.backing_dir)?;
        let store = ObjectStore::from_config(Arc::new(backing), &config.store)?;
        Self::initialize(
            config.snapshot_id()?,
            &config.overlay_dir,
            store,
            generations,
            MountOptions::from(config),
        )
        .await
    }

    pub fn context(&self) -> &Arc<MountContext> {
        &self.ctx
    }

    pub fn generation(&self) -> MountGeneration {
        self.ctx.generation
    }

    pub fn snapshot(&self) -> Hash {
        self.ctx.snapshot()
    }

    pub fn journal(&self) -> &Journal {
        &self.ctx.journal
    }

    pub fn store(&self) -> &ObjectStore {
        &self.ctx.store
    }

    pub fn overlay(&self) -> &Overlay {
        &self.ctx.overlay
    }

    pub fn get_root_inode(&self) -> Arc<TreeInode> {
        self.root.clone()
    }

    /// Backing tree of the root. A materialized root has diverged from its
    /// tree, so the current snapshot's root tree is returned instead.
    pub async fn get_root_tree(&self) -> Result<Arc<Tree>> {
        match self.root.tree_hash() {
            Some(hash) => self.ctx.store.get_tree(hash).await,
            None => self.ctx.store.get_tree_for_commit(self.snapshot()).await,
        }
    }

    /// Walk `path` from the root, loading directories on the way
    pub async fn resolve_inode(&self, path: &str) -> Result<Inode> {
        let mut current = Inode::Directory(self.root.clone());
        for component in split_path(path)? {
            let dir = current.as_directory()?.clone();
            current = dir.lookup_child(component).await?;
        }
        Ok(current)
    }

    /// Loaded inode by number
    pub fn get_inode(&self, ino: InodeNumber) -> Result<Inode> {
        self.ctx
            .inodes
            .get(ino)
            .ok_or_else(|| Error::NotFound(format!("{:?} is not loaded", ino)))
    }

    /// Loaded inode by number, for a reference minted under `generation`
    pub fn get_inode_checked(&self, ino: InodeNumber, generation: u64) -> Result<Inode> {
        self.ctx.generation.check(generation)?;
        self.get_inode(ino)
    }

    /// Discard all local changes and move the mount to `snapshot`.
    ///
    /// Every previously loaded inode is detached. Handles that still hold
    /// one keep working but nothing they do is persisted.
    pub async fn reset_to_snapshot(&self, snapshot: Hash) -> Result<()> {
        let root_hash = self.ctx.store.get_root_tree_hash(snapshot).await?;
        let tree = self.ctx.store.get_tree(root_hash).await?;

        let previous = {
            let _rename_guard = self.ctx.rename_lock.lock();
            *self.ctx.last_checkout.write() = SystemTime::now();
            // Detaching first moves data of open files out of the records
            self.root.reset_to_tree(&tree);
            self.ctx.overlay.clear()?;
            std::mem::replace(&mut *self.ctx.snapshot.write(), snapshot)
        };
        let pruned = self.ctx.inodes.prune();

        self.ctx.journal.add_delta(Some(previous), snapshot, Vec::new())?;
        info!(
            "Reset from {} to {} ({} stale inodes dropped)",
            previous, snapshot, pruned
        );
        Ok(())
    }

    pub fn status(&self) -> MountStatus {
        let journal = &self.ctx.journal;
        let stats = self.ctx.store.stats();
        MountStatus {
            generation: self.ctx.generation.get(),
            snapshot: self.snapshot().to_hex(),
            root_materialized: self.root.is_materialized(),
            journal_length: journal.len(),
            journal_latest: journal.latest_sequence(),
            journal_corrupt: journal.is_corrupt(),
            journal_subscribers: journal.subscriber_count(),
            loaded_inodes: self.ctx.inodes.loaded_count(),
            next_inode: self.ctx.overlay.next_inode_number().get(),
            backing_fetches: stats.backing_fetches,
            tree_cache_hits: stats.trees.hits,
            blob_cache_hits: stats.blobs.hits,
        }
    }

    /// Flush everything and record a clean close
    pub fn shutdown(&self) -> Result<()> {
        self.ctx.journal.flush()?;
        self.ctx.store.flush()?;
        self.ctx.overlay.close()?;
        info!("Mount {} shut down", self.ctx.generation);
        Ok(())
    }
}

impl Drop for MountRuntime {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("Unclean mount shutdown: {}", e);
        }
    }
}
