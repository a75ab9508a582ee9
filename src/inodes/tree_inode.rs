//! Directory inodes
//!
//! A directory is either unmaterialized (identical to a backing tree, known
//! by its hash) or materialized (its full listing lives in the overlay).
//! Children are loaded on first traversal, from the backing tree or the
//! overlay record, and stay loaded for the life of the mount.
//!
//! Lock order: a directory's contents lock before any child's lock, and
//! location locks last. Object store fetches never happen under a lock.

use super::file_inode::FileState;
use super::inode::{
    propagate_materialization, InodeAttributes, Location, LocationExt, DIR_BLOCK_SIZE,
};
use super::{FileInode, Inode, InodeNumber};
use crate::error::{Error, Result};
use crate::model::{join_path, validate_name, EntryKind, Hash, Tree};
use crate::mount::MountContext;
use crate::overlay::{OverlayDir, OverlayDirEntry, OverlayEntry, OverlayFile, Timestamps};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// One child slot of a loaded directory
#[derive(Clone)]
pub(crate) struct DirEntry {
    pub kind: EntryKind,
    pub ino: InodeNumber,
    /// Backing hash while the child is unmaterialized
    pub hash: Option<Hash>,
    /// Last backing hash the child had
    pub origin: Option<Hash>,
    /// Live inode, once the child has been looked up
    pub inode: Option<Inode>,
}

/// Children load state
pub(crate) enum LoadState {
    Unloaded,
    Loaded(BTreeMap<String, DirEntry>),
}

pub(crate) struct DirContents {
    /// Backing tree while unmaterialized. Materialized directories are
    /// always loaded.
    pub tree_hash: Option<Hash>,
    pub state: LoadState,
    pub times: Timestamps,
}

impl DirContents {
    pub fn unmaterialized(tree_hash: Hash, times: Timestamps) -> Self {
        DirContents {
            tree_hash: Some(tree_hash),
            state: LoadState::Unloaded,
            times,
        }
    }

    pub fn materialized(record: OverlayDir) -> Self {
        let entries = record
            .entries
            .into_iter()
            .map(|(name, entry)| {
                (
                    name,
                    DirEntry {
                        kind: entry.kind,
                        ino: entry.ino,
                        hash: entry.hash,
                        origin: entry.origin,
                        inode: None,
                    },
                )
            })
            .collect();
        DirContents {
            tree_hash: None,
            state: LoadState::Loaded(entries),
            times: record.times,
        }
    }

    fn entries(&self) -> Result<&BTreeMap<String, DirEntry>> {
        match &self.state {
            LoadState::Loaded(entries) => Ok(entries),
            LoadState::Unloaded => Err(Error::Internal("directory not loaded".to_string())),
        }
    }

    fn entries_mut(&mut self) -> Result<&mut BTreeMap<String, DirEntry>> {
        match &mut self.state {
            LoadState::Loaded(entries) => Ok(entries),
            LoadState::Unloaded => Err(Error::Internal("directory not loaded".to_string())),
        }
    }

    fn is_empty(&self) -> bool {
        match &self.state {
            LoadState::Loaded(entries) => entries.is_empty(),
            LoadState::Unloaded => false,
        }
    }

    fn to_record(&self) -> Result<OverlayEntry> {
        let entries = self
            .entries()?
            .iter()
            .map(|(name, entry)| {
                (
                    name.clone(),
                    OverlayDirEntry {
                        kind: entry.kind,
                        ino: entry.ino,
                        hash: entry.hash,
                        origin: entry.origin,
                    },
                )
            })
            .collect();
        Ok(OverlayEntry::Directory(OverlayDir {
            entries,
            times: self.times,
        }))
    }
}

/// Entry returned by [`TreeInode::list_children`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirListEntry {
    pub name: String,
    pub ino: InodeNumber,
    pub kind: EntryKind,
}

pub struct TreeInode {
    ino: InodeNumber,
    ctx: Arc<MountContext>,
    location: RwLock<Location>,
    contents: RwLock<DirContents>,
}

impl TreeInode {
    pub(crate) fn new(
        ino: InodeNumber,
        ctx: Arc<MountContext>,
        location: Location,
        contents: DirContents,
    ) -> Self {
        TreeInode {
            ino,
            ctx,
            location: RwLock::new(location),
            contents: RwLock::new(contents),
        }
    }

    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    /// Backing tree hash while unmaterialized
    pub fn tree_hash(&self) -> Option<Hash> {
        self.contents.read().tree_hash
    }

    pub fn is_materialized(&self) -> bool {
        self.tree_hash().is_none()
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.contents.read().state, LoadState::Loaded(_))
    }

    pub fn path(&self) -> Option<String> {
        self.location.path()
    }

    pub(crate) fn location(&self) -> &RwLock<Location> {
        &self.location
    }

    /// Containing directory, None for the root and unlinked directories
    pub fn parent_ino(&self) -> Option<InodeNumber> {
        self.location.parent_and_name().map(|(parent, _)| parent.ino)
    }

    pub fn get_attributes(&self) -> InodeAttributes {
        let times = self.contents.read().times;
        InodeAttributes {
            ino: self.ino,
            kind: EntryKind::Directory,
            size: DIR_BLOCK_SIZE,
            perm: EntryKind::Directory.default_perm(),
            nlink: if self.location.read().unlinked { 0 } else { 2 },
            uid: self.ctx.uid(),
            gid: self.ctx.gid(),
            times,
        }
    }

    /// Load children from the backing tree if not loaded yet
    pub async fn ensure_loaded(&self) -> Result<()> {
        loop {
            let tree_hash = {
                let contents = self.contents.read();
                match (&contents.state, contents.tree_hash) {
                    (LoadState::Loaded(_), _) => return Ok(()),
                    (LoadState::Unloaded, Some(hash)) => hash,
                    (LoadState::Unloaded, None) => {
                        return Err(Error::Internal(format!(
                            "materialized directory {:?} is not loaded",
                            self.ino
                        )))
                    }
                }
            };

            let tree = self.ctx.store.get_tree(tree_hash).await?;

            let mut contents = self.contents.write();
            if matches!(contents.state, LoadState::Loaded(_)) {
                return Ok(());
            }
            if contents.tree_hash != Some(tree_hash) {
                continue;
            }
            contents.state = LoadState::Loaded(self.entries_from_tree(&tree));
            debug!("Loaded {:?} with {} entries from {}", self.ino, tree.len(), tree_hash);
            return Ok(());
        }
    }

    fn entries_from_tree(&self, tree: &Tree) -> BTreeMap<String, DirEntry> {
        tree.entries()
            .iter()
            .map(|entry| {
                (
                    entry.name.clone(),
                    DirEntry {
                        kind: entry.kind,
                        ino: self.ctx.overlay.allocate_inode_number(),
                        hash: Some(entry.hash),
                        origin: Some(entry.hash),
                        inode: None,
                    },
                )
            })
            .collect()
    }

    /// Merged view of the directory's children, sorted by name
    pub async fn list_children(&self) -> Result<Vec<DirListEntry>> {
        self.ensure_loaded().await?;
        let contents = self.contents.read();
        Ok(contents
            .entries()?
            .iter()
            .map(|(name, entry)| DirListEntry {
                name: name.clone(),
                ino: entry.ino,
                kind: entry.kind,
            })
            .collect())
    }

    /// Look up (and instantiate, if needed) the child called `name`
    pub async fn lookup_child(self: &Arc<Self>, name: &str) -> Result<Inode> {
        self.ensure_loaded().await?;

        {
            let contents = self.contents.read();
            match contents.entries()?.get(name) {
                None => return Err(self.not_found(name)),
                Some(DirEntry {
                    inode: Some(inode), ..
                }) => return Ok(inode.clone()),
                Some(_) => {}
            }
        }

        let mut contents = self.contents.write();
        let times = contents.times;
        let entry = match contents.entries_mut()?.get_mut(name) {
            Some(entry) => entry,
            None => return Err(self.not_found(name)),
        };
        if let Some(inode) = &entry.inode {
            return Ok(inode.clone());
        }

        let (inode, reverted) = self.instantiate_child(name, entry, times)?;
        entry.inode = Some(inode.clone());
        self.ctx.inodes.insert(&inode);

        if reverted {
            if let Err(e) = self.persist(&mut contents) {
                warn!("Failed to record revert of {:?}/{}: {}", self.ino, name, e);
            }
        }
        Ok(inode)
    }

    /// Build the inode for `entry`. Returns true if a damaged overlay
    /// record was reverted to the entry's backing hash.
    fn instantiate_child(
        self: &Arc<Self>,
        name: &str,
        entry: &mut DirEntry,
        parent_times: Timestamps,
    ) -> Result<(Inode, bool)> {
        let checkout = Timestamps::at(self.ctx.last_checkout());

        if let Some(hash) = entry.hash {
            return Ok((self.unmaterialized_child(name, entry.kind, entry.ino, hash, checkout), false));
        }

        let problem = match self.ctx.overlay.load_entry(entry.ino) {
            Ok(Some(OverlayEntry::Directory(record))) if entry.kind.is_dir() => {
                let dir = TreeInode::new(
                    entry.ino,
                    self.ctx.clone(),
                    Location::child(self, name),
                    DirContents::materialized(record),
                );
                return Ok((Inode::Directory(Arc::new(dir)), false));
            }
            Ok(Some(OverlayEntry::File(record))) if !entry.kind.is_dir() => {
                match self.ctx.overlay.data_len(entry.ino) {
                    Ok(Some(size)) => {
                        let state = FileState::materialized(size, record);
                        return Ok((self.file_child(name, entry.kind, entry.ino, state), false));
                    }
                    Ok(None) => "data file is missing".to_string(),
                    Err(e) => e.to_string(),
                }
            }
            Ok(Some(record)) => format!("record is a {}", record.kind_name()),
            Ok(None) => "record is missing".to_string(),
            Err(e) => e.to_string(),
        };

        error!(
            "Overlay record for {:?} ({}) in {:?} is unusable: {}",
            entry.ino, name, self.ino, problem
        );

        match entry.origin {
            Some(origin) => {
                if let Err(e) = self.ctx.overlay.delete_entry(entry.ino) {
                    warn!("Failed to remove damaged record {:?}: {}", entry.ino, e);
                }
                entry.hash = Some(origin);
                warn!("Reverted {:?} ({}) to backing {}", entry.ino, name, origin);
                Ok((self.unmaterialized_child(name, entry.kind, entry.ino, origin, checkout), true))
            }
            None => {
                // Created locally, nothing to revert to: start over empty
                let record = if entry.kind.is_dir() {
                    OverlayEntry::Directory(OverlayDir {
                        entries: BTreeMap::new(),
                        times: parent_times,
                    })
                } else {
                    self.ctx.overlay.create_data(entry.ino, false, &[])?;
                    OverlayEntry::File(OverlayFile {
                        times: parent_times,
                    })
                };
                self.ctx.overlay.save_entry(entry.ino, &record)?;
                warn!("Replaced {:?} ({}) with an empty {}", entry.ino, name, record.kind_name());
                Ok((self.child_from_record(name, entry.kind, entry.ino, record, 0), false))
            }
        }
    }

    fn unmaterialized_child(
        self: &Arc<Self>,
        name: &str,
        kind: EntryKind,
        ino: InodeNumber,
        hash: Hash,
        times: Timestamps,
    ) -> Inode {
        if kind.is_dir() {
            Inode::Directory(Arc::new(TreeInode::new(
                ino,
                self.ctx.clone(),
                Location::child(self, name),
                DirContents::unmaterialized(hash, times),
            )))
        } else {
            self.file_child(name, kind, ino, FileState::unmaterialized(hash, times))
        }
    }

    /// `size` is the length of a file's data file
    fn child_from_record(
        self: &Arc<Self>,
        name: &str,
        kind: EntryKind,
        ino: InodeNumber,
        record: OverlayEntry,
        size: u64,
    ) -> Inode {
        match record {
            OverlayEntry::Directory(dir) => Inode::Directory(Arc::new(TreeInode::new(
                ino,
                self.ctx.clone(),
                Location::child(self, name),
                DirContents::materialized(dir),
            ))),
            OverlayEntry::File(file) => {
                self.file_child(name, kind, ino, FileState::materialized(size, file))
            }
        }
    }

    fn file_child(
        self: &Arc<Self>,
        name: &str,
        kind: EntryKind,
        ino: InodeNumber,
        state: FileState,
    ) -> Inode {
        let file = Arc::new(FileInode::new(
            ino,
            kind,
            self.ctx.clone(),
            Location::child(self, name),
            state,
        ));
        if kind.is_symlink() {
            Inode::Symlink(file)
        } else {
            Inode::File(file)
        }
    }

    /// Create an empty file, executable or directory called `name`
    pub async fn create_child(self: &Arc<Self>, name: &str, kind: EntryKind) -> Result<Inode> {
        if kind.is_symlink() {
            return Err(Error::InvalidArgument(
                "symlinks need a target, use symlink()".to_string(),
            ));
        }
        self.add_child(name, kind, Vec::new()).await
    }

    pub async fn mkdir(self: &Arc<Self>, name: &str) -> Result<Arc<TreeInode>> {
        match self.add_child(name, EntryKind::Directory, Vec::new()).await? {
            Inode::Directory(dir) => Ok(dir),
            other => Err(Error::Internal(format!("mkdir produced {:?}", other))),
        }
    }

    pub async fn symlink(self: &Arc<Self>, name: &str, target: &str) -> Result<Inode> {
        self.add_child(name, EntryKind::Symlink, target.as_bytes().to_vec())
            .await
    }

    async fn add_child(
        self: &Arc<Self>,
        name: &str,
        kind: EntryKind,
        content: Vec<u8>,
    ) -> Result<Inode> {
        validate_name(name)?;
        self.ensure_loaded().await?;

        let (inode, newly_materialized) = {
            let mut contents = self.contents.write();
            let dir_path = self.live_path()?;
            if contents.entries()?.contains_key(name) {
                return Err(Error::AlreadyExists(join_path(&dir_path, name)));
            }

            let ino = self.ctx.overlay.allocate_inode_number();
            let times = Timestamps::now();
            let record = if kind.is_dir() {
                OverlayEntry::Directory(OverlayDir {
                    entries: BTreeMap::new(),
                    times,
                })
            } else {
                self.ctx.overlay.create_data(ino, false, &content)?;
                OverlayEntry::File(OverlayFile { times })
            };
            if let Err(e) = self.ctx.overlay.save_entry(ino, &record) {
                if let Err(cleanup) = self.ctx.overlay.delete_entry(ino) {
                    warn!("Failed to remove data {:?} after error: {}", ino, cleanup);
                }
                return Err(e);
            }

            let inode = self.child_from_record(name, kind, ino, record, content.len() as u64);
            contents.entries_mut()?.insert(
                name.to_string(),
                DirEntry {
                    kind,
                    ino,
                    hash: None,
                    origin: None,
                    inode: Some(inode.clone()),
                },
            );
            let prev_tree = contents.tree_hash.take();
            let prev_times = contents.times;
            contents.times.touch();

            if let Err(e) = self.persist(&mut contents) {
                contents.entries_mut()?.remove(name);
                contents.tree_hash = prev_tree;
                contents.times = prev_times;
                if let Err(cleanup) = self.ctx.overlay.delete_entry(ino) {
                    warn!("Failed to remove record {:?} after error: {}", ino, cleanup);
                }
                return Err(e);
            }

            self.ctx.inodes.insert(&inode);
            self.ctx.record_change(vec![join_path(&dir_path, name)]);
            (inode, prev_tree.is_some())
        };

        if newly_materialized {
            self.propagate()?;
        }
        Ok(inode)
    }

    /// Remove `name`, whatever its kind. Directories must be empty.
    pub async fn remove_child(self: &Arc<Self>, name: &str) -> Result<()> {
        self.remove_entry(name, None).await
    }

    /// Remove a non-directory
    pub async fn unlink(self: &Arc<Self>, name: &str) -> Result<()> {
        self.remove_entry(name, Some(false)).await
    }

    /// Remove an empty directory
    pub async fn rmdir(self: &Arc<Self>, name: &str) -> Result<()> {
        self.remove_entry(name, Some(true)).await
    }

    async fn remove_entry(self: &Arc<Self>, name: &str, expect_dir: Option<bool>) -> Result<()> {
        loop {
            let target = self.lookup_child(name).await?;
            match (expect_dir, &target) {
                (Some(true), inode) if !inode.is_directory() => {
                    return Err(Error::NotADirectory(self.child_path(name)))
                }
                (Some(false), Inode::Directory(_)) => {
                    return Err(Error::IsADirectory(self.child_path(name)))
                }
                _ => {}
            }
            // Emptiness is checked under lock, so the child must be loaded
            if let Inode::Directory(dir) = &target {
                dir.ensure_loaded().await?;
            }

            let newly_materialized = {
                let mut contents = self.contents.write();
                let dir_path = self.live_path()?;
                let path = join_path(&dir_path, name);
                match contents.entries()?.get(name) {
                    None => return Err(Error::NotFound(path)),
                    Some(entry) if entry.ino != target.ino() => continue,
                    Some(_) => {}
                }

                let target_contents = match &target {
                    Inode::Directory(dir) => Some(dir.contents.read()),
                    _ => None,
                };
                if let Some(child) = &target_contents {
                    if !child.is_empty() {
                        return Err(Error::DirectoryNotEmpty(path));
                    }
                }

                let removed = contents.entries_mut()?.remove(name);
                let prev_tree = contents.tree_hash.take();
                let prev_times = contents.times;
                contents.times.touch();

                if let Err(e) = self.persist(&mut contents) {
                    if let Some(removed) = removed {
                        contents.entries_mut()?.insert(name.to_string(), removed);
                    }
                    contents.tree_hash = prev_tree;
                    contents.times = prev_times;
                    return Err(e);
                }
                drop(target_contents);

                target.mark_unlinked();
                if let Err(e) = self.ctx.overlay.delete_entry(target.ino()) {
                    warn!("Failed to delete overlay record {:?}: {}", target.ino(), e);
                }
                self.ctx.record_change(vec![path]);
                prev_tree.is_some()
            };

            if newly_materialized {
                self.propagate()?;
            }
            return Ok(());
        }
    }

    /// Move `name` to `new_name` in `dest`, replacing a compatible target.
    /// Both listings change under both directory locks.
    pub async fn rename(
        self: &Arc<Self>,
        name: &str,
        dest: &Arc<TreeInode>,
        new_name: &str,
    ) -> Result<()> {
        validate_name(name)?;
        validate_name(new_name)?;

        loop {
            let source = self.lookup_child(name).await?;
            dest.ensure_loaded().await?;
            let replaced = match dest.lookup_child(new_name).await {
                Ok(inode) => Some(inode),
                Err(Error::NotFound(_)) => None,
                Err(e) => return Err(e),
            };

            if let Some(existing) = &replaced {
                if existing.ino() == source.ino() {
                    return Ok(());
                }
                // Replacing a directory that contains the source
                if let Inode::Directory(dir) = existing {
                    if Arc::ptr_eq(dir, self) || self.has_ancestor(dir.ino) {
                        return Err(Error::DirectoryNotEmpty(dest.child_path(new_name)));
                    }
                }
                match (source.is_directory(), existing) {
                    (true, existing) if !existing.is_directory() => {
                        return Err(Error::NotADirectory(dest.child_path(new_name)))
                    }
                    (false, Inode::Directory(_)) => {
                        return Err(Error::IsADirectory(dest.child_path(new_name)))
                    }
                    (true, Inode::Directory(dir)) => dir.ensure_loaded().await?,
                    _ => {}
                }
            }

            let outcome = {
                let _rename_guard = self.ctx.rename_lock.lock();

                if let Inode::Directory(moving) = &source {
                    if dest.ino == moving.ino || dest.has_ancestor(moving.ino) {
                        return Err(Error::InvalidArgument(format!(
                            "cannot move {} into itself",
                            self.child_path(name)
                        )));
                    }
                }

                if Arc::ptr_eq(self, dest) {
                    let mut contents = self.contents.write();
                    self.rename_locked(&mut contents, dest, None, name, new_name, &source, &replaced)?
                } else if dest.has_ancestor(self.ino) {
                    let mut src = self.contents.write();
                    let mut dst = dest.contents.write();
                    self.rename_locked(&mut src, dest, Some(&mut *dst), name, new_name, &source, &replaced)?
                } else {
                    let mut dst = dest.contents.write();
                    let mut src = self.contents.write();
                    self.rename_locked(&mut src, dest, Some(&mut *dst), name, new_name, &source, &replaced)?
                }
            };

            let Some((src_newly, dst_newly)) = outcome else {
                continue;
            };
            if dst_newly {
                dest.propagate()?;
            }
            if src_newly && !Arc::ptr_eq(self, dest) {
                self.propagate()?;
            }
            return Ok(());
        }
    }

    /// Rename with the needed directory locks held. `dst` is None when the
    /// source and destination directory are the same. Returns None if the
    /// entries changed since they were looked up.
    #[allow(clippy::too_many_arguments)]
    fn rename_locked(
        &self,
        src: &mut DirContents,
        dest: &Arc<TreeInode>,
        mut dst: Option<&mut DirContents>,
        name: &str,
        new_name: &str,
        source: &Inode,
        replaced: &Option<Inode>,
    ) -> Result<Option<(bool, bool)>> {
        let from_path = join_path(&self.live_path()?, name);
        let to_path = join_path(&dest.live_path()?, new_name);

        match src.entries()?.get(name) {
            Some(entry) if entry.ino == source.ino() => {}
            Some(_) => return Ok(None),
            None => return Err(Error::NotFound(from_path)),
        }
        let current_target = target(src, &mut dst).entries()?.get(new_name).map(|e| e.ino);
        if current_target != replaced.as_ref().map(Inode::ino) {
            return Ok(None);
        }

        let replaced_contents = match replaced {
            Some(Inode::Directory(dir)) => Some(dir.contents.read()),
            _ => None,
        };
        if let Some(existing) = &replaced_contents {
            if !existing.is_empty() {
                return Err(Error::DirectoryNotEmpty(to_path));
            }
        }

        let moved = src
            .entries_mut()?
            .remove(name)
            .ok_or_else(|| Error::Internal("rename source vanished".to_string()))?;
        let displaced = target(src, &mut dst)
            .entries_mut()?
            .insert(new_name.to_string(), moved);

        let src_prev = (src.tree_hash.take(), src.times);
        src.times.touch();
        let dst_prev = dst.as_deref_mut().map(|d| {
            let prev = (d.tree_hash.take(), d.times);
            d.times.touch();
            prev
        });

        let restore = |src: &mut DirContents, mut dst: Option<&mut DirContents>| -> Result<()> {
            let target_dir = target(&mut *src, &mut dst);
            let moved = target_dir.entries_mut()?.remove(new_name);
            if let Some(displaced) = displaced.clone() {
                target_dir
                    .entries_mut()?
                    .insert(new_name.to_string(), displaced);
            }
            if let Some(moved) = moved {
                src.entries_mut()?.insert(name.to_string(), moved);
            }
            (src.tree_hash, src.times) = src_prev;
            if let (Some(d), Some(prev)) = (dst, dst_prev) {
                (d.tree_hash, d.times) = prev;
            }
            Ok(())
        };

        // Either directory may be the parent of the other, and its lock is
        // already held here
        match dst.as_deref_mut() {
            Some(d) => {
                if let Err(e) = dest.persist_with(&mut *d, Some(self.ino)) {
                    restore(&mut *src, Some(&mut *d))?;
                    return Err(e);
                }
                if let Err(e) = self.persist_with(&mut *src, Some(dest.ino)) {
                    restore(&mut *src, Some(&mut *d))?;
                    if let Err(again) = dest.persist_with(&mut *d, Some(self.ino)) {
                        error!("Failed to restore {:?} after rename error: {}", dest.ino, again);
                    }
                    return Err(e);
                }
            }
            None => {
                if let Err(e) = self.persist(&mut *src) {
                    restore(&mut *src, None)?;
                    return Err(e);
                }
            }
        }
        drop(replaced_contents);

        {
            let mut location = source.location().write();
            location.name = new_name.to_string();
            location.parent = Some(Arc::downgrade(dest));
        }
        if let Some(replaced) = replaced {
            replaced.mark_unlinked();
            if let Err(e) = self.ctx.overlay.delete_entry(replaced.ino()) {
                warn!("Failed to delete overlay record {:?}: {}", replaced.ino(), e);
            }
        }

        self.ctx.record_change(vec![from_path, to_path]);
        let src_newly = src_prev.0.is_some();
        let dst_newly = dst_prev.map(|p| p.0.is_some()).unwrap_or(src_newly);
        Ok(Some((src_newly, dst_newly)))
    }

    /// Whether `ancestor` is this directory's parent, grandparent, ...
    fn has_ancestor(&self, ancestor: InodeNumber) -> bool {
        let mut current = self.location.parent_and_name().map(|(p, _)| p);
        while let Some(dir) = current {
            if dir.ino == ancestor {
                return true;
            }
            current = dir.location.parent_and_name().map(|(p, _)| p);
        }
        false
    }

    /// Record that child `name` (inode `child`) was materialized. This
    /// directory materializes too if needed, continuing upward.
    pub(crate) fn child_materialized(&self, name: &str, child: InodeNumber) -> Result<()> {
        let newly_materialized = {
            let mut contents = self.contents.write();
            let tree_hash = contents.tree_hash;
            let entry = match contents.entries_mut() {
                Ok(entries) => match entries.get_mut(name) {
                    Some(entry) if entry.ino == child => entry,
                    // Renamed or removed meanwhile
                    _ => return Ok(()),
                },
                Err(_) => return Ok(()),
            };
            if entry.hash.is_none() && tree_hash.is_none() {
                return Ok(());
            }

            let prev_hash = entry.hash.take();
            let prev_tree = contents.tree_hash.take();
            if let Err(e) = self.persist(&mut contents) {
                if let Ok(entries) = contents.entries_mut() {
                    if let Some(entry) = entries.get_mut(name) {
                        entry.hash = prev_hash;
                    }
                }
                contents.tree_hash = prev_tree;
                return Err(e);
            }
            if prev_tree.is_some() {
                debug!("Materialized directory {:?}", self.ino);
            }
            prev_tree.is_some()
        };

        if newly_materialized {
            self.propagate()?;
        }
        Ok(())
    }

    fn propagate(&self) -> Result<()> {
        propagate_materialization(&self.location, self.ino)
    }

    /// Save the listing to the overlay. Unlinked directories are not
    /// persisted.
    ///
    /// Entry hashes are kept current by `child_materialized`; no child lock
    /// is taken here, since callers may hold locks further down the tree.
    fn persist(&self, contents: &mut DirContents) -> Result<()> {
        self.persist_with(contents, None)
    }

    /// Like `persist`, but `locked` names a child directory that is being
    /// materialized under a lock the caller holds, before it can report
    /// itself through `child_materialized`.
    fn persist_with(&self, contents: &mut DirContents, locked: Option<InodeNumber>) -> Result<()> {
        if self.location.read().unlinked {
            return Ok(());
        }
        if let Some(locked) = locked {
            for entry in contents.entries_mut()?.values_mut() {
                if entry.ino == locked {
                    entry.hash = None;
                }
            }
        }
        self.ctx.overlay.save_entry(self.ino, &contents.to_record()?)
    }

    /// Point this (root) directory at a new backing tree, dropping every
    /// loaded child. Dropped inodes stay usable through open handles but
    /// are unlinked.
    pub(crate) fn reset_to_tree(&self, tree: &Tree) {
        let mut contents = self.contents.write();
        if let LoadState::Loaded(entries) = &contents.state {
            for entry in entries.values() {
                if let Some(inode) = &entry.inode {
                    detach(inode);
                }
            }
        }
        contents.tree_hash = Some(tree.hash());
        contents.state = LoadState::Loaded(self.entries_from_tree(tree));
        contents.times = Timestamps::at(self.ctx.last_checkout());
    }

    fn live_path(&self) -> Result<String> {
        self.location
            .path()
            .ok_or_else(|| Error::NotFound(format!("{:?} was removed", self.ino)))
    }

    fn child_path(&self, name: &str) -> String {
        join_path(&self.path().unwrap_or_default(), name)
    }

    fn not_found(&self, name: &str) -> Error {
        Error::NotFound(self.child_path(name))
    }
}

/// Mark `inode` and every loaded descendant unlinked
fn detach(inode: &Inode) {
    inode.mark_unlinked();
    if let Inode::Directory(dir) = inode {
        let contents = dir.contents.read();
        if let LoadState::Loaded(entries) = &contents.state {
            for entry in entries.values() {
                if let Some(child) = &entry.inode {
                    detach(child);
                }
            }
        }
    }
}

fn target<'a>(
    src: &'a mut DirContents,
    dst: &'a mut Option<&mut DirContents>,
) -> &'a mut DirContents {
    match dst {
        Some(dst) => &mut **dst,
        None => src,
    }
}
