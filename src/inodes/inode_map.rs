//! Inode number to live inode lookup
//!
//! The map holds weak references only. Inodes are owned by their parent
//! directory (the root by the mount), so an entry goes stale once nothing
//! else keeps the inode alive.

use super::{FileInode, Inode, InodeNumber, TreeInode};
use dashmap::DashMap;
use std::sync::Weak;

#[derive(Clone)]
enum WeakInode {
    Directory(Weak<TreeInode>),
    File(Weak<FileInode>),
    Symlink(Weak<FileInode>),
}

impl WeakInode {
    fn upgrade(&self) -> Option<Inode> {
        match self {
            WeakInode::Directory(dir) => dir.upgrade().map(Inode::Directory),
            WeakInode::File(file) => file.upgrade().map(Inode::File),
            WeakInode::Symlink(link) => link.upgrade().map(Inode::Symlink),
        }
    }
}

impl From<&Inode> for WeakInode {
    fn from(inode: &Inode) -> Self {
        match inode {
            Inode::Directory(dir) => WeakInode::Directory(std::sync::Arc::downgrade(dir)),
            Inode::File(file) => WeakInode::File(std::sync::Arc::downgrade(file)),
            Inode::Symlink(link) => WeakInode::Symlink(std::sync::Arc::downgrade(link)),
        }
    }
}

#[derive(Default)]
pub struct InodeMap {
    inodes: DashMap<InodeNumber, WeakInode>,
}

impl InodeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, inode: &Inode) {
        self.inodes.insert(inode.ino(), WeakInode::from(inode));
    }

    /// Live inode for `ino`, if it is still loaded
    pub fn get(&self, ino: InodeNumber) -> Option<Inode> {
        let inode = self.inodes.get(&ino)?.upgrade();
        if inode.is_none() {
            self.inodes.remove_if(&ino, |_, weak| weak.upgrade().is_none());
        }
        inode
    }

    pub fn remove(&self, ino: InodeNumber) {
        self.inodes.remove(&ino);
    }

    /// Entries, including stale ones not yet pruned
    pub fn len(&self) -> usize {
        self.inodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inodes.is_empty()
    }

    /// Inodes still alive
    pub fn loaded_count(&self) -> usize {
        self.inodes
            .iter()
            .filter(|entry| entry.value().upgrade().is_some())
            .count()
    }

    /// Drop stale entries. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let before = self.inodes.len();
        self.inodes.retain(|_, weak| weak.upgrade().is_some());
        before.saturating_sub(self.inodes.len())
    }

    pub fn clear(&self) {
        self.inodes.clear();
    }
}
