//! The inode variant type and what all inode kinds share

use super::{FileInode, InodeNumber, TreeInode};
use crate::error::{Error, Result};
use crate::model::{EntryKind, Hash};
use crate::overlay::Timestamps;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};

/// Reported size and block size for directories
pub const DIR_BLOCK_SIZE: u64 = 4096;

/// A live inode
#[derive(Clone)]
pub enum Inode {
    Directory(Arc<TreeInode>),
    File(Arc<FileInode>),
    Symlink(Arc<FileInode>),
}

impl Inode {
    pub fn ino(&self) -> InodeNumber {
        match self {
            Inode::Directory(dir) => dir.ino(),
            Inode::File(file) | Inode::Symlink(file) => file.ino(),
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, Inode::Directory(_))
    }

    pub fn as_directory(&self) -> Result<&Arc<TreeInode>> {
        match self {
            Inode::Directory(dir) => Ok(dir),
            _ => Err(Error::NotADirectory(self.describe())),
        }
    }

    /// Regular (or executable) file
    pub fn as_file(&self) -> Result<&Arc<FileInode>> {
        match self {
            Inode::File(file) => Ok(file),
            Inode::Directory(_) => Err(Error::IsADirectory(self.describe())),
            Inode::Symlink(_) => Err(Error::InvalidArgument(format!(
                "{} is a symlink",
                self.describe()
            ))),
        }
    }

    pub fn as_symlink(&self) -> Result<&Arc<FileInode>> {
        match self {
            Inode::Symlink(link) => Ok(link),
            _ => Err(Error::InvalidArgument(format!(
                "{} is not a symlink",
                self.describe()
            ))),
        }
    }

    /// Mount-relative path, or None once unlinked
    pub fn path(&self) -> Option<String> {
        self.location().path()
    }

    /// Backing hash while unmaterialized
    pub fn backing_hash(&self) -> Option<Hash> {
        match self {
            Inode::Directory(dir) => dir.tree_hash(),
            Inode::File(file) | Inode::Symlink(file) => file.backing_hash(),
        }
    }

    pub fn is_materialized(&self) -> bool {
        self.backing_hash().is_none()
    }

    pub fn is_unlinked(&self) -> bool {
        self.location().read().unlinked
    }

    pub async fn get_attributes(&self) -> Result<InodeAttributes> {
        match self {
            Inode::Directory(dir) => Ok(dir.get_attributes()),
            Inode::File(file) | Inode::Symlink(file) => file.get_attributes().await,
        }
    }

    pub(crate) fn location(&self) -> &RwLock<Location> {
        match self {
            Inode::Directory(dir) => dir.location(),
            Inode::File(file) | Inode::Symlink(file) => file.location(),
        }
    }

    pub(crate) fn mark_unlinked(&self) {
        match self {
            Inode::Directory(dir) => dir.location().write().unlink(),
            Inode::File(file) | Inode::Symlink(file) => file.mark_unlinked(),
        }
    }

    fn describe(&self) -> String {
        self.path().unwrap_or_else(|| format!("{:?}", self.ino()))
    }
}

impl std::fmt::Debug for Inode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Inode::Directory(_) => "Directory",
            Inode::File(_) => "File",
            Inode::Symlink(_) => "Symlink",
        };
        write!(f, "{}({:?})", kind, self.ino())
    }
}

/// Attributes reported to the kernel bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeAttributes {
    pub ino: InodeNumber,
    pub kind: EntryKind,
    pub size: u64,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub times: Timestamps,
}

impl InodeAttributes {
    /// 512-byte blocks
    pub fn blocks(&self) -> u64 {
        self.size.div_ceil(512)
    }
}

/// Where an inode hangs in the tree.
///
/// The parent reference is weak: parents own children, never the reverse.
pub(crate) struct Location {
    pub parent: Option<Weak<TreeInode>>,
    pub name: String,
    pub unlinked: bool,
}

impl Location {
    pub fn root() -> Self {
        Location {
            parent: None,
            name: String::new(),
            unlinked: false,
        }
    }

    pub fn child(parent: &Arc<TreeInode>, name: &str) -> Self {
        Location {
            parent: Some(Arc::downgrade(parent)),
            name: name.to_string(),
            unlinked: false,
        }
    }

    pub fn unlink(&mut self) {
        self.unlinked = true;
        self.parent = None;
    }
}

pub(crate) trait LocationExt {
    fn path(&self) -> Option<String>;
    fn parent_and_name(&self) -> Option<(Arc<TreeInode>, String)>;
}

impl LocationExt for RwLock<Location> {
    /// Walk the parent chain. Only location locks are taken, so this is
    /// safe to call while holding any contents lock.
    fn path(&self) -> Option<String> {
        let mut components = Vec::new();
        let mut parent = {
            let location = self.read();
            if location.unlinked {
                return None;
            }
            match &location.parent {
                None => return Some(String::new()),
                Some(parent) => {
                    components.push(location.name.clone());
                    parent.clone()
                }
            }
        };

        loop {
            let dir = parent.upgrade()?;
            let location = dir.location().read();
            if location.unlinked {
                return None;
            }
            match &location.parent {
                None => break,
                Some(next) => {
                    components.push(location.name.clone());
                    let next = next.clone();
                    drop(location);
                    parent = next;
                }
            }
        }

        components.reverse();
        Some(components.join("/"))
    }

    fn parent_and_name(&self) -> Option<(Arc<TreeInode>, String)> {
        let location = self.read();
        if location.unlinked {
            return None;
        }
        let parent = location.parent.as_ref()?.upgrade()?;
        Some((parent, location.name.clone()))
    }
}

/// Tell the parent that the inode at `location` is now materialized.
/// The parent materializes itself if needed and continues upward.
pub(crate) fn propagate_materialization(
    location: &RwLock<Location>,
    ino: InodeNumber,
) -> Result<()> {
    match location.parent_and_name() {
        Some((parent, name)) => parent.child_materialized(&name, ino),
        None => Ok(()),
    }
}
