//! Overlay record types

use crate::inodes::InodeNumber;
use crate::model::{EntryKind, Hash};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::SystemTime;

/// Access, modification and change times of an inode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamps {
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl Timestamps {
    /// All three times set to `time`
    pub fn at(time: SystemTime) -> Self {
        Timestamps {
            atime: time,
            mtime: time,
            ctime: time,
        }
    }

    pub fn now() -> Self {
        Self::at(SystemTime::now())
    }

    /// Record a content change
    pub fn touch(&mut self) {
        let now = SystemTime::now();
        self.mtime = now;
        self.ctime = now;
    }
}

/// One child of a materialized directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayDirEntry {
    pub kind: EntryKind,
    pub ino: InodeNumber,
    /// Backing hash while the child is unmaterialized
    pub hash: Option<Hash>,
    /// Last backing hash the child had, used to revert a corrupt record
    pub origin: Option<Hash>,
}

impl OverlayDirEntry {
    pub fn is_materialized(&self) -> bool {
        self.hash.is_none()
    }
}

/// Complete listing of a materialized directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayDir {
    pub entries: BTreeMap<String, OverlayDirEntry>,
    pub times: Timestamps,
}

impl OverlayDir {
    pub fn empty() -> Self {
        OverlayDir {
            entries: BTreeMap::new(),
            times: Timestamps::now(),
        }
    }
}

/// Metadata of a materialized file or symlink. The bytes live in the
/// inode's data file next to the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayFile {
    pub times: Timestamps,
}

/// Durable state of one materialized inode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverlayEntry {
    Directory(OverlayDir),
    File(OverlayFile),
}

impl OverlayEntry {
    pub fn kind_name(&self) -> &'static str {
        match self {
            OverlayEntry::Directory(_) => "directory",
            OverlayEntry::File(_) => "file",
        }
    }
}
