//! Open file and directory handle management

use crate::error::Result;
use crate::inodes::{Inode, TreeInode};
use crate::model::EntryKind;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Represents an open file or directory.
///
/// The handle keeps its inode alive, so an unlinked file stays readable
/// and writable until released.
pub struct OpenHandle {
    pub inode: Inode,
    /// Open flags
    pub flags: i32,
    /// Directory listing taken by the readdir at offset 0; later calls
    /// page through it, so an offset always names the same entry
    listing: Mutex<Option<Arc<Vec<ListingEntry>>>>,
}

/// One directory entry as handed to readdir
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub ino: u64,
    pub kind: EntryKind,
    pub name: String,
}

impl OpenHandle {
    pub fn new(inode: Inode, flags: i32) -> Self {
        OpenHandle {
            inode,
            flags,
            listing: Mutex::new(None),
        }
    }

    /// Listing from the last rewind, if any
    pub fn listing(&self) -> Option<Arc<Vec<ListingEntry>>> {
        self.listing.lock().clone()
    }

    /// Replace the listing (a rewind to offset 0)
    pub fn set_listing(&self, entries: Vec<ListingEntry>) -> Arc<Vec<ListingEntry>> {
        let entries = Arc::new(entries);
        *self.listing.lock() = Some(entries.clone());
        entries
    }

    /// Check if opened for reading
    pub fn is_readable(&self) -> bool {
        let mode = self.flags & libc::O_ACCMODE;
        mode == libc::O_RDONLY || mode == libc::O_RDWR
    }

    /// Check if opened for writing
    pub fn is_writable(&self) -> bool {
        let mode = self.flags & libc::O_ACCMODE;
        mode == libc::O_WRONLY || mode == libc::O_RDWR
    }

    /// Check if opened for append
    pub fn is_append(&self) -> bool {
        (self.flags & libc::O_APPEND) != 0
    }
}

/// `.`, `..` and the children of `dir`, in readdir order
pub async fn list_directory(dir: &TreeInode) -> Result<Vec<ListingEntry>> {
    let parent = dir.parent_ino().unwrap_or_else(|| dir.ino());
    let mut entries = vec![
        ListingEntry {
            ino: dir.ino().get(),
            kind: EntryKind::Directory,
            name: ".".to_string(),
        },
        ListingEntry {
            ino: parent.get(),
            kind: EntryKind::Directory,
            name: "..".to_string(),
        },
    ];
    for child in dir.list_children().await? {
        entries.push(ListingEntry {
            ino: child.ino.get(),
            kind: child.kind,
            name: child.name,
        });
    }
    Ok(entries)
}

/// Entries after readdir `offset`, each with the offset that resumes
/// right after it
pub fn page<'a>(
    listing: &'a [ListingEntry],
    offset: i64,
) -> impl Iterator<Item = (i64, &'a ListingEntry)> {
    let skip = usize::try_from(offset).unwrap_or(0);
    listing
        .iter()
        .enumerate()
        .skip(skip)
        .map(|(i, entry)| (i as i64 + 1, entry))
}

/// Manages open handles
pub struct HandleTable {
    /// Next handle ID
    next_id: AtomicU64,
    handles: RwLock<HashMap<u64, Arc<OpenHandle>>>,
}

impl HandleTable {
    pub fn new() -> Self {
        HandleTable {
            next_id: AtomicU64::new(1),
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Open `inode` and return a handle ID
    pub fn open(&self, inode: Inode, flags: i32) -> u64 {
        let fh = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.handles
            .write()
            .insert(fh, Arc::new(OpenHandle::new(inode, flags)));
        fh
    }

    pub fn get(&self, fh: u64) -> Option<Arc<OpenHandle>> {
        self.handles.read().get(&fh).cloned()
    }

    pub fn close(&self, fh: u64) -> Option<Arc<OpenHandle>> {
        self.handles.write().remove(&fh)
    }

    pub fn len(&self) -> usize {
        self.handles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.read().is_empty()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inodes::GenerationSource;
    use crate::mount::{MountOptions, MountRuntime};
    use crate::store::{FetchPolicy, MemoryBackingStore, ObjectStore};

    async fn sample_inode(dir: &std::path::Path) -> (MountRuntime, Inode) {
        let backing = Arc::new(MemoryBackingStore::new());
        let commit = backing.put_flat_commit(&[("f", &b"data"[..])]);
        let store = ObjectStore::in_memory(backing, FetchPolicy::default());
        let mount = MountRuntime::initialize(
            commit,
            dir,
            store,
            &GenerationSource::new(),
            MountOptions::default(),
        )
        .await
        .unwrap();
        let inode = mount.resolve_inode("f").await.unwrap();
        (mount, inode)
    }

    #[tokio::test]
    async fn test_handle_flags() {
        let dir = tempfile::tempdir().unwrap();
        let (_mount, inode) = sample_inode(dir.path()).await;

        let read_handle = OpenHandle::new(inode.clone(), libc::O_RDONLY);
        assert!(read_handle.is_readable());
        assert!(!read_handle.is_writable());

        let write_handle = OpenHandle::new(inode.clone(), libc::O_WRONLY | libc::O_APPEND);
        assert!(!write_handle.is_readable());
        assert!(write_handle.is_writable());
        assert!(write_handle.is_append());

        let rw_handle = OpenHandle::new(inode, libc::O_RDWR);
        assert!(rw_handle.is_readable());
        assert!(rw_handle.is_writable());
    }

    #[tokio::test]
    async fn test_handle_table() {
        let dir = tempfile::tempdir().unwrap();
        let (_mount, inode) = sample_inode(dir.path()).await;
        let table = HandleTable::new();

        let fh1 = table.open(inode.clone(), libc::O_RDONLY);
        let fh2 = table.open(inode.clone(), libc::O_RDWR);
        assert_ne!(fh1, fh2);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(fh1).unwrap().inode.ino(), inode.ino());

        assert!(table.close(fh1).is_some());
        assert!(table.get(fh1).is_none());
        assert!(table.close(fh1).is_none());
        assert!(table.get(fh2).is_some());
    }

    #[tokio::test]
    async fn test_listing_stable_across_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let (mount, _) = sample_inode(dir.path()).await;
        let root = mount.get_root_inode();
        root.create_child("b", EntryKind::Regular).await.unwrap();
        let handle = OpenHandle::new(Inode::Directory(root.clone()), libc::O_RDONLY);
        assert!(handle.listing().is_none());

        let listing = handle.set_listing(list_directory(&root).await.unwrap());
        let names: Vec<_> = listing.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec![".", "..", "b", "f"]);

        // First page stops after "..", resumes at offset 2
        let first: Vec<_> = page(&listing, 0).take(2).map(|(next, _)| next).collect();
        assert_eq!(first, vec![1, 2]);

        // A create sorting before the resume point does not shift the rest
        root.create_child("a", EntryKind::Regular).await.unwrap();
        let cached = handle.listing().unwrap();
        let rest: Vec<_> = page(&cached, 2).map(|(next, e)| (next, e.name.clone())).collect();
        assert_eq!(rest, vec![(3, "b".to_string()), (4, "f".to_string())]);
        assert_eq!(page(&cached, 4).count(), 0);
        assert_eq!(page(&cached, -1).count(), 4);

        // Rewinding picks the change up
        let fresh = handle.set_listing(list_directory(&root).await.unwrap());
        assert_eq!(fresh.len(), 5);
    }
}
