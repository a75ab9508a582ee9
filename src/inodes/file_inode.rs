//! File and symlink inodes
//!
//! An unmaterialized file is just its backing blob hash; reads go through
//! the object store (and its caches). The first write copies the blob into
//! the inode's overlay data file and applies the change there. From then
//! on reads and writes touch only the requested range of that file, and
//! the overlay record keeps the timestamps.

use super::inode::{propagate_materialization, InodeAttributes, Location, LocationExt};
use super::InodeNumber;
use crate::error::{Error, Result};
use crate::model::{EntryKind, Hash};
use crate::mount::MountContext;
use crate::overlay::{OverlayEntry, OverlayFile, Timestamps};
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, warn};

/// Largest size a write or truncate may give a file (1 TiB)
pub const MAX_FILE_SIZE: u64 = 1 << 40;

pub(crate) struct FileState {
    /// Backing blob while unmaterialized
    pub hash: Option<Hash>,
    /// Length of the data file once materialized
    pub size: u64,
    /// Set on unlink; the data file then lives in the overlay's retired area
    pub retired: bool,
    pub times: Timestamps,
}

impl FileState {
    pub fn unmaterialized(hash: Hash, times: Timestamps) -> Self {
        FileState {
            hash: Some(hash),
            size: 0,
            retired: false,
            times,
        }
    }

    pub fn materialized(size: u64, record: OverlayFile) -> Self {
        FileState {
            hash: None,
            size,
            retired: false,
            times: record.times,
        }
    }
}

pub struct FileInode {
    ino: InodeNumber,
    kind: EntryKind,
    ctx: Arc<MountContext>,
    location: RwLock<Location>,
    state: RwLock<FileState>,
}

impl FileInode {
    pub(crate) fn new(
        ino: InodeNumber,
        kind: EntryKind,
        ctx: Arc<MountContext>,
        location: Location,
        state: FileState,
    ) -> Self {
        FileInode {
            ino,
            kind,
            ctx,
            location: RwLock::new(location),
            state: RwLock::new(state),
        }
    }

    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn backing_hash(&self) -> Option<Hash> {
        self.state.read().hash
    }

    pub fn is_materialized(&self) -> bool {
        self.state.read().hash.is_none()
    }

    pub fn path(&self) -> Option<String> {
        self.location.path()
    }

    pub(crate) fn location(&self) -> &RwLock<Location> {
        &self.location
    }

    /// Detach from the tree. A materialized file keeps its bytes in the
    /// retired area until the inode is dropped.
    pub(crate) fn mark_unlinked(&self) {
        let mut state = self.state.write();
        self.location.write().unlink();
        if state.retired {
            return;
        }
        if state.hash.is_none() {
            if let Err(e) = self.ctx.overlay.retire_data(self.ino) {
                warn!("Failed to retire data of unlinked {:?}: {}", self.ino, e);
            }
        }
        state.retired = true;
    }

    /// Whole current content
    pub async fn content(&self) -> Result<Bytes> {
        self.read(0, usize::MAX).await
    }

    /// Up to `length` bytes at `offset`, short at end of file
    pub async fn read(&self, offset: u64, length: usize) -> Result<Bytes> {
        let hash = {
            let state = self.state.read();
            match state.hash {
                None => return self.read_local(&state, offset, length),
                Some(hash) => hash,
            }
        };

        let blob = self.ctx.store.get_blob(hash).await?;
        {
            // Materialized while fetching: the data file is authoritative
            let state = self.state.read();
            if state.hash.is_none() {
                return self.read_local(&state, offset, length);
            }
        }

        let data = blob.data();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let end = start.saturating_add(length).min(data.len());
        Ok(data.slice(start..end))
    }

    fn read_local(&self, state: &FileState, offset: u64, length: usize) -> Result<Bytes> {
        if offset >= state.size {
            return Ok(Bytes::new());
        }
        let available = state.size - offset;
        let length = usize::try_from(available).map_or(length, |a| a.min(length));
        let data = self
            .ctx
            .overlay
            .read_data(self.ino, state.retired, offset, length)?;
        Ok(Bytes::from(data))
    }

    /// Write `data` at `offset`; a gap past the end reads back as zeros.
    /// Materializes the file on first write.
    pub async fn write(&self, offset: u64, data: &[u8]) -> Result<usize> {
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|end| *end <= MAX_FILE_SIZE)
            .ok_or_else(|| self.too_large(offset.saturating_add(data.len() as u64)))?;

        self.modify(true, |retired, size| {
            self.ctx.overlay.write_data(self.ino, retired, offset, data)?;
            Ok((data.len(), size.max(end)))
        })
        .await
    }

    pub async fn truncate(&self, size: u64) -> Result<()> {
        if size > MAX_FILE_SIZE {
            return Err(self.too_large(size));
        }
        // Truncating to zero never needs the backing content
        self.modify(size > 0, |retired, _| {
            self.ctx.overlay.set_data_len(self.ino, retired, size)?;
            Ok(((), size))
        })
        .await
    }

    /// Symlink target
    pub async fn readlink(&self) -> Result<String> {
        if !self.kind.is_symlink() {
            return Err(Error::InvalidArgument(format!("{:?} is not a symlink", self.ino)));
        }
        let target = self.content().await?;
        Ok(String::from_utf8_lossy(&target).into_owned())
    }

    pub async fn get_attributes(&self) -> Result<InodeAttributes> {
        let (size, times) = loop {
            let (hash, times) = {
                let state = self.state.read();
                match state.hash {
                    None => break (state.size, state.times),
                    Some(hash) => (hash, state.times),
                }
            };
            let blob = self.ctx.store.get_blob(hash).await?;
            if self.state.read().hash == Some(hash) {
                break (blob.len() as u64, times);
            }
        };

        Ok(InodeAttributes {
            ino: self.ino,
            kind: self.kind,
            size,
            perm: self.kind.default_perm(),
            nlink: if self.location.read().unlinked { 0 } else { 1 },
            uid: self.ctx.uid(),
            gid: self.ctx.gid(),
            times,
        })
    }

    /// Run `change` against the data file under the exclusive lock, then
    /// record the new size and times. `change` gets the retired flag and
    /// the current size and returns its result plus the new size.
    ///
    /// An unmaterialized file gets a data file first, seeded with the
    /// backing content when `seed` is set. The blob is fetched before the
    /// lock is taken.
    async fn modify<F, R>(&self, seed: bool, change: F) -> Result<R>
    where
        F: FnOnce(bool, u64) -> Result<(R, u64)>,
    {
        let mut change = Some(change);
        loop {
            let pending = self.state.read().hash;
            let fetched = match pending {
                Some(hash) if seed => Some(self.ctx.store.get_blob(hash).await?),
                _ => None,
            };

            let newly_materialized;
            let result;
            {
                let mut state = self.state.write();
                // Materialized by someone else while the blob was fetched
                if state.hash != pending {
                    continue;
                }

                if pending.is_some() {
                    let initial: &[u8] = match &fetched {
                        Some(blob) => &blob.data()[..],
                        None => &[],
                    };
                    self.ctx
                        .overlay
                        .create_data(self.ino, state.retired, initial)?;
                    state.size = initial.len() as u64;
                }

                let Some(change) = change.take() else {
                    return Err(Error::Internal(format!("{:?} modified twice", self.ino)));
                };
                let (value, size) = change(state.retired, state.size)?;
                result = value;
                if pending.is_none() {
                    state.size = size;
                }

                let mut times = state.times;
                times.touch();
                let path = self.location.path();
                if path.is_some() {
                    let record = OverlayEntry::File(OverlayFile { times });
                    self.ctx.overlay.save_entry(self.ino, &record)?;
                }

                newly_materialized = state.hash.take().is_some();
                state.size = size;
                state.times = times;

                if let Some(path) = path {
                    if newly_materialized {
                        debug!("Materialized file {:?} ({})", self.ino, path);
                    }
                    self.ctx.record_change(vec![path]);
                }
            }

            if newly_materialized {
                propagate_materialization(&self.location, self.ino)?;
            }
            return Ok(result);
        }
    }

    fn too_large(&self, size: u64) -> Error {
        let name = self
            .path()
            .unwrap_or_else(|| format!("{:?}", self.ino));
        Error::FileTooLarge(format!("{} to {} bytes", name, size))
    }
}

impl Drop for FileInode {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.retired && state.hash.is_none() {
            if let Err(e) = self.ctx.overlay.release_retired(self.ino) {
                warn!("Failed to release data of unlinked {:?}: {}", self.ino, e);
            }
        }
    }
}
