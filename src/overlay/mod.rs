//! Durable local state for materialized inodes
//!
//! Each materialized inode has one record file:
//!
//! ```text
//! <overlay dir>/<ino % 256 as two hex digits>/<ino>
//! ```
//!
//! A record is `MAGIC | version | blake3(payload) | bincode(OverlayEntry)`.
//! Records are written to a temporary file, synced, then renamed into
//! place, so after a crash a record is either fully present or absent.
//!
//! File bytes are kept out of the record in `<shard>/<ino>.data` and are
//! read and written in place. When a file is unlinked while still open
//! its data file moves to `unlinked/<ino>`; that directory is emptied on
//! every open.
//!
//! The next inode number is written on clean close and removed on open.
//! When it is missing the overlay was not closed cleanly and the number is
//! recovered by scanning every record.

mod entry;

pub use entry::{OverlayDir, OverlayDirEntry, OverlayEntry, OverlayFile, Timestamps};

use crate::error::{Error, Result};
use crate::inodes::InodeNumber;
use std::fs;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, warn};

const RECORD_MAGIC: &[u8; 4] = b"TFOV";
const RECORD_VERSION: u8 = 1;
const HEADER_LEN: usize = RECORD_MAGIC.len() + 1 + blake3::OUT_LEN;

const NEXT_INODE_FILE: &str = "next-inode-number";
const TMP_DIR: &str = "tmp";
const RETIRED_DIR: &str = "unlinked";
const DATA_SUFFIX: &str = ".data";

/// Inode-keyed store of materialized directories and files
pub struct Overlay {
    dir: PathBuf,
    next_ino: AtomicU64,
    closed: AtomicBool,
}

impl Overlay {
    /// Open (creating if needed) the overlay in `dir`
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(dir.join(TMP_DIR))?;
        let retired = dir.join(RETIRED_DIR);
        if retired.exists() {
            fs::remove_dir_all(&retired)?;
        }
        fs::create_dir_all(&retired)?;

        let next = match read_next_inode_number(&dir)? {
            Some(next) => {
                fs::remove_file(dir.join(NEXT_INODE_FILE))?;
                debug!("Overlay {:?} was closed cleanly, next inode {}", dir, next);
                next
            }
            None => {
                let max = scan_max_inode_number(&dir)?;
                if max > InodeNumber::ROOT.get() {
                    warn!(
                        "Overlay {:?} was not closed cleanly, recovered next inode {}",
                        dir,
                        max + 1
                    );
                }
                max + 1
            }
        };
        let next = next.max(InodeNumber::FIRST_ALLOCATED.get());

        info!("Opened overlay at {:?}", dir);
        Ok(Overlay {
            dir,
            next_ino: AtomicU64::new(next),
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Hand out a fresh inode number
    pub fn allocate_inode_number(&self) -> InodeNumber {
        InodeNumber::new(self.next_ino.fetch_add(1, Ordering::SeqCst))
    }

    /// The number the next allocation will return
    pub fn next_inode_number(&self) -> InodeNumber {
        InodeNumber::new(self.next_ino.load(Ordering::SeqCst))
    }

    fn record_path(&self, ino: InodeNumber) -> PathBuf {
        self.dir
            .join(format!("{:02x}", ino.get() % 256))
            .join(ino.get().to_string())
    }

    fn data_path(&self, ino: InodeNumber, retired: bool) -> PathBuf {
        if retired {
            self.dir.join(RETIRED_DIR).join(ino.get().to_string())
        } else {
            self.dir
                .join(format!("{:02x}", ino.get() % 256))
                .join(format!("{}{}", ino, DATA_SUFFIX))
        }
    }

    /// Read a record. Absent records are `Ok(None)`; damaged ones are
    /// `Error::OverlayCorrupt`.
    pub fn load_entry(&self, ino: InodeNumber) -> Result<Option<OverlayEntry>> {
        let data = match fs::read(self.record_path(ino)) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        decode_record(ino, &data).map(Some)
    }

    /// Durably replace the record for `ino`
    pub fn save_entry(&self, ino: InodeNumber, entry: &OverlayEntry) -> Result<()> {
        let data = encode_record(entry)?;
        let path = self.record_path(ino);
        if let Some(shard) = path.parent() {
            fs::create_dir_all(shard)?;
        }

        let tmp = self
            .dir
            .join(TMP_DIR)
            .join(format!("{}-{}", ino, uuid::Uuid::new_v4()));
        let written = (|| -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&data)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        })();

        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        debug!("Saved overlay {} record for {:?}", entry.kind_name(), ino);
        Ok(())
    }

    /// Remove the record for `ino` and its data file, if any. Removing an
    /// absent record is not an error.
    pub fn delete_entry(&self, ino: InodeNumber) -> Result<()> {
        if remove_if_present(&self.record_path(ino))? {
            debug!("Deleted overlay record for {:?}", ino);
        }
        remove_if_present(&self.data_path(ino, false))?;
        Ok(())
    }

    /// Durably replace the data file for `ino` with `content`
    pub fn create_data(&self, ino: InodeNumber, retired: bool, content: &[u8]) -> Result<()> {
        let path = self.data_path(ino, retired);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = self
            .dir
            .join(TMP_DIR)
            .join(format!("{}-data-{}", ino, uuid::Uuid::new_v4()));
        let written = (|| -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(content)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        })();

        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        debug!("Created data file for {:?} ({} bytes)", ino, content.len());
        Ok(())
    }

    /// Up to `len` bytes at `offset`; short at end of file
    pub fn read_data(
        &self,
        ino: InodeNumber,
        retired: bool,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>> {
        let file = fs::File::open(self.data_path(ino, retired))?;
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            match file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    pub fn write_data(&self, ino: InodeNumber, retired: bool, offset: u64, data: &[u8]) -> Result<()> {
        let file = fs::OpenOptions::new()
            .write(true)
            .open(self.data_path(ino, retired))?;
        file.write_all_at(data, offset)?;
        file.sync_data()?;
        Ok(())
    }

    /// Resize the data file. Growth leaves a hole rather than writing zeros.
    pub fn set_data_len(&self, ino: InodeNumber, retired: bool, len: u64) -> Result<()> {
        let file = fs::OpenOptions::new()
            .write(true)
            .open(self.data_path(ino, retired))?;
        file.set_len(len)?;
        file.sync_data()?;
        Ok(())
    }

    /// Length of the data file for a linked `ino`, `None` when it is missing
    pub fn data_len(&self, ino: InodeNumber) -> Result<Option<u64>> {
        match fs::metadata(self.data_path(ino, false)) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Move the data file of an unlinked inode out of the shard tree, so
    /// it survives record deletion and overlay clears until released
    pub fn retire_data(&self, ino: InodeNumber) -> Result<()> {
        match fs::rename(self.data_path(ino, false), self.data_path(ino, true)) {
            Ok(()) => {
                debug!("Retired data file for {:?}", ino);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Drop the data file of an unlinked inode nothing refers to any more
    pub fn release_retired(&self, ino: InodeNumber) -> Result<()> {
        remove_if_present(&self.data_path(ino, true))?;
        Ok(())
    }

    pub fn has_entry(&self, ino: InodeNumber) -> bool {
        self.record_path(ino).exists()
    }

    /// Root directory record, read before any inode exists
    pub fn load_root_dir(&self) -> Result<Option<OverlayDir>> {
        match self.load_entry(InodeNumber::ROOT)? {
            Some(OverlayEntry::Directory(dir)) => Ok(Some(dir)),
            Some(OverlayEntry::File(_)) => Err(Error::OverlayCorrupt {
                ino: InodeNumber::ROOT.get(),
                reason: "root record is not a directory".to_string(),
            }),
            None => Ok(None),
        }
    }

    /// Drop every record and linked data file. Retired data files stay for
    /// as long as their inodes live. Inode numbers keep counting up.
    pub fn clear(&self) -> Result<()> {
        let mut removed = 0;
        for shard in shard_dirs(&self.dir)? {
            removed += record_names(&shard)?.len();
            fs::remove_dir_all(&shard)?;
        }
        info!("Cleared {} overlay records", removed);
        Ok(())
    }

    /// Number of records on disk
    pub fn record_count(&self) -> Result<usize> {
        let mut count = 0;
        for shard in shard_dirs(&self.dir)? {
            count += record_names(&shard)?.len();
        }
        Ok(count)
    }

    /// Persist the next inode number. Safe to call more than once.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let next = self.next_ino.load(Ordering::SeqCst);
        let tmp = self.dir.join(TMP_DIR).join(NEXT_INODE_FILE);
        fs::write(&tmp, next.to_le_bytes())?;
        fs::rename(&tmp, self.dir.join(NEXT_INODE_FILE))?;
        info!("Closed overlay at {:?}, next inode {}", self.dir, next);
        Ok(())
    }
}

fn encode_record(entry: &OverlayEntry) -> Result<Vec<u8>> {
    let payload = bincode::serialize(entry)?;
    let checksum = blake3::hash(&payload);

    let mut data = Vec::with_capacity(HEADER_LEN + payload.len());
    data.extend_from_slice(RECORD_MAGIC);
    data.push(RECORD_VERSION);
    data.extend_from_slice(checksum.as_bytes());
    data.extend_from_slice(&payload);
    Ok(data)
}

fn decode_record(ino: InodeNumber, data: &[u8]) -> Result<OverlayEntry> {
    let corrupt = |reason: &str| Error::OverlayCorrupt {
        ino: ino.get(),
        reason: reason.to_string(),
    };

    if data.len() < HEADER_LEN {
        return Err(corrupt("truncated header"));
    }
    if &data[..RECORD_MAGIC.len()] != RECORD_MAGIC {
        return Err(corrupt("bad magic"));
    }
    if data[RECORD_MAGIC.len()] != RECORD_VERSION {
        return Err(corrupt("unsupported record version"));
    }

    let (checksum, payload) = data[RECORD_MAGIC.len() + 1..].split_at(blake3::OUT_LEN);
    if blake3::hash(payload).as_bytes() != checksum {
        return Err(corrupt("checksum mismatch"));
    }

    bincode::deserialize(payload).map_err(|e| corrupt(&e.to_string()))
}

fn read_next_inode_number(dir: &Path) -> Result<Option<u64>> {
    let data = match fs::read(dir.join(NEXT_INODE_FILE)) {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match <[u8; 8]>::try_from(data.as_slice()) {
        Ok(bytes) => Ok(Some(u64::from_le_bytes(bytes))),
        Err(_) => {
            warn!("Ignoring malformed next inode number file in {:?}", dir);
            Ok(None)
        }
    }
}

fn shard_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut shards = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.len() == 2
            && name.chars().all(|c| c.is_ascii_hexdigit())
            && entry.file_type()?.is_dir()
        {
            shards.push(entry.path());
        }
    }
    Ok(shards)
}

/// Record files in a shard, keyed by inode number
fn record_names(shard: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut records = Vec::new();
    for entry in fs::read_dir(shard)? {
        let entry = entry?;
        if let Some(ino) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u64>().ok())
        {
            records.push((ino, entry.path()));
        }
    }
    Ok(records)
}

fn remove_if_present(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Highest inode number named by any record or referenced from any
/// directory record
fn scan_max_inode_number(dir: &Path) -> Result<u64> {
    let mut max = InodeNumber::ROOT.get();

    for shard in shard_dirs(dir)? {
        for (ino, path) in record_names(&shard)? {
            max = max.max(ino);

            let data = fs::read(path)?;
            match decode_record(InodeNumber::new(ino), &data) {
                Ok(OverlayEntry::Directory(record)) => {
                    for child in record.entries.values() {
                        max = max.max(child.ino.get());
                    }
                }
                Ok(OverlayEntry::File(_)) => {}
                Err(e) => warn!("Skipping unreadable record during scan: {}", e),
            }
        }
    }

    Ok(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntryKind, Hash};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn file() -> OverlayEntry {
        OverlayEntry::File(OverlayFile {
            times: Timestamps::now(),
        })
    }

    fn dir_with(children: &[(&str, u64)]) -> OverlayEntry {
        let mut entries = BTreeMap::new();
        for (name, ino) in children {
            entries.insert(
                name.to_string(),
                OverlayDirEntry {
                    kind: EntryKind::Regular,
                    ino: InodeNumber::new(*ino),
                    hash: Some(Hash::of(name.as_bytes())),
                    origin: Some(Hash::of(name.as_bytes())),
                },
            );
        }
        OverlayEntry::Directory(OverlayDir {
            entries,
            times: Timestamps::now(),
        })
    }

    #[test]
    fn test_save_load_delete() {
        let tmp = tempdir().unwrap();
        let overlay = Overlay::open(tmp.path()).unwrap();
        let ino = overlay.allocate_inode_number();
        let entry = file();

        assert!(overlay.load_entry(ino).unwrap().is_none());
        overlay.save_entry(ino, &entry).unwrap();
        assert_eq!(overlay.load_entry(ino).unwrap(), Some(entry));
        assert!(overlay.has_entry(ino));

        overlay.delete_entry(ino).unwrap();
        overlay.delete_entry(ino).unwrap();
        assert!(overlay.load_entry(ino).unwrap().is_none());
    }

    #[test]
    fn test_data_file_in_place_updates() {
        let tmp = tempdir().unwrap();
        let overlay = Overlay::open(tmp.path()).unwrap();
        let ino = overlay.allocate_inode_number();
        assert_eq!(overlay.data_len(ino).unwrap(), None);

        overlay.create_data(ino, false, b"hello world").unwrap();
        overlay.write_data(ino, false, 6, b"there").unwrap();
        assert_eq!(overlay.read_data(ino, false, 0, 64).unwrap(), b"hello there");
        assert_eq!(overlay.read_data(ino, false, 6, 2).unwrap(), b"th");
        assert!(overlay.read_data(ino, false, 100, 8).unwrap().is_empty());

        overlay.set_data_len(ino, false, 5).unwrap();
        assert_eq!(overlay.data_len(ino).unwrap(), Some(5));

        // Data files are not records
        overlay.save_entry(ino, &file()).unwrap();
        assert_eq!(overlay.record_count().unwrap(), 1);

        overlay.delete_entry(ino).unwrap();
        assert_eq!(overlay.data_len(ino).unwrap(), None);
    }

    #[test]
    fn test_retired_data_outlives_clear() {
        let tmp = tempdir().unwrap();
        let overlay = Overlay::open(tmp.path()).unwrap();
        let ino = overlay.allocate_inode_number();
        overlay.create_data(ino, false, b"still open").unwrap();
        overlay.save_entry(ino, &file()).unwrap();

        overlay.retire_data(ino).unwrap();
        overlay.delete_entry(ino).unwrap();
        overlay.clear().unwrap();
        assert_eq!(overlay.read_data(ino, true, 0, 64).unwrap(), b"still open");

        overlay.release_retired(ino).unwrap();
        assert!(overlay.read_data(ino, true, 0, 64).is_err());

        // Leftovers from a previous run are dropped on open
        overlay.create_data(ino, true, b"stale").unwrap();
        drop(overlay);
        let overlay = Overlay::open(tmp.path()).unwrap();
        assert!(overlay.read_data(ino, true, 0, 64).is_err());
    }

    #[test]
    fn test_checksum_mismatch_is_corrupt() {
        let tmp = tempdir().unwrap();
        let overlay = Overlay::open(tmp.path()).unwrap();
        let ino = overlay.allocate_inode_number();
        overlay.save_entry(ino, &file()).unwrap();

        let path = overlay.record_path(ino);
        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        fs::write(&path, data).unwrap();

        let err = overlay.load_entry(ino).unwrap_err();
        assert!(matches!(err, Error::OverlayCorrupt { .. }));
    }

    #[test]
    fn test_truncated_record_is_corrupt() {
        let tmp = tempdir().unwrap();
        let overlay = Overlay::open(tmp.path()).unwrap();
        overlay.save_entry(InodeNumber::ROOT, &dir_with(&[])).unwrap();
        fs::write(overlay.record_path(InodeNumber::ROOT), b"TFOV").unwrap();

        assert!(matches!(
            overlay.load_root_dir().unwrap_err(),
            Error::OverlayCorrupt { ino: 1, .. }
        ));
    }

    #[test]
    fn test_root_dir_round_trip() {
        let tmp = tempdir().unwrap();
        let overlay = Overlay::open(tmp.path()).unwrap();
        assert!(overlay.load_root_dir().unwrap().is_none());

        overlay
            .save_entry(InodeNumber::ROOT, &dir_with(&[("a", 2), ("b", 3)]))
            .unwrap();
        let root = overlay.load_root_dir().unwrap().unwrap();
        assert_eq!(root.entries.len(), 2);
        assert_eq!(root.entries["b"].ino, InodeNumber::new(3));
    }

    #[test]
    fn test_next_inode_survives_clean_close() {
        let tmp = tempdir().unwrap();
        {
            let overlay = Overlay::open(tmp.path()).unwrap();
            for _ in 0..10 {
                overlay.allocate_inode_number();
            }
            overlay.close().unwrap();
        }

        let overlay = Overlay::open(tmp.path()).unwrap();
        assert_eq!(overlay.next_inode_number(), InodeNumber::new(12));
        assert!(!tmp.path().join(NEXT_INODE_FILE).exists());
    }

    #[test]
    fn test_next_inode_recovered_after_crash() {
        let tmp = tempdir().unwrap();
        {
            let overlay = Overlay::open(tmp.path()).unwrap();
            overlay.save_entry(InodeNumber::new(40), &file()).unwrap();
            overlay
                .save_entry(InodeNumber::ROOT, &dir_with(&[("deep", 300)]))
                .unwrap();
            // dropped without close
        }

        let overlay = Overlay::open(tmp.path()).unwrap();
        assert_eq!(overlay.next_inode_number(), InodeNumber::new(301));
    }

    #[test]
    fn test_clear_keeps_counting() {
        let tmp = tempdir().unwrap();
        let overlay = Overlay::open(tmp.path()).unwrap();
        let a = overlay.allocate_inode_number();
        overlay.save_entry(a, &file()).unwrap();
        overlay.save_entry(InodeNumber::ROOT, &dir_with(&[])).unwrap();
        assert_eq!(overlay.record_count().unwrap(), 2);

        overlay.clear().unwrap();
        assert_eq!(overlay.record_count().unwrap(), 0);
        assert!(overlay.allocate_inode_number() > a);
    }
}
