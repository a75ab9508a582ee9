//! Persistent local object cache
//!
//! Objects fetched from the backing store are kept in a sled database so a
//! remount does not have to fetch them again. Entries that fail to decode
//! are dropped and treated as misses.

use super::compression::{decode_stored, encode_stored};
use crate::error::Result;
use crate::model::{Blob, Hash, Tree};
use std::path::Path;
use tracing::warn;

/// Local on-disk cache of immutable objects
pub struct LocalStore {
    db: sled::Db,
    trees: sled::Tree,
    blobs: sled::Tree,
    commits: sled::Tree,
    compression_threshold: usize,
}

impl LocalStore {
    pub fn open(path: &Path, compression_threshold: usize) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(LocalStore {
            trees: db.open_tree("trees")?,
            blobs: db.open_tree("blobs")?,
            commits: db.open_tree("commits")?,
            db,
            compression_threshold,
        })
    }

    /// Temporary store, removed when dropped
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(LocalStore {
            trees: db.open_tree("trees")?,
            blobs: db.open_tree("blobs")?,
            commits: db.open_tree("commits")?,
            db,
            compression_threshold: 1024,
        })
    }

    pub fn get_tree(&self, hash: &Hash) -> Result<Option<Tree>> {
        let Some(value) = self.trees.get(hash.as_bytes())? else {
            return Ok(None);
        };
        match Tree::decode(*hash, &value) {
            Ok(tree) => Ok(Some(tree)),
            Err(e) => {
                warn!("Dropping undecodable cached tree {}: {}", hash, e);
                self.trees.remove(hash.as_bytes())?;
                Ok(None)
            }
        }
    }

    pub fn put_tree(&self, tree: &Tree) -> Result<()> {
        self.trees.insert(tree.hash().as_bytes(), tree.encode())?;
        Ok(())
    }

    pub fn get_blob(&self, hash: &Hash) -> Result<Option<Blob>> {
        let Some(value) = self.blobs.get(hash.as_bytes())? else {
            return Ok(None);
        };
        match decode_stored(&value) {
            Ok(data) => Ok(Some(Blob::with_hash(*hash, data))),
            Err(e) => {
                warn!("Dropping undecodable cached blob {}: {}", hash, e);
                self.blobs.remove(hash.as_bytes())?;
                Ok(None)
            }
        }
    }

    pub fn put_blob(&self, blob: &Blob) -> Result<()> {
        let stored = encode_stored(blob.data(), self.compression_threshold);
        self.blobs.insert(blob.hash().as_bytes(), stored)?;
        Ok(())
    }

    /// Cached root tree hash of a commit
    pub fn get_commit_root(&self, commit: &Hash) -> Result<Option<Hash>> {
        let Some(value) = self.commits.get(commit.as_bytes())? else {
            return Ok(None);
        };
        match <[u8; Hash::LEN]>::try_from(value.as_ref()) {
            Ok(bytes) => Ok(Some(Hash::from_bytes(bytes))),
            Err(_) => {
                warn!("Dropping malformed commit mapping for {}", commit);
                self.commits.remove(commit.as_bytes())?;
                Ok(None)
            }
        }
    }

    pub fn put_commit_root(&self, commit: &Hash, root: &Hash) -> Result<()> {
        self.commits.insert(commit.as_bytes(), root.as_bytes().as_slice())?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Number of cached (trees, blobs)
    pub fn object_counts(&self) -> (usize, usize) {
        (self.trees.len(), self.blobs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntryKind, TreeEntry};
    use tempfile::tempdir;

    #[test]
    fn test_persists_objects() {
        let dir = tempdir().unwrap();
        let tree = Tree::new(vec![TreeEntry::new("a", Hash::of(b"a"), EntryKind::Regular)]);
        let blob = Blob::new(vec![7u8; 4096]);
        let commit = Hash::of(b"commit");

        {
            let store = LocalStore::open(&dir.path().join("db"), 1024).unwrap();
            store.put_tree(&tree).unwrap();
            store.put_blob(&blob).unwrap();
            store.put_commit_root(&commit, &tree.hash()).unwrap();
            store.flush().unwrap();
        }

        let store = LocalStore::open(&dir.path().join("db"), 1024).unwrap();
        assert_eq!(store.get_tree(&tree.hash()).unwrap(), Some(tree.clone()));
        assert_eq!(store.get_blob(&blob.hash()).unwrap(), Some(blob));
        assert_eq!(store.get_commit_root(&commit).unwrap(), Some(tree.hash()));
        assert_eq!(store.object_counts(), (1, 1));
    }

    #[test]
    fn test_corrupt_entry_is_a_miss() {
        let store = LocalStore::temporary().unwrap();
        let hash = Hash::of(b"x");
        store.blobs.insert(hash.as_bytes(), vec![42u8]).unwrap();

        assert_eq!(store.get_blob(&hash).unwrap(), None);
        assert!(store.blobs.get(hash.as_bytes()).unwrap().is_none());
    }
}
