//! Object directory backing store
//!
//! Layout under the root directory:
//!
//! ```text
//! objects/<first two hex chars>/<hex hash>   tag byte ('t' tree, 'b' blob) + payload
//! commits/<hex commit id>                    hex root tree hash
//! ```
//!
//! Objects are verified against their hash when read. The importer turns a
//! local directory into trees, blobs and a commit.

use super::BackingStore;
use crate::error::{Error, Result};
use crate::model::{Blob, EntryKind, Hash, Tree, TreeEntry};
use async_trait::async_trait;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const TAG_TREE: u8 = b't';
const TAG_BLOB: u8 = b'b';

/// Backing store reading immutable objects from a directory
pub struct DirBackingStore {
    root: PathBuf,
}

impl DirBackingStore {
    /// Open (creating if needed) an object directory
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("objects"))?;
        fs::create_dir_all(root.join("commits"))?;
        Ok(DirBackingStore { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, hash: &Hash) -> PathBuf {
        let hex = hash.to_hex();
        self.root.join("objects").join(&hex[..2]).join(hex)
    }

    fn commit_path(&self, commit: &Hash) -> PathBuf {
        self.root.join("commits").join(commit.to_hex())
    }

    fn write_object(&self, hash: &Hash, tag: u8, payload: &[u8]) -> Result<()> {
        let path = self.object_path(hash);
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut data = Vec::with_capacity(payload.len() + 1);
        data.push(tag);
        data.extend_from_slice(payload);

        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        fs::write(&tmp, &data)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Store file content
    pub fn put_blob(&self, content: &[u8]) -> Result<Hash> {
        let hash = Hash::of(content);
        self.write_object(&hash, TAG_BLOB, content)?;
        Ok(hash)
    }

    /// Store a tree
    pub fn put_tree(&self, tree: &Tree) -> Result<Hash> {
        self.write_object(&tree.hash(), TAG_TREE, &tree.encode())?;
        Ok(tree.hash())
    }

    /// Record a snapshot whose root is `root_tree`
    pub fn put_commit(&self, root_tree: Hash) -> Result<Hash> {
        let description = format!(
            "tree {}\ntime {}\n",
            root_tree,
            chrono::Utc::now().to_rfc3339()
        );
        let commit = Hash::of(description.as_bytes());
        fs::write(self.commit_path(&commit), root_tree.to_hex())?;
        Ok(commit)
    }

    /// Snapshot a local directory, returning the new commit id
    pub fn import_directory(&self, source: &Path) -> Result<Hash> {
        let root_tree = self.import_tree(source)?;
        let commit = self.put_commit(root_tree)?;
        info!("Imported {:?} as commit {}", source, commit);
        Ok(commit)
    }

    fn import_tree(&self, dir: &Path) -> Result<Hash> {
        let mut entries = Vec::new();

        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let path = entry.path();
            let file_type = entry.file_type()?;

            let (hash, kind) = if file_type.is_symlink() {
                let target = fs::read_link(&path)?;
                let target = target.to_string_lossy();
                (self.put_blob(target.as_bytes())?, EntryKind::Symlink)
            } else if file_type.is_dir() {
                (self.import_tree(&path)?, EntryKind::Directory)
            } else {
                let content = fs::read(&path)?;
                (self.put_blob(&content)?, file_kind(&entry.metadata()?))
            };

            debug!("import {:?} -> {}", path, hash);
            entries.push(TreeEntry::new(name, hash, kind));
        }

        self.put_tree(&Tree::new(entries))
    }

    fn read_object(&self, hash: &Hash, expected_tag: u8) -> Result<Vec<u8>> {
        let data = match fs::read(self.object_path(hash)) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(Error::ObjectMissing(*hash)),
            Err(e) => return Err(Error::Fetch(format!("reading object {}: {}", hash, e))),
        };

        match data.split_first() {
            Some((&tag, payload)) if tag == expected_tag => Ok(payload.to_vec()),
            _ => Err(Error::ObjectMissing(*hash)),
        }
    }
}

#[cfg(unix)]
fn file_kind(meta: &fs::Metadata) -> EntryKind {
    use std::os::unix::fs::PermissionsExt;
    if meta.permissions().mode() & 0o111 != 0 {
        EntryKind::Executable
    } else {
        EntryKind::Regular
    }
}

#[cfg(not(unix))]
fn file_kind(_meta: &fs::Metadata) -> EntryKind {
    EntryKind::Regular
}

#[async_trait]
impl BackingStore for DirBackingStore {
    async fn get_tree(&self, hash: Hash) -> Result<Tree> {
        let payload = self.read_object(&hash, TAG_TREE)?;
        let tree = Tree::decode(hash, &payload)?;
        if Tree::new(tree.entries().to_vec()).hash() != hash {
            return Err(Error::ObjectMissing(hash));
        }
        Ok(tree)
    }

    async fn get_blob(&self, hash: Hash) -> Result<Blob> {
        let payload = self.read_object(&hash, TAG_BLOB)?;
        if Hash::of(&payload) != hash {
            return Err(Error::ObjectMissing(hash));
        }
        Ok(Blob::with_hash(hash, payload))
    }

    async fn get_root_tree_hash(&self, commit: Hash) -> Result<Hash> {
        match fs::read_to_string(self.commit_path(&commit)) {
            Ok(hex) => Hash::from_hex(&hex),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::ObjectMissing(commit)),
            Err(e) => Err(Error::Fetch(format!("reading commit {}: {}", commit, e))),
        }
    }

    fn name(&self) -> &str {
        "objects-dir"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_import_and_read_back() {
        let source = tempdir().unwrap();
        fs::write(source.path().join("a.txt"), b"alpha").unwrap();
        fs::create_dir(source.path().join("sub")).unwrap();
        fs::write(source.path().join("sub/b.txt"), b"beta").unwrap();

        let objects = tempdir().unwrap();
        let store = DirBackingStore::open(objects.path()).unwrap();
        let commit = store.import_directory(source.path()).unwrap();

        let root = store.get_tree(store.get_root_tree_hash(commit).await.unwrap()).await.unwrap();
        assert_eq!(root.len(), 2);

        let sub = root.get("sub").unwrap();
        assert_eq!(sub.kind, EntryKind::Directory);
        let sub_tree = store.get_tree(sub.hash).await.unwrap();
        let b = store.get_blob(sub_tree.get("b.txt").unwrap().hash).await.unwrap();
        assert_eq!(&b.data()[..], b"beta");
    }

    #[tokio::test]
    async fn test_missing_and_corrupt_objects() {
        let objects = tempdir().unwrap();
        let store = DirBackingStore::open(objects.path()).unwrap();

        let missing = store.get_blob(Hash::of(b"none")).await.unwrap_err();
        assert!(matches!(missing, Error::ObjectMissing(_)));

        let hash = store.put_blob(b"good").unwrap();
        let path = store.object_path(&hash);
        fs::write(&path, b"bbad").unwrap();
        assert!(matches!(
            store.get_blob(hash).await.unwrap_err(),
            Error::ObjectMissing(_)
        ));
    }

    #[tokio::test]
    async fn test_unknown_commit() {
        let objects = tempdir().unwrap();
        let store = DirBackingStore::open(objects.path()).unwrap();
        assert!(store.get_root_tree_hash(Hash::of(b"c")).await.is_err());
    }
}
