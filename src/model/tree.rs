//! Directory snapshot objects

use super::Hash;
use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Kind of a tree entry (and of the inode it becomes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    /// Regular file
    Regular,
    /// Executable regular file
    Executable,
    /// Symbolic link; blob content is the target
    Symlink,
    /// Subdirectory
    Directory,
}

impl EntryKind {
    pub fn is_dir(&self) -> bool {
        matches!(self, EntryKind::Directory)
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self, EntryKind::Symlink)
    }

    /// Permission bits reported for this kind
    pub fn default_perm(&self) -> u16 {
        match self {
            EntryKind::Regular => 0o644,
            EntryKind::Executable => 0o755,
            EntryKind::Symlink => 0o777,
            EntryKind::Directory => 0o755,
        }
    }
}

/// One named entry of a tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub name: String,
    pub hash: Hash,
    pub kind: EntryKind,
}

impl TreeEntry {
    pub fn new(name: impl Into<String>, hash: Hash, kind: EntryKind) -> Self {
        TreeEntry {
            name: name.into(),
            hash,
            kind,
        }
    }
}

/// Immutable snapshot of a directory's backing contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
    hash: Hash,
    /// Sorted by name, names unique
    entries: Vec<TreeEntry>,
}

impl Tree {
    /// Build a tree from entries, computing its content hash
    pub fn new(mut entries: Vec<TreeEntry>) -> Self {
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries.dedup_by(|a, b| a.name == b.name);
        let hash = Hash::of(&Self::encode_entries(&entries));
        Tree { hash, entries }
    }

    /// Tree whose identifier was assigned by the backing store
    pub fn with_hash(hash: Hash, mut entries: Vec<TreeEntry>) -> Self {
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries.dedup_by(|a, b| a.name == b.name);
        Tree { hash, entries }
    }

    pub fn hash(&self) -> Hash {
        self.hash
    }

    pub fn entries(&self) -> &[TreeEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up an entry by name
    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries
            .binary_search_by(|e| e.name.as_str().cmp(name))
            .ok()
            .map(|idx| &self.entries[idx])
    }

    /// Serialized form, as stored in the local cache and object directories
    pub fn encode(&self) -> Vec<u8> {
        Self::encode_entries(&self.entries)
    }

    /// Parse the serialized form back into a tree with the given identifier
    pub fn decode(hash: Hash, data: &[u8]) -> Result<Self> {
        let entries: Vec<TreeEntry> = bincode::deserialize(data)?;
        Ok(Tree::with_hash(hash, entries))
    }

    /// Approximate in-memory size, for cache accounting
    pub fn weight(&self) -> usize {
        self.entries
            .iter()
            .map(|e| e.name.len() + Hash::LEN + 16)
            .sum::<usize>()
            + 64
    }

    fn encode_entries(entries: &[TreeEntry]) -> Vec<u8> {
        // Vec of plain structs always serializes
        bincode::serialize(entries).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str) -> TreeEntry {
        TreeEntry::new(name, Hash::of(name.as_bytes()), EntryKind::Regular)
    }

    #[test]
    fn test_hash_ignores_input_order() {
        let a = Tree::new(vec![entry("b"), entry("a")]);
        let b = Tree::new(vec![entry("a"), entry("b")]);
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.entries()[0].name, "a");
    }

    #[test]
    fn test_lookup() {
        let tree = Tree::new(vec![entry("x"), entry("foo.txt"), entry("m")]);
        assert!(tree.get("foo.txt").is_some());
        assert!(tree.get("nope").is_none());
    }

    #[test]
    fn test_decode_keeps_identifier() {
        let tree = Tree::new(vec![entry("a")]);
        let decoded = Tree::decode(tree.hash(), &tree.encode()).unwrap();
        assert_eq!(decoded, tree);
    }
}
