//! Backing data model
//!
//! Immutable, content-addressed objects: a `Tree` is one directory snapshot,
//! a `Blob` is one file's content. Both are identified by a `Hash`.

mod blob;
mod hash;
mod path;
mod tree;

pub use blob::Blob;
pub use hash::Hash;
pub use path::{join_path, split_path, validate_name};
pub use tree::{EntryKind, Tree, TreeEntry};
