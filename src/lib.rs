//! treefs - Lazily materialized filesystem over a content-addressed store
//!
//! A mounted working copy shows a versioned project tree as a normal
//! filesystem. Unmodified files and directories are fetched from the
//! backing object store on first access; modified ones live in a local,
//! crash-safe overlay. Every mutation is recorded in an ordered journal.

pub mod config;
pub mod error;
pub mod fs;
pub mod inodes;
pub mod journal;
pub mod model;
pub mod mount;
pub mod overlay;
pub mod status;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};
pub use mount::{MountOptions, MountRuntime, MountStatus};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::inodes::{GenerationSource, Inode, InodeNumber, TreeInode};
    pub use crate::model::{EntryKind, Hash};
    pub use crate::mount::{MountOptions, MountRuntime};
    pub use crate::store::{BackingStore, ObjectStore};
}
