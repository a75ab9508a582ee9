//! Inode tree
//!
//! Directories ([`TreeInode`]) and files ([`FileInode`]) that mirror a
//! backing snapshot until modified. Modified inodes are materialized: their
//! state moves into the overlay and every ancestor follows.

mod file_inode;
mod inode;
mod inode_map;
mod number;
mod tree_inode;

pub use file_inode::{FileInode, MAX_FILE_SIZE};
pub use inode::{Inode, InodeAttributes, DIR_BLOCK_SIZE};
pub use inode_map::InodeMap;
pub use number::{GenerationSource, InodeNumber, MountGeneration};
pub use tree_inode::{DirListEntry, TreeInode};

pub(crate) use inode::Location;
pub(crate) use tree_inode::DirContents;
