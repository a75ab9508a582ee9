//! FUSE filesystem implementation
//!
//! Implements the FUSE filesystem interface on top of a mount runtime.

mod fuse;
mod handle;

pub use fuse::{to_file_attr, FuseBridge};
pub use handle::{HandleTable, OpenHandle};
