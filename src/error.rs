//! Error types for treefs
//!
//! A single error enum covers the whole mount runtime. Each variant knows
//! which POSIX error code the kernel bridge should see, and whether the
//! caller may retry.

use crate::model::Hash;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the mount runtime
#[derive(Debug, Error)]
pub enum Error {
    /// A path component or inode does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// An entry with this name already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// An intermediate path component is not a directory
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// A file operation was attempted on a directory
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Directory still has entries
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// Malformed request (bad name, rename into own subtree, ...)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Write or truncate past the largest supported file size
    #[error("file too large: {0}")]
    FileTooLarge(String),

    /// Inode reference from another mount generation
    #[error("stale inode reference: generation {presented:#x}, mount is {current:#x}")]
    StaleGeneration { presented: u64, current: u64 },

    /// Backing data is permanently unavailable
    #[error("object missing from backing store: {0}")]
    ObjectMissing(Hash),

    /// Transient backing store failure (retryable)
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// An overlay record failed its format or checksum check
    #[error("overlay corrupt at inode {ino}: {reason}")]
    OverlayCorrupt { ino: u64, reason: String },

    /// The journal lost its ordering guarantee
    #[error("journal corrupt: {0}")]
    JournalCorrupt(String),

    /// Requested journal range has already been pruned
    #[error("journal truncated: requested sequence {requested}, earliest retained is {earliest}")]
    JournalTruncated { requested: u64, earliest: u64 },

    /// Mount could not be brought up
    #[error("mount initialization failed: {0}")]
    Initialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Local database error
    #[error("database error: {0}")]
    Database(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// POSIX error code reported to the kernel bridge
    pub fn errno(&self) -> i32 {
        match self {
            Error::NotFound(_) => libc::ENOENT,
            Error::AlreadyExists(_) => libc::EEXIST,
            Error::NotADirectory(_) => libc::ENOTDIR,
            Error::IsADirectory(_) => libc::EISDIR,
            Error::DirectoryNotEmpty(_) => libc::ENOTEMPTY,
            Error::InvalidArgument(_) => libc::EINVAL,
            Error::FileTooLarge(_) => libc::EFBIG,
            Error::StaleGeneration { .. } => libc::ESTALE,
            Error::Fetch(_) => libc::EAGAIN,
            Error::JournalTruncated { .. } => libc::ERANGE,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            _ => libc::EIO,
        }
    }

    /// Whether retrying the same operation later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Fetch(_))
    }

    /// Whether the error invalidates the mount (or its journal) as a whole
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Initialization(_) | Error::JournalCorrupt(_))
    }

    /// Copy of this error for every caller waiting on a shared fetch.
    ///
    /// `std::io::Error` is not `Clone`, so I/O failures collapse into a
    /// retryable `Fetch` carrying the message.
    pub(crate) fn duplicate(&self) -> Error {
        match self {
            Error::NotFound(s) => Error::NotFound(s.clone()),
            Error::ObjectMissing(h) => Error::ObjectMissing(*h),
            Error::Fetch(s) => Error::Fetch(s.clone()),
            Error::Serialization(s) => Error::Serialization(s.clone()),
            Error::Database(s) => Error::Database(s.clone()),
            other => Error::Fetch(other.to_string()),
        }
    }
}

impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::NotFound("x".into()).errno(), libc::ENOENT);
        assert_eq!(Error::AlreadyExists("x".into()).errno(), libc::EEXIST);
        assert_eq!(Error::NotADirectory("x".into()).errno(), libc::ENOTDIR);
        assert_eq!(Error::DirectoryNotEmpty("x".into()).errno(), libc::ENOTEMPTY);
        assert_eq!(Error::ObjectMissing(Hash::ZERO).errno(), libc::EIO);
        assert_eq!(Error::Fetch("timeout".into()).errno(), libc::EAGAIN);
        assert_eq!(Error::FileTooLarge("f".into()).errno(), libc::EFBIG);
    }

    #[test]
    fn test_classification() {
        assert!(Error::Fetch("x".into()).is_retryable());
        assert!(!Error::ObjectMissing(Hash::ZERO).is_retryable());
        assert!(Error::JournalCorrupt("gap".into()).is_fatal());
        assert!(!Error::OverlayCorrupt { ino: 5, reason: "x".into() }.is_fatal());
    }

    #[test]
    fn test_duplicate_keeps_kind() {
        let missing = Error::ObjectMissing(Hash::ZERO).duplicate();
        assert!(matches!(missing, Error::ObjectMissing(_)));

        let io = Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert!(io.duplicate().is_retryable());
    }
}
