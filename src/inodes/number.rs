//! Inode numbers and mount generations

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifies one inode for the lifetime of a mount (and across restarts
/// of the same overlay). Never reused while the mount is live.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InodeNumber(u64);

impl InodeNumber {
    /// The root directory, matching the kernel's FUSE_ROOT_ID
    pub const ROOT: InodeNumber = InodeNumber(1);

    /// First number handed out to non-root inodes
    pub const FIRST_ALLOCATED: InodeNumber = InodeNumber(2);

    pub const fn new(value: u64) -> Self {
        InodeNumber(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub fn is_root(self) -> bool {
        self == Self::ROOT
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ino:{}", self.0)
    }
}

impl From<u64> for InodeNumber {
    fn from(value: u64) -> Self {
        InodeNumber(value)
    }
}

/// Distinguishes inode-number spaces of different mounts and processes.
///
/// Layout: bits 48..64 hold the low bits of the process id, bits 16..48 the
/// process start time in seconds, bits 0..16 a per-process mount counter.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MountGeneration(u64);

impl MountGeneration {
    pub const fn from_raw(value: u64) -> Self {
        MountGeneration(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// Process component (pid and start time)
    pub fn epoch(self) -> u64 {
        self.0 & !0xffff
    }

    /// Per-process mount counter
    pub fn counter(self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    /// Reject references minted by another mount or process
    pub fn check(self, presented: u64) -> Result<()> {
        if presented == self.0 {
            Ok(())
        } else {
            Err(Error::StaleGeneration {
                presented,
                current: self.0,
            })
        }
    }
}

impl fmt::Debug for MountGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MountGeneration({:#018x})", self.0)
    }
}

impl fmt::Display for MountGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Hands out generations for the mounts of one process.
///
/// Create one at startup and pass it to every `MountRuntime::initialize`.
pub struct GenerationSource {
    epoch: u64,
    counter: AtomicU64,
}

impl GenerationSource {
    /// Source whose epoch is derived from this process
    pub fn new() -> Self {
        let pid = u64::from(std::process::id());
        let started = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self::with_epoch((pid << 48) | ((started & 0xffff_ffff) << 16))
    }

    /// Source with an explicit epoch (low 16 bits are ignored)
    pub fn with_epoch(epoch: u64) -> Self {
        GenerationSource {
            epoch: epoch & !0xffff,
            counter: AtomicU64::new(0),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Generation for the next mount; the counter wraps after 65535 mounts
    pub fn next(&self) -> MountGeneration {
        let count = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        MountGeneration(self.epoch | (count & 0xffff))
    }
}

impl Default for GenerationSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generations_are_distinct() {
        let source = GenerationSource::with_epoch(0xabcd_0000_0000_0000);
        let a = source.next();
        let b = source.next();

        assert_ne!(a, b);
        assert_eq!(a.epoch(), b.epoch());
        assert_eq!(a.counter() + 1, b.counter());
    }

    #[test]
    fn test_epochs_separate_processes() {
        let first = GenerationSource::with_epoch(1 << 48).next();
        let second = GenerationSource::with_epoch(2 << 48).next();

        assert_eq!(first.counter(), second.counter());
        assert_ne!(first, second);
    }

    #[test]
    fn test_stale_generation_rejected() {
        let generation = GenerationSource::with_epoch(7 << 16).next();
        assert!(generation.check(generation.get()).is_ok());

        let err = generation.check(generation.get() + 1).unwrap_err();
        assert!(matches!(err, Error::StaleGeneration { .. }));
        assert_eq!(err.errno(), libc::ESTALE);
    }

    #[test]
    fn test_root_number() {
        assert!(InodeNumber::ROOT.is_root());
        assert_eq!(InodeNumber::ROOT.get(), 1);
        assert!(!InodeNumber::FIRST_ALLOCATED.is_root());
    }
}
