//! Mount state readable from outside the mounting process
//!
//! A running mount rewrites `status.json` in its overlay directory on a
//! timer and removes it on exit. Readers use that file instead of opening
//! the mount's databases, which the mount holds locked. When no live
//! process owns the file, only the journal is read.

use crate::error::{Error, Result};
use crate::journal::Journal;
use crate::mount::{MountRuntime, MountStatus, JOURNAL_DIR};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const STATUS_FILE: &str = "status.json";

/// How often a running mount refreshes its status file
pub const PUBLISH_INTERVAL: Duration = Duration::from_secs(5);

/// Status file contents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedStatus {
    pub pid: u32,
    pub updated: DateTime<Utc>,
    pub mount: MountStatus,
}

/// What can be learned about an overlay directory nobody has mounted
#[derive(Debug, Clone, Serialize)]
pub struct OfflineStatus {
    pub snapshot: Option<String>,
    pub journal_length: u64,
    pub journal_latest: Option<u64>,
    pub journal_corrupt: bool,
}

/// Write the current status of `mount` to its overlay directory
pub fn publish(mount: &MountRuntime) -> Result<()> {
    let dir = mount.overlay().path();
    let published = PublishedStatus {
        pid: std::process::id(),
        updated: Utc::now(),
        mount: mount.status(),
    };
    let data = serde_json::to_vec_pretty(&published)
        .map_err(|e| Error::Serialization(e.to_string()))?;

    let tmp = dir.join(format!("{}.{}", STATUS_FILE, uuid::Uuid::new_v4()));
    fs::write(&tmp, data)?;
    if let Err(e) = fs::rename(&tmp, dir.join(STATUS_FILE)) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Republish every `interval` until the task is aborted
pub async fn publish_periodically(mount: Arc<MountRuntime>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if let Err(e) = publish(&mount) {
            warn!("Failed to publish mount status: {}", e);
        }
    }
}

/// Remove the status file on unmount
pub fn withdraw(overlay_dir: &Path) -> Result<()> {
    match fs::remove_file(overlay_dir.join(STATUS_FILE)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Status of the mount running on `overlay_dir`, if there is one. A file
/// left behind by a process that has exited does not count.
pub fn read_live(overlay_dir: &Path) -> Result<Option<PublishedStatus>> {
    let data = match fs::read(overlay_dir.join(STATUS_FILE)) {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let published: PublishedStatus = match serde_json::from_slice(&data) {
        Ok(published) => published,
        Err(e) => {
            warn!("Ignoring unreadable status file in {:?}: {}", overlay_dir, e);
            return Ok(None);
        }
    };
    if !process_alive(published.pid) {
        debug!("Status file in {:?} is from exited process {}", overlay_dir, published.pid);
        return Ok(None);
    }
    Ok(Some(published))
}

/// Read the journal of an unmounted overlay directory. Nothing is
/// appended and the overlay itself is not opened.
pub fn offline(overlay_dir: &Path, max_deltas: usize) -> Result<OfflineStatus> {
    let journal = Journal::open(&overlay_dir.join(JOURNAL_DIR), max_deltas)?;
    Ok(OfflineStatus {
        snapshot: journal.last_snapshot().map(|h| h.to_hex()),
        journal_length: journal.len(),
        journal_latest: journal.latest_sequence(),
        journal_corrupt: journal.is_corrupt(),
    })
}

fn process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match nix::sys::signal::kill(nix::unistd::Pid::from_raw(raw), None) {
        Ok(()) => true,
        // Exists, owned by someone else
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}
