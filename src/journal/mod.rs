//! Ordered change journal
//!
//! Every mutation and every snapshot transition appends one delta. Appends
//! are serialized by a single lock, which makes sequence assignment atomic
//! and gapless; historical ranges are read concurrently straight from sled.
//!
//! Deltas live in a sled database in the overlay directory, so sequence
//! numbers continue across restarts. A gap found on open, or an append
//! that could not be stored, poisons the journal until [`Journal::repair`]
//! is called.

mod delta;

pub use delta::JournalDelta;

use crate::error::{Error, Result};
use crate::model::Hash;
use delta::{key_sequence, sequence_key};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const FLOOR_KEY: &[u8] = b"floor";

struct JournalState {
    /// Sequence the next delta gets
    next_sequence: u64,
    /// Oldest retained sequence
    earliest: u64,
    last_snapshot: Option<Hash>,
    /// Why the journal cannot be trusted, if it cannot
    corrupt: Option<String>,
}

#[derive(Default)]
struct SubscriberRegistry {
    next_id: AtomicU64,
    cursors: Mutex<HashMap<u64, Arc<AtomicU64>>>,
}

impl SubscriberRegistry {
    /// Lowest sequence any live subscriber still needs
    fn floor(&self) -> Option<u64> {
        self.cursors
            .lock()
            .values()
            .map(|c| c.load(Ordering::SeqCst))
            .min()
    }
}

/// Append-only, strictly ordered log of journal deltas
pub struct Journal {
    db: sled::Db,
    deltas: sled::Tree,
    meta: sled::Tree,
    state: Mutex<JournalState>,
    /// 0 keeps every delta
    max_deltas: usize,
    latest: watch::Sender<u64>,
    subscribers: Arc<SubscriberRegistry>,
    #[cfg(test)]
    fail_next_append: std::sync::atomic::AtomicBool,
}

impl Journal {
    /// Open the journal stored at `path`
    pub fn open(path: &Path, max_deltas: usize) -> Result<Self> {
        let db = sled::open(path)?;
        Self::with_db(db, max_deltas)
    }

    /// Journal in a temporary database, removed on drop
    pub fn temporary(max_deltas: usize) -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::with_db(db, max_deltas)
    }

    fn with_db(db: sled::Db, max_deltas: usize) -> Result<Self> {
        let deltas = db.open_tree("deltas")?;
        let meta = db.open_tree("meta")?;

        let floor = meta
            .get(FLOOR_KEY)?
            .and_then(|v| key_sequence(&v))
            .unwrap_or(0);

        let mut first = None;
        let mut last = None;
        let mut corrupt = None;
        for item in deltas.iter().keys() {
            let key = item?;
            let Some(sequence) = key_sequence(&key) else {
                corrupt.get_or_insert_with(|| "malformed sequence key".to_string());
                continue;
            };
            if let Some(prev) = last {
                if sequence != prev + 1 && corrupt.is_none() {
                    corrupt = Some(format!(
                        "gap after sequence {}: next stored is {}",
                        prev, sequence
                    ));
                }
            }
            first.get_or_insert(sequence);
            last = Some(sequence);
        }

        let last_snapshot = match deltas.last()? {
            Some((_, value)) => match JournalDelta::decode(&value) {
                Ok(delta) => Some(delta.to),
                Err(e) => {
                    corrupt.get_or_insert_with(|| format!("undecodable last delta: {}", e));
                    None
                }
            },
            None => None,
        };

        let next_sequence = last.map(|s| s + 1).unwrap_or(floor).max(floor);
        let earliest = first.unwrap_or(next_sequence);

        if let Some(reason) = &corrupt {
            error!("Journal is corrupt ({}); repair required", reason);
        } else {
            info!(
                "Opened journal with {} deltas (next sequence {})",
                next_sequence - earliest,
                next_sequence
            );
        }

        let (latest, _) = watch::channel(next_sequence);
        Ok(Journal {
            db,
            deltas,
            meta,
            state: Mutex::new(JournalState {
                next_sequence,
                earliest,
                last_snapshot,
                corrupt,
            }),
            max_deltas,
            latest,
            subscribers: Arc::new(SubscriberRegistry::default()),
            #[cfg(test)]
            fail_next_append: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Append a delta, returning its sequence number
    pub fn add_delta(
        &self,
        from: Option<Hash>,
        to: Hash,
        changed_paths: Vec<String>,
    ) -> Result<u64> {
        let mut state = self.state.lock();
        self.append_locked(&mut state, from, to, changed_paths)
    }

    /// Record a local mutation against `snapshot`
    pub fn record_change(&self, snapshot: Hash, changed_paths: Vec<String>) -> Result<u64> {
        self.add_delta(Some(snapshot), snapshot, changed_paths)
    }

    /// Append a transition to `snapshot` unless the journal already ends
    /// there. Returns the new sequence, if one was appended.
    pub fn ensure_snapshot(&self, snapshot: Hash) -> Result<Option<u64>> {
        let mut state = self.state.lock();
        if state.last_snapshot == Some(snapshot) {
            debug!("Journal already at snapshot {}", snapshot);
            return Ok(None);
        }
        let from = state.last_snapshot;
        self.append_locked(&mut state, from, snapshot, Vec::new())
            .map(Some)
    }

    fn append_locked(
        &self,
        state: &mut JournalState,
        from: Option<Hash>,
        to: Hash,
        changed_paths: Vec<String>,
    ) -> Result<u64> {
        if let Some(reason) = &state.corrupt {
            return Err(Error::JournalCorrupt(reason.clone()));
        }

        let sequence = state.next_sequence;
        let delta = JournalDelta {
            sequence,
            from,
            to,
            time: chrono::Utc::now(),
            changed_paths,
        };
        if let Err(e) = self.store_delta(&delta) {
            // The change happened but has no delta: history has a hole
            let reason = format!("delta {} could not be stored: {}", sequence, e);
            error!("Journal poisoned: {}", reason);
            state.corrupt = Some(reason);
            return Err(e);
        }

        state.next_sequence += 1;
        state.last_snapshot = Some(to);
        self.latest.send_replace(state.next_sequence);
        debug!("Journal delta {}: {:?}", sequence, delta.changed_paths);

        self.prune_locked(state);
        Ok(sequence)
    }

    fn store_delta(&self, delta: &JournalDelta) -> Result<()> {
        if self.take_injected_failure() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected append failure",
            )));
        }
        self.deltas.insert(sequence_key(delta.sequence), delta.encode()?)?;
        Ok(())
    }

    /// Make the next append fail as if the database write failed
    #[cfg(test)]
    pub(crate) fn fail_next_append(&self) {
        self.fail_next_append.store(true, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn take_injected_failure(&self) -> bool {
        self.fail_next_append.swap(false, Ordering::SeqCst)
    }

    #[cfg(not(test))]
    fn take_injected_failure(&self) -> bool {
        false
    }

    /// Retention pruning, in batches of a tenth of the limit
    fn prune_locked(&self, state: &mut JournalState) {
        if self.max_deltas == 0 {
            return;
        }
        let retained = state.next_sequence - state.earliest;
        let slack = (self.max_deltas / 10).max(1) as u64;
        if retained <= self.max_deltas as u64 + slack {
            return;
        }

        let target = state.next_sequence - self.max_deltas as u64;
        match self.truncate_locked(state, target) {
            Ok(0) => {}
            Ok(removed) => info!(
                "Pruned {} journal deltas, earliest is now {}",
                removed, state.earliest
            ),
            Err(e) => warn!("Journal pruning failed: {}", e),
        }
    }

    /// Drop deltas older than `sequence`. Never passes the cursor of a live
    /// subscriber. Returns the number of deltas removed.
    pub fn truncate_before(&self, sequence: u64) -> Result<usize> {
        let mut state = self.state.lock();
        self.truncate_locked(&mut state, sequence)
    }

    fn truncate_locked(&self, state: &mut JournalState, sequence: u64) -> Result<usize> {
        let mut target = sequence.min(state.next_sequence);
        if let Some(floor) = self.subscribers.floor() {
            target = target.min(floor);
        }
        if target <= state.earliest {
            return Ok(0);
        }

        let mut batch = sled::Batch::default();
        for seq in state.earliest..target {
            batch.remove(sequence_key(seq).to_vec());
        }
        self.deltas.apply_batch(batch)?;
        self.meta.insert(FLOOR_KEY, sequence_key(target).to_vec())?;

        let removed = (target - state.earliest) as usize;
        state.earliest = target;
        Ok(removed)
    }

    /// Lazy range of every retained delta with sequence >= `sequence`,
    /// ending at the last delta appended before this call
    pub fn get_deltas_since(&self, sequence: u64) -> Result<DeltaRange> {
        let state = self.state.lock();
        if let Some(reason) = &state.corrupt {
            return Err(Error::JournalCorrupt(reason.clone()));
        }
        if sequence < state.earliest {
            return Err(Error::JournalTruncated {
                requested: sequence,
                earliest: state.earliest,
            });
        }
        Ok(DeltaRange {
            deltas: self.deltas.clone(),
            start: sequence,
            next: sequence,
            end: state.next_sequence.max(sequence),
        })
    }

    /// Follow new deltas starting after the current end of the journal
    pub fn subscribe(&self) -> Subscription {
        let next = self.state.lock().next_sequence;
        self.subscribe_from(next)
    }

    /// Follow deltas starting at `sequence`. Retention pruning will not
    /// pass the subscription's cursor while it is alive.
    pub fn subscribe_from(&self, sequence: u64) -> Subscription {
        let id = self.subscribers.next_id.fetch_add(1, Ordering::SeqCst);
        let cursor = Arc::new(AtomicU64::new(sequence));
        self.subscribers.cursors.lock().insert(id, cursor.clone());
        Subscription {
            id,
            cursor,
            receiver: self.latest.subscribe(),
            registry: self.subscribers.clone(),
        }
    }

    /// Forget the damaged history and accept appends again. Sequence
    /// numbers keep counting from where they were.
    pub fn repair(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.corrupt.is_none() {
            return Ok(());
        }
        self.deltas.clear()?;
        self.meta
            .insert(FLOOR_KEY, sequence_key(state.next_sequence).to_vec())?;
        state.earliest = state.next_sequence;
        state.last_snapshot = None;
        state.corrupt = None;
        warn!(
            "Journal repaired; history discarded, next sequence {}",
            state.next_sequence
        );
        Ok(())
    }

    /// Number of retained deltas
    pub fn len(&self) -> u64 {
        let state = self.state.lock();
        state.next_sequence - state.earliest
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sequence of the newest delta, if any is retained
    pub fn latest_sequence(&self) -> Option<u64> {
        let state = self.state.lock();
        (state.next_sequence > state.earliest).then(|| state.next_sequence - 1)
    }

    pub fn next_sequence(&self) -> u64 {
        self.state.lock().next_sequence
    }

    pub fn earliest_sequence(&self) -> u64 {
        self.state.lock().earliest
    }

    /// Snapshot the newest delta points at
    pub fn last_snapshot(&self) -> Option<Hash> {
        self.state.lock().last_snapshot
    }

    pub fn is_corrupt(&self) -> bool {
        self.state.lock().corrupt.is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.cursors.lock().len()
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

/// Lazy, finite, restartable iterator over a range of deltas
pub struct DeltaRange {
    deltas: sled::Tree,
    start: u64,
    next: u64,
    end: u64,
}

impl DeltaRange {
    /// Go back to the first delta of the range
    pub fn restart(&mut self) {
        self.next = self.start;
    }

    /// Deltas not yet yielded
    pub fn remaining(&self) -> u64 {
        self.end - self.next
    }

    fn earliest_stored(&self) -> u64 {
        self.deltas
            .first()
            .ok()
            .flatten()
            .and_then(|(k, _)| key_sequence(&k))
            .unwrap_or(self.end)
    }
}

impl Iterator for DeltaRange {
    type Item = Result<JournalDelta>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let sequence = self.next;

        let item = match self.deltas.get(sequence_key(sequence)) {
            Ok(Some(value)) => match JournalDelta::decode(&value) {
                Ok(delta) if delta.sequence == sequence => Ok(delta),
                Ok(delta) => Err(Error::JournalCorrupt(format!(
                    "delta stored at {} claims sequence {}",
                    sequence, delta.sequence
                ))),
                Err(e) => Err(Error::JournalCorrupt(format!(
                    "undecodable delta {}: {}",
                    sequence, e
                ))),
            },
            Ok(None) => Err(Error::JournalTruncated {
                requested: sequence,
                earliest: self.earliest_stored(),
            }),
            Err(e) => Err(e.into()),
        };

        match item {
            Ok(delta) => {
                self.next += 1;
                Some(Ok(delta))
            }
            Err(e) => {
                self.next = self.end;
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining() as usize))
    }
}

/// Live follower of the journal
pub struct Subscription {
    id: u64,
    cursor: Arc<AtomicU64>,
    receiver: watch::Receiver<u64>,
    registry: Arc<SubscriberRegistry>,
}

impl Subscription {
    /// First sequence this subscriber has not consumed
    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::SeqCst)
    }

    /// Mark every delta up to and including `sequence` as consumed
    pub fn acknowledge(&self, sequence: u64) {
        self.cursor.fetch_max(sequence + 1, Ordering::SeqCst);
    }

    /// Wait until the journal holds a delta past the cursor. Returns the
    /// journal's next sequence number.
    pub async fn wait_for_changes(&mut self) -> Result<u64> {
        loop {
            let latest = *self.receiver.borrow_and_update();
            if latest > self.cursor() {
                return Ok(latest);
            }
            self.receiver
                .changed()
                .await
                .map_err(|_| Error::Internal("journal closed".to_string()))?;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.cursors.lock().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn snap(n: u8) -> Hash {
        Hash::of(&[n])
    }

    fn sequences(range: DeltaRange) -> Vec<u64> {
        range.map(|d| d.unwrap().sequence).collect()
    }

    #[test]
    fn test_sequences_start_at_zero() {
        let journal = Journal::temporary(0).unwrap();
        assert_eq!(journal.ensure_snapshot(snap(1)).unwrap(), Some(0));
        assert_eq!(journal.record_change(snap(1), vec!["a".into()]).unwrap(), 1);
        assert_eq!(journal.latest_sequence(), Some(1));
        assert_eq!(journal.len(), 2);
    }

    #[test]
    fn test_ensure_snapshot_is_idempotent() {
        let journal = Journal::temporary(0).unwrap();
        journal.ensure_snapshot(snap(1)).unwrap();
        assert_eq!(journal.ensure_snapshot(snap(1)).unwrap(), None);

        let seq = journal.ensure_snapshot(snap(2)).unwrap().unwrap();
        let delta = journal.get_deltas_since(seq).unwrap().next().unwrap().unwrap();
        assert_eq!(delta.from, Some(snap(1)));
        assert_eq!(delta.to, snap(2));
    }

    #[test]
    fn test_range_is_tail_of_full_history() {
        let journal = Journal::temporary(0).unwrap();
        journal.ensure_snapshot(snap(1)).unwrap();
        for i in 0..9 {
            journal.record_change(snap(1), vec![format!("f{}", i)]).unwrap();
        }

        let all: Vec<_> = journal
            .get_deltas_since(0)
            .unwrap()
            .map(|d| d.unwrap())
            .collect();
        let tail: Vec<_> = journal
            .get_deltas_since(4)
            .unwrap()
            .map(|d| d.unwrap())
            .collect();
        assert_eq!(all.len(), 10);
        assert_eq!(&all[4..], &tail[..]);
    }

    #[test]
    fn test_range_is_finite_and_restartable() {
        let journal = Journal::temporary(0).unwrap();
        journal.ensure_snapshot(snap(1)).unwrap();
        journal.record_change(snap(1), vec![]).unwrap();

        let mut range = journal.get_deltas_since(0).unwrap();
        journal.record_change(snap(1), vec![]).unwrap();

        assert_eq!(range.by_ref().count(), 2);
        assert!(range.next().is_none());
        range.restart();
        assert_eq!(range.remaining(), 2);
    }

    #[test]
    fn test_truncate_before() {
        let journal = Journal::temporary(0).unwrap();
        journal.ensure_snapshot(snap(1)).unwrap();
        for _ in 0..5 {
            journal.record_change(snap(1), vec![]).unwrap();
        }

        assert_eq!(journal.truncate_before(3).unwrap(), 3);
        assert_eq!(journal.earliest_sequence(), 3);
        assert!(matches!(
            journal.get_deltas_since(1),
            Err(Error::JournalTruncated { requested: 1, earliest: 3 })
        ));
        assert_eq!(sequences(journal.get_deltas_since(3).unwrap()), vec![3, 4, 5]);
    }

    #[test]
    fn test_retention_respects_subscribers() {
        let journal = Journal::temporary(10).unwrap();
        journal.ensure_snapshot(snap(1)).unwrap();
        let sub = journal.subscribe_from(0);

        for _ in 0..50 {
            journal.record_change(snap(1), vec![]).unwrap();
        }
        assert_eq!(journal.earliest_sequence(), 0);

        sub.acknowledge(29);
        for _ in 0..5 {
            journal.record_change(snap(1), vec![]).unwrap();
        }
        assert_eq!(journal.earliest_sequence(), 30);

        drop(sub);
        for _ in 0..20 {
            journal.record_change(snap(1), vec![]).unwrap();
        }
        assert!(journal.len() <= 11);
    }

    #[test]
    fn test_concurrent_appends_are_gapless() {
        let journal = Arc::new(Journal::temporary(0).unwrap());
        journal.ensure_snapshot(snap(1)).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let journal = journal.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        journal
                            .record_change(snap(1), vec![format!("t{}/{}", t, i)])
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let seqs = sequences(journal.get_deltas_since(0).unwrap());
        assert_eq!(seqs, (0..201).collect::<Vec<_>>());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempdir().unwrap();
        {
            let journal = Journal::open(dir.path(), 0).unwrap();
            journal.ensure_snapshot(snap(1)).unwrap();
            journal.record_change(snap(1), vec!["x".into()]).unwrap();
            journal.flush().unwrap();
        }

        let journal = Journal::open(dir.path(), 0).unwrap();
        assert_eq!(journal.next_sequence(), 2);
        assert_eq!(journal.last_snapshot(), Some(snap(1)));
        assert_eq!(journal.ensure_snapshot(snap(1)).unwrap(), None);
    }

    #[test]
    fn test_gap_poisons_until_repair() {
        let dir = tempdir().unwrap();
        {
            let journal = Journal::open(dir.path(), 0).unwrap();
            journal.ensure_snapshot(snap(1)).unwrap();
            journal.record_change(snap(1), vec![]).unwrap();
            journal.record_change(snap(1), vec![]).unwrap();
            journal.flush().unwrap();
        }
        {
            let db = sled::open(dir.path()).unwrap();
            db.open_tree("deltas").unwrap().remove(sequence_key(1)).unwrap();
            db.flush().unwrap();
        }

        let journal = Journal::open(dir.path(), 0).unwrap();
        assert!(journal.is_corrupt());
        assert!(matches!(journal.get_deltas_since(0), Err(Error::JournalCorrupt(_))));
        let err = journal.record_change(snap(1), vec![]).unwrap_err();
        assert!(err.is_fatal());

        journal.repair().unwrap();
        assert_eq!(journal.ensure_snapshot(snap(1)).unwrap(), Some(3));
        assert_eq!(sequences(journal.get_deltas_since(3).unwrap()), vec![3]);
    }

    #[test]
    fn test_failed_append_poisons_until_repair() {
        let journal = Journal::temporary(0).unwrap();
        journal.ensure_snapshot(snap(1)).unwrap();
        journal.record_change(snap(1), vec!["a".into()]).unwrap();

        journal.fail_next_append();
        assert!(journal.record_change(snap(1), vec!["lost".into()]).is_err());

        // Readers must not see a history missing the lost change
        assert!(journal.is_corrupt());
        assert!(matches!(journal.get_deltas_since(0), Err(Error::JournalCorrupt(_))));
        assert!(matches!(
            journal.record_change(snap(1), vec!["b".into()]),
            Err(Error::JournalCorrupt(_))
        ));

        journal.repair().unwrap();
        assert_eq!(journal.record_change(snap(1), vec![]).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_subscription_wakes_on_append() {
        let journal = Arc::new(Journal::temporary(0).unwrap());
        journal.ensure_snapshot(snap(1)).unwrap();
        let mut sub = journal.subscribe();
        assert_eq!(sub.cursor(), 1);

        let writer = journal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.record_change(snap(1), vec!["new".into()]).unwrap();
        });

        let next = tokio::time::timeout(Duration::from_secs(5), sub.wait_for_changes())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next, 2);

        let delta = journal
            .get_deltas_since(sub.cursor())
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(delta.changed_paths, vec!["new".to_string()]);
        sub.acknowledge(delta.sequence);
        assert_eq!(sub.cursor(), 2);
    }
}
