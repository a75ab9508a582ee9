//! Journal delta records

use crate::model::Hash;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One ordered, immutable journal record.
///
/// Snapshot transitions have `from != to`; local mutations keep the
/// snapshot and list the paths they touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalDelta {
    /// Position in the journal, gapless from the first retained delta
    pub sequence: u64,
    /// Snapshot before this delta (None for the first mount)
    pub from: Option<Hash>,
    /// Snapshot after this delta
    pub to: Hash,
    pub time: DateTime<Utc>,
    /// Mount-relative paths changed by the delta
    pub changed_paths: Vec<String>,
}

impl JournalDelta {
    pub fn is_snapshot_transition(&self) -> bool {
        self.from != Some(self.to)
    }

    pub(crate) fn encode(&self) -> crate::error::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub(crate) fn decode(data: &[u8]) -> crate::error::Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

pub(crate) fn sequence_key(sequence: u64) -> [u8; 8] {
    sequence.to_be_bytes()
}

pub(crate) fn key_sequence(key: &[u8]) -> Option<u64> {
    <[u8; 8]>::try_from(key).ok().map(u64::from_be_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_sort_by_sequence() {
        assert!(sequence_key(2) < sequence_key(10));
        assert!(sequence_key(255) < sequence_key(256));
        assert_eq!(key_sequence(&sequence_key(77)), Some(77));
        assert_eq!(key_sequence(b"short"), None);
    }

    #[test]
    fn test_transition_kind() {
        let h = Hash::of(b"snap");
        let mut delta = JournalDelta {
            sequence: 0,
            from: None,
            to: h,
            time: Utc::now(),
            changed_paths: vec![],
        };
        assert!(delta.is_snapshot_transition());

        delta.from = Some(h);
        delta.changed_paths.push("a/b".into());
        assert!(!delta.is_snapshot_transition());
    }
}
