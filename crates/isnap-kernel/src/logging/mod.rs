//! Hash-chained audit trail of snapshot transitions.
//!
//! STALE and REVERTED snapshots stay visible here after they stop being
//! restorable, and after compaction drops them from the registry document.
//! The registry only keeps the [`ChainHead`]; records go to an append-only
//! log in the store. The chain lets an operator prove neither was edited by
//! hand.

use crate::types::{SnapshotEvent, SnapshotId, SnapshotState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub snapshot: SnapshotId,
    pub event: SnapshotEvent,
    pub from: SnapshotState,
    pub to: SnapshotState,
    pub correlation: Option<Uuid>,
    pub prev_hash: String,
    pub hash: String,
}

/// Where a chain first fails verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityViolation {
    pub seq: u64,
}

/// Tip of the chain: what the next record links to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainHead {
    pub next_seq: u64,
    pub hash: String,
}

impl Default for ChainHead {
    fn default() -> Self {
        Self {
            next_seq: 0,
            hash: genesis(),
        }
    }
}

impl ChainHead {
    /// Builds the next record and advances the head past it.
    pub fn link(
        &mut self,
        snapshot: SnapshotId,
        event: SnapshotEvent,
        from: SnapshotState,
        to: SnapshotState,
        correlation: Option<Uuid>,
    ) -> TransitionRecord {
        let mut record = TransitionRecord {
            seq: self.next_seq,
            at: Utc::now(),
            snapshot,
            event,
            from,
            to,
            correlation,
            prev_hash: self.hash.clone(),
            hash: String::new(),
        };
        record.hash = compute_hash(&record);
        self.next_seq += 1;
        self.hash = record.hash.clone();
        record
    }
}

/// A loaded copy of the audit trail
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditLog {
    records: Vec<TransitionRecord>,
}

impl AuditLog {
    pub fn from_records(records: Vec<TransitionRecord>) -> Self {
        Self { records }
    }

    pub fn append(
        &mut self,
        snapshot: SnapshotId,
        event: SnapshotEvent,
        from: SnapshotState,
        to: SnapshotState,
        correlation: Option<Uuid>,
    ) -> u64 {
        let mut head = self.head();
        let record = head.link(snapshot, event, from, to, correlation);
        let seq = record.seq;
        self.records.push(record);
        seq
    }

    /// Head the trail currently ends at.
    pub fn head(&self) -> ChainHead {
        self.records
            .last()
            .map_or_else(ChainHead::default, |r| ChainHead {
                next_seq: r.seq + 1,
                hash: r.hash.clone(),
            })
    }

    pub fn records(&self) -> &[TransitionRecord] {
        &self.records
    }

    pub fn for_snapshot(&self, snapshot: SnapshotId) -> Vec<TransitionRecord> {
        self.records
            .iter()
            .filter(|r| r.snapshot == snapshot)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn verify_integrity(&self) -> Result<(), IntegrityViolation> {
        let mut prev = genesis();
        for (i, r) in self.records.iter().enumerate() {
            if r.seq != i as u64 || r.prev_hash != prev || r.hash != compute_hash(r) {
                return Err(IntegrityViolation { seq: i as u64 });
            }
            prev = r.hash.clone();
        }
        Ok(())
    }

    /// Verifies the chain and that it ends exactly at `head`, so records
    /// dropped from the tail are caught too.
    pub fn verify_against(&self, head: &ChainHead) -> Result<(), IntegrityViolation> {
        self.verify_integrity()?;
        if self.head() != *head {
            return Err(IntegrityViolation {
                seq: self.records.len() as u64,
            });
        }
        Ok(())
    }
}

fn genesis() -> String {
    hex::encode([0u8; 32])
}

fn compute_hash(record: &TransitionRecord) -> String {
    let mut hasher = Sha256::new();
    hasher.update(record.seq.to_le_bytes());
    hasher.update(record.at.timestamp_micros().to_le_bytes());
    hasher.update(record.snapshot.0.to_le_bytes());
    hasher.update(record.event.to_string().as_bytes());
    hasher.update([0]);
    hasher.update(record.from.to_string().as_bytes());
    hasher.update([0]);
    hasher.update(record.to.to_string().as_bytes());
    hasher.update([0]);
    if let Some(id) = record.correlation {
        hasher.update(id.as_bytes());
    }
    hasher.update(record.prev_hash.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_verifies_and_detects_tampering() {
        let mut log = AuditLog::default();
        log.append(
            SnapshotId(1),
            SnapshotEvent::Catalog,
            SnapshotState::Created,
            SnapshotState::Cataloged,
            None,
        );
        log.append(
            SnapshotId(1),
            SnapshotEvent::Mount,
            SnapshotState::Cataloged,
            SnapshotState::Mounted,
            Some(Uuid::new_v4()),
        );
        assert!(log.verify_integrity().is_ok());

        let head = log.head();
        assert_eq!(head.next_seq, 2);
        assert!(log.verify_against(&head).is_ok());

        let mut truncated = log.clone();
        truncated.records.pop();
        assert!(truncated.verify_integrity().is_ok());
        assert_eq!(
            truncated.verify_against(&head),
            Err(IntegrityViolation { seq: 1 })
        );

        log.records[1].to = SnapshotState::Deleted;
        assert_eq!(log.verify_integrity(), Err(IntegrityViolation { seq: 1 }));
    }
}
