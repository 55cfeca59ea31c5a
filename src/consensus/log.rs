use std::collections::BTreeMap;

use crate::common::crypto::Digest;
use super::message::{PrePrepare, PreparedProof};
use super::types::{Seqno, View};

/// Progress of one sequence number in the current view.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub enum Phase {
    #[default]
    Idle,
    PrePrepared,
    Prepared,
    Committed,
    Executed,
}

#[derive(Clone, Debug, Default)]
pub struct Slot {
    pub phase: Phase,
    pub pre_prepare: Option<PrePrepare>,
    /// Content digest of `pre_prepare`.
    pub digest: Option<Digest>,
    /// The pre-prepare this replica sent a prepare for. Survives execution,
    /// so at most one digest is ever endorsed per (view, seqno).
    pub vote: Option<(View, Digest)>,
}

impl Slot {
    pub fn accepted(&self, view: View) -> Option<&PrePrepare> {
        self.pre_prepare.as_ref().filter(|pp| pp.view == view)
    }

    pub fn voted(&self, view: View) -> Option<Digest> {
        self.vote.filter(|(v, _)| *v == view).map(|(_, digest)| digest)
    }
}

/// Sequence numbers the replica is currently willing to work on: `(low, high]`.
///
/// `low` is the last stable checkpoint and only moves forward when a newer
/// one becomes stable.
#[derive(Debug)]
pub struct Log {
    pub low: Seqno,
    pub window: u64,
    pub last_executed: Seqno,
    slots: BTreeMap<Seqno, Slot>,
    /// Highest-view prepared certificate per seqno, kept across views for
    /// view-change evidence.
    proofs: BTreeMap<Seqno, PreparedProof>,
}

impl Log {
    pub fn new(window: u64) -> Self {
        Log {
            low: 0,
            window,
            last_executed: 0,
            slots: BTreeMap::new(),
            proofs: BTreeMap::new(),
        }
    }

    pub fn high(&self) -> Seqno {
        self.low + self.window
    }

    pub fn in_window(&self, seqno: Seqno) -> bool {
        seqno > self.low && seqno <= self.high()
    }

    pub fn slot(&self, seqno: Seqno) -> Option<&Slot> {
        self.slots.get(&seqno)
    }

    pub fn slot_mut(&mut self, seqno: Seqno) -> &mut Slot {
        self.slots.entry(seqno).or_default()
    }

    pub fn phase(&self, seqno: Seqno) -> Phase {
        self.slots.get(&seqno).map(|s| s.phase).unwrap_or_default()
    }

    /// The next slot ready to run, if its predecessor has run.
    pub fn next_committed(&self) -> Option<&Slot> {
        self.slots
            .get(&(self.last_executed + 1))
            .filter(|s| s.phase == Phase::Committed)
    }

    pub fn record_proof(&mut self, proof: PreparedProof) {
        let seqno = proof.seqno();
        let newer = self
            .proofs
            .get(&seqno)
            .map_or(true, |old| old.view() <= proof.view());
        if newer {
            self.proofs.insert(seqno, proof);
        }
    }

    pub fn proofs(&self) -> impl Iterator<Item = &PreparedProof> {
        self.proofs.values()
    }

    /// Moves the window up to a new stable checkpoint.
    pub fn advance(&mut self, stable: Seqno) {
        if stable <= self.low {
            return;
        }
        self.low = stable;
        self.slots = self.slots.split_off(&(stable + 1));
        self.proofs = self.proofs.split_off(&(stable + 1));
    }

    /// Forgets per-view progress of everything not yet executed. Prepared
    /// proofs survive.
    pub fn reset_unexecuted(&mut self) {
        self.slots.retain(|_, slot| slot.phase == Phase::Executed);
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn proof(view: View, seqno: Seqno) -> PreparedProof {
        PreparedProof {
            pre_prepare: PrePrepare::new(view, seqno, Vec::new(), Bytes::new(), true),
            prepares: Vec::new(),
        }
    }

    #[test]
    fn test_window_bounds() {
        let mut log = Log::new(256);
        assert!(!log.in_window(0));
        assert!(log.in_window(1));
        assert!(log.in_window(256));
        assert!(!log.in_window(257));

        log.advance(128);
        assert!(!log.in_window(128));
        assert!(log.in_window(384));
        assert!(!log.in_window(385));
    }

    #[test]
    fn test_advance_discards_old_slots() {
        let mut log = Log::new(16);
        for seqno in 1..=6 {
            log.slot_mut(seqno).phase = Phase::Executed;
            log.record_proof(proof(0, seqno));
        }
        log.advance(4);
        assert_eq!(log.len(), 2);
        assert_eq!(log.proofs().count(), 2);

        // a stale checkpoint never moves the window back
        log.advance(2);
        assert_eq!(log.low, 4);
    }

    #[test]
    fn test_proof_keeps_highest_view() {
        let mut log = Log::new(16);
        log.record_proof(proof(2, 5));
        log.record_proof(proof(1, 5));
        assert_eq!(log.proofs().next().map(|p| p.view()), Some(2));
        log.record_proof(proof(3, 5));
        assert_eq!(log.proofs().next().map(|p| p.view()), Some(3));
    }

    #[test]
    fn test_execution_waits_for_predecessor() {
        let mut log = Log::new(16);
        log.slot_mut(2).phase = Phase::Committed;
        assert!(log.next_committed().is_none());

        log.slot_mut(1).phase = Phase::Committed;
        assert!(log.next_committed().is_some());

        log.reset_unexecuted();
        assert!(log.is_empty());
    }
}
