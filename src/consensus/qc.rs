use std::collections::{BTreeMap, HashMap, VecDeque};

use tracing::warn;

use super::message::{Checkpoint, Commit, MessageKind, Prepare};
use super::types::{Seqno, View};
use crate::common::crypto::Digest;

/*
    A quorum certificate over ⟨kind, view, seqno, digest⟩ is the set of
    matching messages from distinct replicas.

    Each sender contributes at most one message per slot: the first one seen.
    A later message from the same sender with the same digest is a duplicate,
    one with a different digest is equivocation. Equivocation is recorded as
    evidence and never changes the tally.
*/

const MAX_EVIDENCE: usize = 256;

/// A message that counts toward a certificate.
pub trait Vote: Clone {
    const VOTE_KIND: MessageKind;

    fn sender(&self) -> usize;
    fn voted_digest(&self) -> Digest;
}

impl Vote for Prepare {
    const VOTE_KIND: MessageKind = MessageKind::Prepare;

    fn sender(&self) -> usize {
        self.replica
    }

    fn voted_digest(&self) -> Digest {
        self.digest
    }
}

impl Vote for Commit {
    const VOTE_KIND: MessageKind = MessageKind::Commit;

    fn sender(&self) -> usize {
        self.replica
    }

    fn voted_digest(&self) -> Digest {
        self.digest
    }
}

impl Vote for Checkpoint {
    const VOTE_KIND: MessageKind = MessageKind::Checkpoint;

    fn sender(&self) -> usize {
        self.replica
    }

    fn voted_digest(&self) -> Digest {
        self.state_digest
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AddOutcome {
    Inserted,
    Duplicate,
    Equivocation,
}

/// Two differing messages from one sender for one slot.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Equivocation {
    pub kind: MessageKind,
    pub sender: usize,
    pub view: View,
    pub seqno: Seqno,
    pub first: Digest,
    pub second: Digest,
}

#[derive(Clone, Debug)]
pub struct Certificate<M> {
    votes: HashMap<usize, M>,
}

impl<M> Default for Certificate<M> {
    fn default() -> Self {
        Certificate {
            votes: HashMap::new(),
        }
    }
}

impl<M: Vote> Certificate<M> {
    pub fn add(&mut self, vote: M) -> (AddOutcome, Option<Digest>) {
        match self.votes.get(&vote.sender()) {
            None => {
                self.votes.insert(vote.sender(), vote);
                (AddOutcome::Inserted, None)
            }
            Some(first) if first.voted_digest() == vote.voted_digest() => (AddOutcome::Duplicate, None),
            Some(first) => (AddOutcome::Equivocation, Some(first.voted_digest())),
        }
    }

    pub fn count(&self, digest: &Digest) -> usize {
        self.votes.values().filter(|v| v.voted_digest() == *digest).count()
    }

    pub fn count_excluding(&self, digest: &Digest, exclude: usize) -> usize {
        self.votes
            .values()
            .filter(|v| v.sender() != exclude && v.voted_digest() == *digest)
            .count()
    }

    pub fn matching(&self, digest: &Digest) -> impl Iterator<Item = &M> + '_ {
        let digest = *digest;
        self.votes.values().filter(move |v| v.voted_digest() == digest)
    }

    /// The digest with at least `threshold` votes, if any.
    pub fn quorum_digest(&self, threshold: usize) -> Option<Digest> {
        let mut tally: HashMap<Digest, usize> = HashMap::new();
        for vote in self.votes.values() {
            *tally.entry(vote.voted_digest()).or_default() += 1;
        }
        tally
            .into_iter()
            .find(|(_, count)| *count >= threshold)
            .map(|(digest, _)| digest)
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }
}

/// Per-slot certificates owned by one replica.
#[derive(Debug)]
pub struct CertificateTracker {
    pub f: usize,
    pub local: usize,
    prepares: BTreeMap<(Seqno, View), Certificate<Prepare>>,
    commits: BTreeMap<(Seqno, View), Certificate<Commit>>,
    checkpoints: BTreeMap<Seqno, Certificate<Checkpoint>>,
    evidence: VecDeque<Equivocation>,
}

impl CertificateTracker {
    pub fn new(f: usize, local: usize) -> Self {
        CertificateTracker {
            f,
            local,
            prepares: BTreeMap::new(),
            commits: BTreeMap::new(),
            checkpoints: BTreeMap::new(),
            evidence: VecDeque::new(),
        }
    }

    pub fn add_prepare(&mut self, prepare: Prepare) -> AddOutcome {
        let (view, seqno) = (prepare.view, prepare.seqno);
        let certificate = self.prepares.entry((seqno, view)).or_default();
        Self::record(certificate, prepare, view, seqno, &mut self.evidence)
    }

    pub fn add_commit(&mut self, commit: Commit) -> AddOutcome {
        let (view, seqno) = (commit.view, commit.seqno);
        let certificate = self.commits.entry((seqno, view)).or_default();
        Self::record(certificate, commit, view, seqno, &mut self.evidence)
    }

    pub fn add_checkpoint(&mut self, checkpoint: Checkpoint) -> AddOutcome {
        let seqno = checkpoint.seqno;
        let certificate = self.checkpoints.entry(seqno).or_default();
        Self::record(certificate, checkpoint, 0, seqno, &mut self.evidence)
    }

    fn record<M: Vote>(
        certificate: &mut Certificate<M>,
        vote: M,
        view: View,
        seqno: Seqno,
        evidence: &mut VecDeque<Equivocation>,
    ) -> AddOutcome {
        let sender = vote.sender();
        let second = vote.voted_digest();
        let (outcome, first) = certificate.add(vote);
        if let Some(first) = first {
            warn!(kind = ?M::VOTE_KIND, sender, view, seqno, "equivocation");
            if evidence.len() == MAX_EVIDENCE {
                evidence.pop_front();
            }
            evidence.push_back(Equivocation {
                kind: M::VOTE_KIND,
                sender,
                view,
                seqno,
                first,
                second,
            });
        }
        outcome
    }

    /// `2f` matching prepares from replicas other than the local one.
    pub fn has_prepared(&self, view: View, seqno: Seqno, digest: &Digest) -> bool {
        self.prepares
            .get(&(seqno, view))
            .is_some_and(|c| c.count_excluding(digest, self.local) >= 2 * self.f)
    }

    /// `2f + 1` matching commits, the local one included.
    pub fn has_committed(&self, view: View, seqno: Seqno, digest: &Digest) -> bool {
        self.commits
            .get(&(seqno, view))
            .is_some_and(|c| c.count(digest) >= 2 * self.f + 1)
    }

    /// The state digest `2f + 1` replicas agree on at `seqno`.
    pub fn stable_checkpoint(&self, seqno: Seqno) -> Option<Digest> {
        self.checkpoints
            .get(&seqno)
            .and_then(|c| c.quorum_digest(2 * self.f + 1))
    }

    pub fn matching_prepares(&self, view: View, seqno: Seqno, digest: &Digest) -> Vec<Prepare> {
        self.prepares
            .get(&(seqno, view))
            .map(|c| c.matching(digest).cloned().collect())
            .unwrap_or_default()
    }

    /// Drops everything at or below a stable checkpoint.
    pub fn collect_garbage(&mut self, stable: Seqno) {
        self.prepares = self.prepares.split_off(&(stable + 1, 0));
        self.commits = self.commits.split_off(&(stable + 1, 0));
        self.checkpoints = self.checkpoints.split_off(&(stable + 1));
    }

    /// Drops prepare and commit certificates from views before `view`.
    pub fn retain_view(&mut self, view: View) {
        self.prepares.retain(|(_, v), _| *v >= view);
        self.commits.retain(|(_, v), _| *v >= view);
    }

    pub fn evidence(&self) -> impl Iterator<Item = &Equivocation> {
        self.evidence.iter()
    }

    pub fn len(&self) -> usize {
        self.prepares.len() + self.commits.len() + self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: Digest = [1; 32];
    const OTHER: Digest = [2; 32];

    fn prepare(replica: usize, digest: Digest) -> Prepare {
        Prepare::new(0, 1, digest, replica, true)
    }

    fn commit(replica: usize, digest: Digest) -> Commit {
        Commit::new(0, 1, digest, replica, false)
    }

    #[test]
    fn test_prepare_quorum_is_exactly_2f_others() {
        // n = 7, f = 2, local replica 3
        let mut tracker = CertificateTracker::new(2, 3);
        tracker.add_prepare(prepare(3, DIGEST));
        tracker.add_prepare(prepare(0, DIGEST));
        tracker.add_prepare(prepare(1, DIGEST));
        tracker.add_prepare(prepare(2, OTHER));
        tracker.add_prepare(prepare(4, DIGEST));
        assert!(!tracker.has_prepared(0, 1, &DIGEST));

        tracker.add_prepare(prepare(5, DIGEST));
        assert!(tracker.has_prepared(0, 1, &DIGEST));

        tracker.add_prepare(prepare(6, DIGEST));
        assert!(tracker.has_prepared(0, 1, &DIGEST));
        assert!(!tracker.has_prepared(1, 1, &DIGEST));
        assert_eq!(tracker.matching_prepares(0, 1, &DIGEST).len(), 6);
    }

    #[test]
    fn test_duplicates_never_double_count() {
        let mut tracker = CertificateTracker::new(1, 0);
        assert_eq!(tracker.add_prepare(prepare(1, DIGEST)), AddOutcome::Inserted);
        assert_eq!(tracker.add_prepare(prepare(1, DIGEST)), AddOutcome::Duplicate);
        assert!(!tracker.has_prepared(0, 1, &DIGEST));
    }

    #[test]
    fn test_equivocating_commits_keep_first_digest() {
        let mut tracker = CertificateTracker::new(1, 0);
        tracker.add_commit(commit(0, DIGEST));
        tracker.add_commit(commit(1, DIGEST));
        assert_eq!(tracker.add_commit(commit(2, OTHER)), AddOutcome::Inserted);
        assert_eq!(tracker.add_commit(commit(2, DIGEST)), AddOutcome::Equivocation);

        assert!(!tracker.has_committed(0, 1, &DIGEST));
        let evidence: Vec<_> = tracker.evidence().collect();
        assert_eq!(evidence.len(), 1);
        assert_eq!((evidence[0].sender, evidence[0].first, evidence[0].second), (2, OTHER, DIGEST));

        tracker.add_commit(commit(3, DIGEST));
        assert!(tracker.has_committed(0, 1, &DIGEST));
    }

    #[test]
    fn test_checkpoint_stability_and_garbage_collection() {
        let mut tracker = CertificateTracker::new(1, 0);
        for replica in 0..3 {
            tracker.add_checkpoint(Checkpoint::new(128, DIGEST, replica, true));
        }
        tracker.add_checkpoint(Checkpoint::new(256, DIGEST, 0, true));
        tracker.add_prepare(Prepare::new(0, 128, DIGEST, 1, true));
        tracker.add_commit(Commit::new(0, 200, DIGEST, 1, true));
        assert_eq!(tracker.stable_checkpoint(128), Some(DIGEST));
        assert_eq!(tracker.stable_checkpoint(256), None);

        tracker.collect_garbage(128);
        assert_eq!(tracker.stable_checkpoint(128), None);
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn test_retain_view_drops_older_views() {
        let mut tracker = CertificateTracker::new(1, 0);
        tracker.add_prepare(Prepare::new(0, 5, DIGEST, 1, true));
        tracker.add_prepare(Prepare::new(1, 5, DIGEST, 1, true));
        tracker.retain_view(1);
        assert_eq!(tracker.matching_prepares(0, 5, &DIGEST).len(), 0);
        assert_eq!(tracker.matching_prepares(1, 5, &DIGEST).len(), 1);
    }
}
