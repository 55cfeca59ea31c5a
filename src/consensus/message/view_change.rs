use std::collections::{BTreeMap, HashSet};

use bytes::Bytes;

use crate::common::codec::{DecodeError, ListEncoder, Rlp};
use crate::common::crypto::Digest;
use super::{decode_nested, Authenticated, Authenticator, ContentHasher, MessageKind, PrePrepare, Prepare};
use crate::consensus::peers::Peers;
use crate::consensus::types::{extra_for, Seqno, View};
use crate::error::Violation;

/*
    View change evidence.

    A prepared proof is a signed pre-prepare plus at least 2f signed prepares
    for it from replicas other than that view's primary. Every part is
    signed, so any replica can check a proof it did not witness.

    The new primary collects 2f+1 view changes, picks a starting point and
    re-proposes, for every sequence number above it, the batch with the
    highest-view proof (or an empty batch where there is none). Backups redo
    the same computation from the view changes carried in the new-view and
    compare.
*/

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PreparedProof {
    pub pre_prepare: PrePrepare,
    pub prepares: Vec<Prepare>,
}

impl PreparedProof {
    pub fn seqno(&self) -> Seqno {
        self.pre_prepare.seqno
    }

    pub fn view(&self) -> View {
        self.pre_prepare.view
    }

    pub fn verify(&self, peers: &Peers) -> Result<(), Violation> {
        let pre_prepare = &self.pre_prepare;
        if !pre_prepare.use_signature() {
            return Err(Violation::InvalidEvidence("pre-prepare is not signed"));
        }
        let primary = peers.primary(pre_prepare.view);
        let signer = peers.replica(primary).ok_or(Violation::NotPrimary(primary))?;
        if !pre_prepare.verify(peers, signer) {
            return Err(Violation::InvalidEvidence("pre-prepare signature"));
        }

        let digest = pre_prepare.content_digest();
        let mut senders = HashSet::new();
        for prepare in &self.prepares {
            let matches = prepare.use_signature()
                && prepare.view == pre_prepare.view
                && prepare.seqno == pre_prepare.seqno
                && prepare.digest == digest
                && prepare.replica != primary;
            if !matches {
                return Err(Violation::InvalidEvidence("prepare does not match pre-prepare"));
            }
            let sender = peers
                .replica(prepare.replica)
                .ok_or(Violation::InvalidEvidence("prepare from unknown replica"))?;
            if !prepare.verify(peers, sender) {
                return Err(Violation::InvalidEvidence("prepare signature"));
            }
            senders.insert(prepare.replica);
        }

        if senders.len() < peers.prepare_quorum() {
            return Err(Violation::InvalidEvidence("too few prepares"));
        }
        Ok(())
    }

    fn encode(&self) -> Bytes {
        ListEncoder::new()
            .bytes(&self.pre_prepare.to_payload())
            .list(self.prepares.iter().map(Prepare::to_payload))
            .finish()
    }

    fn decode(item: &Rlp<'_>) -> Result<Self, DecodeError> {
        let fields = item.fields(2)?;
        Ok(PreparedProof {
            pre_prepare: PrePrepare::from_payload(fields[0].data()?, None)?,
            prepares: decode_nested(&fields[1])?,
        })
    }
}

/// A replica's vote to leave its view, with everything it prepared above its
/// last stable checkpoint.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ViewChange {
    pub extra: u64,
    pub view: View,
    pub replica: usize,
    pub stable_seqno: Seqno,
    pub stable_digest: Digest,
    pub proofs: Vec<PreparedProof>,
    pub auth: Authenticator,
}

impl ViewChange {
    pub fn new(
        view: View,
        replica: usize,
        stable_seqno: Seqno,
        stable_digest: Digest,
        proofs: Vec<PreparedProof>,
    ) -> Self {
        ViewChange {
            extra: extra_for(true),
            view,
            replica,
            stable_seqno,
            stable_digest,
            proofs,
            auth: Authenticator::default(),
        }
    }

    /// Checks the embedded proofs. The vote's own signature is checked by
    /// the caller.
    pub fn verify_evidence(&self, peers: &Peers) -> Result<(), Violation> {
        if !self.use_signature() {
            return Err(Violation::InvalidEvidence("view change is not signed"));
        }
        let mut seen = HashSet::new();
        for proof in &self.proofs {
            if proof.view() >= self.view {
                return Err(Violation::InvalidEvidence("proof from a later view"));
            }
            if proof.seqno() <= self.stable_seqno || !seen.insert(proof.seqno()) {
                return Err(Violation::InvalidEvidence("proof seqno"));
            }
            proof.verify(peers)?;
        }
        Ok(())
    }
}

impl Authenticated for ViewChange {
    const KIND: MessageKind = MessageKind::ViewChange;

    fn extra(&self) -> u64 {
        self.extra
    }

    fn content(&self) -> Bytes {
        let proofs = self
            .proofs
            .iter()
            .fold(ListEncoder::new(), |list, proof| list.raw(&proof.encode()))
            .finish();
        ListEncoder::new()
            .uint(self.extra)
            .uint(self.view)
            .uint(self.replica as u64)
            .uint(self.stable_seqno)
            .bytes(&self.stable_digest)
            .raw(&proofs)
            .finish()
    }

    fn from_content(content: Rlp<'_>) -> Result<Self, DecodeError> {
        let fields = content.fields(6)?;
        let proofs = fields[5]
            .items()?
            .iter()
            .map(PreparedProof::decode)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ViewChange {
            extra: fields[0].as_u64()?,
            view: fields[1].as_u64()?,
            replica: fields[2].as_usize()?,
            stable_seqno: fields[3].as_u64()?,
            stable_digest: fields[4].fixed::<32>()?,
            proofs,
            auth: Authenticator::default(),
        })
    }

    fn content_digest(&self) -> Digest {
        ContentHasher::new(MessageKind::ViewChange)
            .bytes(&self.content())
            .finish()
    }

    fn auth(&self) -> &Authenticator {
        &self.auth
    }

    fn set_auth(&mut self, auth: Authenticator) {
        self.auth = auth;
    }
}

/// What a new view must re-propose, derived from a set of view changes.
#[derive(Debug)]
pub struct Reconstruction<'a> {
    pub min_s: Seqno,
    pub max_s: Seqno,
    pub chosen: BTreeMap<Seqno, &'a PrePrepare>,
}

impl<'a> Reconstruction<'a> {
    /// `min_s` is the `weak_quorum`-th highest stable seqno claimed, so at
    /// least one correct replica vouches for a checkpoint at or above it.
    pub fn compute(view_changes: &'a [ViewChange], weak_quorum: usize) -> Option<Self> {
        let mut claims: Vec<Seqno> = view_changes.iter().map(|vc| vc.stable_seqno).collect();
        claims.sort_unstable_by(|a, b| b.cmp(a));
        let min_s = *claims.get(weak_quorum.checked_sub(1)?)?;

        let mut chosen: BTreeMap<Seqno, &PrePrepare> = BTreeMap::new();
        for proof in view_changes.iter().flat_map(|vc| vc.proofs.iter()) {
            if proof.seqno() <= min_s {
                continue;
            }
            let current = chosen.entry(proof.seqno()).or_insert(&proof.pre_prepare);
            if proof.view() > current.view {
                *current = &proof.pre_prepare;
            }
        }
        let max_s = chosen.keys().next_back().copied().unwrap_or(min_s);

        Some(Reconstruction { min_s, max_s, chosen })
    }

    /// Unauthenticated pre-prepares for `view` covering `(min_s, max_s]`.
    pub fn pre_prepares(&self, view: View, use_signature: bool) -> Vec<PrePrepare> {
        (self.min_s + 1..=self.max_s)
            .map(|seqno| match self.chosen.get(&seqno) {
                Some(old) => PrePrepare::new(
                    view,
                    seqno,
                    old.requests.clone(),
                    old.non_det_choices.clone(),
                    use_signature,
                ),
                None => PrePrepare::null(view, seqno, use_signature),
            })
            .collect()
    }

    /// Whether `proposed` is exactly what this reconstruction calls for.
    pub fn matches(&self, view: View, proposed: &[PrePrepare]) -> bool {
        let expected = self.pre_prepares(view, true);
        expected.len() == proposed.len()
            && expected.iter().zip(proposed).all(|(want, got)| {
                got.view == view
                    && got.seqno == want.seqno
                    && got.consensus_digest() == want.consensus_digest()
            })
    }
}

/// The new primary's announcement of a view, with its justification.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct NewView {
    pub extra: u64,
    pub view: View,
    pub view_changes: Vec<ViewChange>,
    pub pre_prepares: Vec<PrePrepare>,
    pub auth: Authenticator,
}

impl NewView {
    pub fn new(view: View, view_changes: Vec<ViewChange>, pre_prepares: Vec<PrePrepare>) -> Self {
        NewView {
            extra: extra_for(true),
            view,
            view_changes,
            pre_prepares,
            auth: Authenticator::default(),
        }
    }
}

impl Authenticated for NewView {
    const KIND: MessageKind = MessageKind::NewView;

    fn extra(&self) -> u64 {
        self.extra
    }

    fn content(&self) -> Bytes {
        ListEncoder::new()
            .uint(self.extra)
            .uint(self.view)
            .list(self.view_changes.iter().map(ViewChange::to_payload))
            .list(self.pre_prepares.iter().map(PrePrepare::to_payload))
            .finish()
    }

    fn from_content(content: Rlp<'_>) -> Result<Self, DecodeError> {
        let fields = content.fields(4)?;
        Ok(NewView {
            extra: fields[0].as_u64()?,
            view: fields[1].as_u64()?,
            view_changes: decode_nested(&fields[2])?,
            pre_prepares: decode_nested(&fields[3])?,
            auth: Authenticator::default(),
        })
    }

    fn content_digest(&self) -> Digest {
        ContentHasher::new(MessageKind::NewView)
            .bytes(&self.content())
            .finish()
    }

    fn auth(&self) -> &Authenticator {
        &self.auth
    }

    fn set_auth(&mut self, auth: Authenticator) {
        self.auth = auth;
    }
}
