use tracing::{debug, error, info, trace, warn};

use super::Replica;
use crate::consensus::log::Phase;
use crate::consensus::message::{
    authenticated, Authenticated, Commit, PrePrepare, Prepare, PreparedProof, Reply, Request, RequestEntry,
};
use crate::consensus::service::Service;
use crate::consensus::store::Admission;
use crate::consensus::timer::TimerKey;
use crate::common::crypto::Digest;
use crate::consensus::types::{Seqno, View};
use crate::error::{Rejection, Violation};
use crate::network::{Destination, Output};

impl<S: Service> Replica<S> {
    pub(super) fn on_request(&mut self, request: Request, out: &mut Output) -> Result<(), Rejection> {
        if !request.verify_client(&self.peers) {
            return Err(Rejection::Authentication("request signature"));
        }
        if let Some(reply) = self.replies.get(&request.client) {
            if reply.timestamp == request.timestamp {
                trace!(replica = self.peers.index, client = request.client, "resending cached reply");
                out.send(Destination::Client(request.client), reply.to_payload());
                return Ok(());
            }
        }

        let (client, timestamp) = (request.client, request.timestamp);
        let payload = request.to_payload();
        match self.store.insert(request) {
            Admission::Stale | Admission::Conflict => {
                return Err(Violation::StaleRequest { client, timestamp }.into());
            }
            Admission::New => {
                debug!(replica = self.peers.index, client, timestamp, "new request");
                self.retry_parked(out);
            }
            Admission::Known => {}
        }

        if self.active && self.is_primary() {
            self.try_propose(out);
        } else if self.active {
            out.send(Destination::Replica(self.peers.primary(self.view)), payload);
        }
        self.arm_request_timer(out);
        Ok(())
    }

    pub(super) fn arm_request_timer(&mut self, out: &mut Output) {
        let key = TimerKey::Request { view: self.view };
        if self.active && self.store.has_unexecuted() && !self.timers.is_armed(&key) {
            out.push(self.timers.arm(key, self.protocol.request_timeout()));
        }
    }

    /// Primary side: turns pending requests into pre-prepares while the
    /// window has room.
    pub(super) fn try_propose(&mut self, out: &mut Output) {
        if !self.active || !self.is_primary() {
            return;
        }
        while self.store.has_unclaimed() && self.next_seqno < self.log.high() {
            let seqno = self.next_seqno + 1;
            let pre_prepare = match PrePrepare::from_node(
                &self.peers,
                &mut self.store,
                self.view,
                seqno,
                &self.protocol,
                true,
            ) {
                Ok(pre_prepare) => pre_prepare,
                Err(err) => {
                    error!(replica = self.peers.index, %err, "cannot authenticate pre-prepare");
                    return;
                }
            };
            if pre_prepare.is_null() {
                return;
            }
            self.next_seqno = seqno;
            info!(
                replica = self.peers.index,
                view = self.view,
                seqno,
                requests = pre_prepare.requests.len(),
                "proposing"
            );
            out.send(Destination::Replicas, pre_prepare.to_payload());
            self.accept_pre_prepare(pre_prepare, out);
        }
    }

    pub(super) fn on_pre_prepare(&mut self, pre_prepare: PrePrepare, out: &mut Output) -> Result<(), Rejection> {
        let primary = self.peers.primary(pre_prepare.view);
        if primary == self.peers.index {
            return Err(Violation::NotPrimary(primary).into());
        }
        // prepared proofs must convince replicas that never saw this message
        if !pre_prepare.use_signature() {
            return Err(Rejection::Authentication("pre-prepare must be signed"));
        }
        self.check_replica(&pre_prepare, primary)?;
        self.validate_pre_prepare(&pre_prepare)?;

        // a parked pre-prepare binds the slot as firmly as an accepted one
        let seqno = pre_prepare.seqno;
        let known = self
            .log
            .slot(seqno)
            .and_then(|s| s.voted(self.view))
            .or_else(|| {
                self.parked
                    .get(&seqno)
                    .filter(|pp| pp.view == self.view)
                    .map(PrePrepare::content_digest)
            });
        if let Some(known) = known {
            if known == pre_prepare.content_digest() {
                return Ok(());
            }
            warn!(
                replica = self.peers.index,
                view = self.view,
                seqno = pre_prepare.seqno,
                "conflicting pre-prepare from primary"
            );
            let violation = Violation::ConflictingPrePrepare {
                view: pre_prepare.view,
                seqno: pre_prepare.seqno,
            };
            self.start_view_change(self.view + 1, out);
            return Err(violation.into());
        }

        if self.admit_requests(&pre_prepare)? {
            self.accept_pre_prepare(pre_prepare, out);
        } else {
            debug!(replica = self.peers.index, seqno = pre_prepare.seqno, "parking pre-prepare");
            self.parked.insert(pre_prepare.seqno, pre_prepare);
        }
        Ok(())
    }

    pub(super) fn validate_pre_prepare(&self, pre_prepare: &PrePrepare) -> Result<(), Rejection> {
        if !self.log.in_window(pre_prepare.seqno) {
            return Err(Violation::OutOfWindow {
                seqno: pre_prepare.seqno,
                low: self.log.low,
                high: self.log.high(),
            }
            .into());
        }
        let cap = self.protocol.request_in_pre_prepare;
        if pre_prepare.requests.len() > cap {
            return Err(Violation::BatchTooLarge {
                len: pre_prepare.requests.len(),
                cap,
            }
            .into());
        }
        Ok(())
    }

    /// Stores the full requests a pre-prepare carries. True when every
    /// request it references is known.
    pub(super) fn admit_requests(&mut self, pre_prepare: &PrePrepare) -> Result<bool, Rejection> {
        for entry in &pre_prepare.requests {
            if let RequestEntry::Full(request) = entry {
                if !request.verify_client(&self.peers) {
                    return Err(Rejection::Authentication("request inside pre-prepare"));
                }
            }
        }
        let mut complete = true;
        for entry in &pre_prepare.requests {
            match entry {
                RequestEntry::Full(request) => {
                    // stale ones are skipped at execution
                    let stale = self.store.is_stale(request.client, request.timestamp);
                    self.store.insert(request.clone());
                    complete &= stale || self.store.contains(&request.digest());
                }
                RequestEntry::Digest(digest) => complete &= self.store.contains(digest),
            }
        }
        Ok(complete)
    }

    pub(super) fn retry_parked(&mut self, out: &mut Output) {
        let ready: Vec<Seqno> = self
            .parked
            .iter()
            .filter(|(_, pp)| pp.requests.iter().all(|e| self.store.contains(&e.digest())))
            .map(|(seqno, _)| *seqno)
            .collect();
        for seqno in ready {
            let Some(pre_prepare) = self.parked.remove(&seqno) else {
                continue;
            };
            let voted = self.log.slot(seqno).and_then(|s| s.voted(pre_prepare.view));
            if pre_prepare.view == self.view && self.active && voted.is_none() {
                self.accept_pre_prepare(pre_prepare, out);
            }
        }
    }

    /// `idle -> pre_prepared`: records the pre-prepare and sends our prepare.
    pub(super) fn accept_pre_prepare(&mut self, pre_prepare: PrePrepare, out: &mut Output) {
        let (view, seqno) = (pre_prepare.view, pre_prepare.seqno);
        let digest = pre_prepare.content_digest();
        if let Some(voted) = self.log.slot(seqno).and_then(|s| s.voted(view)) {
            if voted != digest {
                warn!(replica = self.peers.index, view, seqno, "already prepared another pre-prepare");
            }
            return;
        }
        for entry in &pre_prepare.requests {
            self.store.mark_claimed(entry.digest());
        }
        if seqno > self.next_seqno {
            self.next_seqno = seqno;
        }

        // a batch re-proposed by a new view that already ran here still
        // needs our votes, but never runs twice
        let executed = self.log.phase(seqno) == Phase::Executed;
        self.log.slot_mut(seqno).vote = Some((view, digest));
        if !executed {
            let slot = self.log.slot_mut(seqno);
            slot.pre_prepare = Some(pre_prepare);
            slot.digest = Some(digest);
            slot.phase = Phase::PrePrepared;
            trace!(replica = self.peers.index, view, seqno, "pre-prepared");
        }
        self.arm_request_timer(out);

        match authenticated(Prepare::new(view, seqno, digest, self.peers.index, true), &self.peers) {
            Ok(prepare) => {
                out.send(Destination::Replicas, prepare.to_payload());
                self.certs.add_prepare(prepare);
            }
            Err(err) => error!(replica = self.peers.index, %err, "cannot sign prepare"),
        }
        if executed {
            self.send_commit(view, seqno, digest, out);
        } else {
            self.check_prepared(seqno, out);
        }
    }

    fn send_commit(&mut self, view: View, seqno: Seqno, digest: Digest, out: &mut Output) {
        let commit = Commit::new(view, seqno, digest, self.peers.index, self.vote_uses_signature());
        match authenticated(commit, &self.peers) {
            Ok(commit) => {
                out.send(Destination::Replicas, commit.to_payload());
                self.certs.add_commit(commit);
            }
            Err(err) => error!(replica = self.peers.index, %err, "cannot authenticate commit"),
        }
    }

    pub(super) fn on_prepare(&mut self, prepare: Prepare, out: &mut Output) -> Result<(), Rejection> {
        if !prepare.use_signature() {
            return Err(Rejection::Authentication("prepare must be signed"));
        }
        self.check_replica(&prepare, prepare.replica)?;
        if !self.log.in_window(prepare.seqno) {
            return Err(Violation::OutOfWindow {
                seqno: prepare.seqno,
                low: self.log.low,
                high: self.log.high(),
            }
            .into());
        }
        let seqno = prepare.seqno;
        self.certs.add_prepare(prepare);
        self.check_prepared(seqno, out);
        Ok(())
    }

    /// `pre_prepared -> prepared`: keeps the proof and sends our commit.
    fn check_prepared(&mut self, seqno: Seqno, out: &mut Output) {
        let view = self.view;
        let Some(slot) = self.log.slot(seqno) else {
            return;
        };
        let (Phase::PrePrepared, Some(digest)) = (slot.phase, slot.digest) else {
            return;
        };
        if !self.certs.has_prepared(view, seqno, &digest) {
            return;
        }
        let Some(pre_prepare) = slot.accepted(view).cloned() else {
            return;
        };
        self.log.slot_mut(seqno).phase = Phase::Prepared;
        debug!(replica = self.peers.index, view, seqno, "prepared");

        let primary = self.peers.primary(view);
        let prepares = self
            .certs
            .matching_prepares(view, seqno, &digest)
            .into_iter()
            .filter(|p| p.replica != primary)
            .collect();
        self.log.record_proof(PreparedProof { pre_prepare, prepares });

        self.send_commit(view, seqno, digest, out);
        self.check_committed(seqno, out);
    }

    pub(super) fn on_commit(&mut self, commit: Commit, out: &mut Output) -> Result<(), Rejection> {
        self.check_replica(&commit, commit.replica)?;
        if !self.log.in_window(commit.seqno) {
            return Err(Violation::OutOfWindow {
                seqno: commit.seqno,
                low: self.log.low,
                high: self.log.high(),
            }
            .into());
        }
        let seqno = commit.seqno;
        self.certs.add_commit(commit);
        self.check_committed(seqno, out);
        Ok(())
    }

    /// `prepared -> committed`, then runs whatever is ready.
    fn check_committed(&mut self, seqno: Seqno, out: &mut Output) {
        let Some(slot) = self.log.slot(seqno) else {
            return;
        };
        let (Phase::Prepared, Some(digest)) = (slot.phase, slot.digest) else {
            return;
        };
        if !self.certs.has_committed(self.view, seqno, &digest) {
            return;
        }
        self.log.slot_mut(seqno).phase = Phase::Committed;
        debug!(replica = self.peers.index, view = self.view, seqno, "committed");
        self.execute_ready(out);
    }

    /// `committed -> executed`, strictly in seqno order.
    fn execute_ready(&mut self, out: &mut Output) {
        let mut progressed = false;
        while let Some(pre_prepare) = self.log.next_committed().and_then(|s| s.pre_prepare.clone()) {
            let seqno = self.log.last_executed + 1;
            for digest in pre_prepare.request_digests() {
                self.execute_request(seqno, &digest, out);
            }
            self.log.slot_mut(seqno).phase = Phase::Executed;
            self.log.last_executed = seqno;
            out.executed.push(seqno);
            progressed = true;
            info!(replica = self.peers.index, view = self.view, seqno, "executed");

            if seqno.checked_rem(self.protocol.checkpoint_interval) == Some(0) {
                self.take_checkpoint(seqno, out);
            }
        }
        if !progressed {
            return;
        }

        self.view_change_backoff.reset();
        if let Some(cancel) = self.timers.cancel(TimerKey::Request { view: self.view }) {
            out.push(cancel);
        }
        self.arm_request_timer(out);
        self.try_propose(out);
    }

    fn execute_request(&mut self, seqno: Seqno, digest: &Digest, out: &mut Output) {
        let Some(request) = self.store.get(digest).cloned() else {
            error!(replica = self.peers.index, seqno, "committed request body missing");
            return;
        };
        if self.store.is_stale(request.client, request.timestamp) {
            trace!(replica = self.peers.index, client = request.client, "skipping re-ordered request");
            return;
        }
        let result = self.service.execute(request.client, &request.operation);
        self.store.executed(seqno, digest);

        let reply = Reply::new(self.view, request.timestamp, request.client, self.peers.index, result);
        match authenticated(reply, &self.peers) {
            Ok(reply) => {
                out.send(Destination::Client(request.client), reply.to_payload());
                self.replies.insert(request.client, reply);
            }
            Err(err) => error!(replica = self.peers.index, %err, "cannot sign reply"),
        }
    }
}
