use std::collections::HashSet;

use tracing::{debug, error, info, warn};

use super::Replica;
use crate::consensus::message::{
    authenticated, Authenticated, NewView, PrePrepare, Reconstruction, ViewChange,
};
use crate::consensus::service::Service;
use crate::consensus::timer::TimerKey;
use crate::consensus::types::{Seqno, View};
use crate::error::{Rejection, Violation};
use crate::network::{Destination, Output};

impl<S: Service> Replica<S> {
    /// Leaves the current view for `view` and announces it.
    pub(super) fn start_view_change(&mut self, view: View, out: &mut Output) {
        if view <= self.view {
            return;
        }
        info!(replica = self.peers.index, from = self.view, to = view, "starting view change");

        out.actions.extend(self.timers.cancel_where(|key| {
            matches!(key, TimerKey::Request { .. } | TimerKey::ViewChange { .. })
        }));
        self.view = view;
        self.active = false;
        self.parked.clear();
        self.store.release_claims();

        let proofs = self
            .log
            .proofs()
            .filter(|proof| proof.seqno() > self.log.low)
            .cloned()
            .collect();
        let view_change = ViewChange::new(view, self.peers.index, self.log.low, self.stable_digest, proofs);
        match authenticated(view_change, &self.peers) {
            Ok(view_change) => {
                out.send(Destination::Replicas, view_change.to_payload());
                self.view_changes.insert(self.peers.index, view_change);
            }
            Err(err) => error!(replica = self.peers.index, %err, "cannot sign view change"),
        }
        self.view_change_progress(out);
    }

    pub(super) fn on_view_change(&mut self, view_change: ViewChange, out: &mut Output) -> Result<(), Rejection> {
        if view_change.view < self.view {
            return Err(Violation::StaleView {
                view: view_change.view,
                current: self.view,
            }
            .into());
        }
        if view_change.view == self.view && self.active {
            debug!(replica = self.peers.index, from = view_change.replica, "view already installed");
            return Ok(());
        }
        if view_change.replica == self.peers.index {
            return Ok(());
        }
        self.check_replica(&view_change, view_change.replica)?;
        view_change.verify_evidence(&self.peers)?;

        let newer = self
            .view_changes
            .get(&view_change.replica)
            .map_or(true, |old| old.view < view_change.view);
        if !newer {
            return Ok(());
        }
        debug!(
            replica = self.peers.index,
            from = view_change.replica,
            view = view_change.view,
            "view change"
        );
        self.view_changes.insert(view_change.replica, view_change);

        // f + 1 replicas ahead of us include a correct one, so follow them
        let ahead: Vec<View> = self
            .view_changes
            .values()
            .filter(|vc| vc.view > self.view && vc.replica != self.peers.index)
            .map(|vc| vc.view)
            .collect();
        if ahead.len() >= self.peers.weak_quorum() {
            if let Some(target) = ahead.into_iter().min() {
                info!(replica = self.peers.index, target, "joining view change");
                self.start_view_change(target, out);
                return Ok(());
            }
        }
        self.view_change_progress(out);
        Ok(())
    }

    fn view_changes_for(&self, view: View) -> Vec<ViewChange> {
        self.view_changes
            .values()
            .filter(|vc| vc.view == view)
            .cloned()
            .collect()
    }

    /// With a quorum of view changes for the pending view, starts the
    /// new-view timer, and if this replica is the new primary, installs it.
    fn view_change_progress(&mut self, out: &mut Output) {
        if self.active {
            return;
        }
        let view_changes = self.view_changes_for(self.view);
        if view_changes.len() < self.peers.quorum() {
            return;
        }

        let key = TimerKey::ViewChange { view: self.view };
        if !self.timers.is_armed(&key) {
            let after = self.view_change_backoff.next();
            out.push(self.timers.arm(key, after));
        }
        if self.is_primary() {
            self.send_new_view(view_changes, out);
        }
    }

    fn send_new_view(&mut self, view_changes: Vec<ViewChange>, out: &mut Output) {
        let view = self.view;
        let Some((min_s, max_s, proposals)) = Reconstruction::compute(&view_changes, self.peers.weak_quorum())
            .map(|r| (r.min_s, r.max_s, r.pre_prepares(view, true)))
        else {
            return;
        };
        let pre_prepares: Result<Vec<PrePrepare>, _> = proposals
            .into_iter()
            .map(|pp| authenticated(pp, &self.peers))
            .collect();
        let new_view = pre_prepares.and_then(|pps| authenticated(NewView::new(view, view_changes, pps), &self.peers));
        match new_view {
            Ok(new_view) => {
                info!(replica = self.peers.index, view, min_s, max_s, "sending new view");
                out.send(Destination::Replicas, new_view.to_payload());
                self.install_new_view(new_view, min_s, max_s, out);
            }
            Err(err) => error!(replica = self.peers.index, %err, "cannot sign new view"),
        }
    }

    pub(super) fn on_new_view(&mut self, new_view: NewView, out: &mut Output) -> Result<(), Rejection> {
        if new_view.view < self.view {
            return Err(Violation::StaleView {
                view: new_view.view,
                current: self.view,
            }
            .into());
        }
        if new_view.view == self.view && self.active {
            return Ok(());
        }
        let primary = self.peers.primary(new_view.view);
        if primary == self.peers.index {
            return Err(Violation::NotPrimary(primary).into());
        }
        if !new_view.use_signature() {
            return Err(Rejection::Authentication("new view must be signed"));
        }
        self.check_replica(&new_view, primary)?;

        let (min_s, max_s) = self.check_new_view(&new_view)?;
        self.view = new_view.view;
        self.install_new_view(new_view, min_s, max_s, out);
        Ok(())
    }

    /// Verifies a new view's justification and that its pre-prepares are
    /// what the carried view changes call for.
    fn check_new_view(&self, new_view: &NewView) -> Result<(Seqno, Seqno), Rejection> {
        let mut senders = HashSet::new();
        for view_change in &new_view.view_changes {
            if view_change.view != new_view.view {
                return Err(Violation::InvalidEvidence("view change for another view").into());
            }
            let sender = self
                .peers
                .replica(view_change.replica)
                .ok_or(Rejection::UnknownSender(view_change.replica))?;
            if !view_change.verify(&self.peers, sender) {
                return Err(Violation::InvalidEvidence("view change signature").into());
            }
            view_change.verify_evidence(&self.peers)?;
            senders.insert(view_change.replica);
        }
        if senders.len() < self.peers.quorum() {
            return Err(Violation::InvalidEvidence("too few view changes").into());
        }

        let primary = self.peers.primary(new_view.view);
        let signer = self.peers.replica(primary).ok_or(Rejection::UnknownSender(primary))?;
        for pre_prepare in &new_view.pre_prepares {
            if !pre_prepare.use_signature() || !pre_prepare.verify(&self.peers, signer) {
                return Err(Violation::InvalidEvidence("new view pre-prepare signature").into());
            }
        }

        let reconstruction = Reconstruction::compute(&new_view.view_changes, self.peers.weak_quorum())
            .ok_or(Violation::InvalidEvidence("too few view changes"))?;
        if !reconstruction.matches(new_view.view, &new_view.pre_prepares) {
            return Err(Violation::NewViewMismatch.into());
        }
        Ok((reconstruction.min_s, reconstruction.max_s))
    }

    /// Enters `new_view.view` and runs its pre-prepares through the normal
    /// path.
    fn install_new_view(&mut self, new_view: NewView, min_s: Seqno, max_s: Seqno, out: &mut Output) {
        let view = new_view.view;
        out.actions.extend(self.timers.cancel_where(|key| {
            matches!(key, TimerKey::Request { .. } | TimerKey::ViewChange { .. })
        }));
        self.view = view;
        self.active = true;
        self.view_changes.retain(|_, vc| vc.view > view);
        self.certs.retain_view(view);
        self.log.reset_unexecuted();
        self.parked.clear();
        self.store.release_claims();

        if min_s > self.log.last_executed {
            warn!(
                replica = self.peers.index,
                min_s,
                last_executed = self.log.last_executed,
                "new view starts past local execution"
            );
        } else if min_s > self.log.low {
            let stable = new_view
                .view_changes
                .iter()
                .find(|vc| vc.stable_seqno == min_s)
                .map(|vc| vc.stable_digest);
            if let Some(digest) = stable {
                self.log.advance(min_s);
                self.certs.collect_garbage(min_s);
                self.store.collect_garbage(min_s);
                self.checkpoints = self.checkpoints.split_off(&(min_s + 1));
                self.stable_digest = digest;
            }
        }
        self.next_seqno = max_s;
        info!(replica = self.peers.index, view, min_s, max_s, "new view installed");

        for pre_prepare in new_view.pre_prepares {
            if !self.log.in_window(pre_prepare.seqno) {
                continue;
            }
            match self.admit_requests(&pre_prepare) {
                Ok(true) => self.accept_pre_prepare(pre_prepare, out),
                Ok(false) => {
                    self.parked.insert(pre_prepare.seqno, pre_prepare);
                }
                Err(rejection) => {
                    warn!(replica = self.peers.index, seqno = pre_prepare.seqno, %rejection, "bad request in new view")
                }
            }
        }

        self.replay_buffered(out);
        self.try_propose(out);
        self.arm_request_timer(out);
    }
}
