use tracing::{debug, error, info, warn};

use super::Replica;
use crate::consensus::message::{authenticated, Authenticated, Checkpoint};
use crate::consensus::service::Service;
use crate::consensus::types::Seqno;
use crate::error::{Rejection, Violation};
use crate::network::{Destination, Output};

impl<S: Service> Replica<S> {
    pub(super) fn take_checkpoint(&mut self, seqno: Seqno, out: &mut Output) {
        let digest = self.service.state_digest();
        self.checkpoints.insert(seqno, digest);
        debug!(replica = self.peers.index, seqno, "checkpoint");

        let checkpoint = Checkpoint::new(seqno, digest, self.peers.index, self.vote_uses_signature());
        match authenticated(checkpoint, &self.peers) {
            Ok(checkpoint) => {
                out.send(Destination::Replicas, checkpoint.to_payload());
                self.certs.add_checkpoint(checkpoint);
            }
            Err(err) => error!(replica = self.peers.index, %err, "cannot authenticate checkpoint"),
        }
        self.check_stable(seqno, out);
    }

    pub(super) fn on_checkpoint(&mut self, checkpoint: Checkpoint, out: &mut Output) -> Result<(), Rejection> {
        self.check_replica(&checkpoint, checkpoint.replica)?;
        let seqno = checkpoint.seqno;
        if seqno <= self.log.low {
            return Ok(());
        }
        if seqno > self.log.high() {
            return Err(Violation::OutOfWindow {
                seqno,
                low: self.log.low,
                high: self.log.high(),
            }
            .into());
        }
        let interval = self.protocol.checkpoint_interval;
        if seqno.checked_rem(interval) != Some(0) {
            return Err(Violation::UnalignedCheckpoint { seqno, interval }.into());
        }
        self.certs.add_checkpoint(checkpoint);
        self.check_stable(seqno, out);
        Ok(())
    }

    /// Moves the window once `2f + 1` replicas agree on the state at
    /// `seqno` and the local replica has got there too.
    fn check_stable(&mut self, seqno: Seqno, out: &mut Output) {
        if seqno <= self.log.low {
            return;
        }
        let Some(digest) = self.certs.stable_checkpoint(seqno) else {
            return;
        };
        if self.log.last_executed < seqno {
            warn!(
                replica = self.peers.index,
                seqno,
                last_executed = self.log.last_executed,
                "stable checkpoint ahead of execution"
            );
            return;
        }
        match self.checkpoints.get(&seqno) {
            Some(own) if *own == digest => {}
            Some(_) => {
                error!(replica = self.peers.index, seqno, "local state diverges from stable checkpoint");
                return;
            }
            // executed, but the checkpoint is not ours yet
            None => return,
        }

        self.log.advance(seqno);
        self.certs.collect_garbage(seqno);
        self.store.collect_garbage(seqno);
        self.parked = self.parked.split_off(&(seqno + 1));
        self.checkpoints = self.checkpoints.split_off(&(seqno + 1));
        self.stable_digest = digest;
        info!(replica = self.peers.index, seqno, high = self.log.high(), "checkpoint stable");

        self.try_propose(out);
    }
}
