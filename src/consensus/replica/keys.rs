use tracing::{debug, error};

use super::Replica;
use crate::consensus::message::{Authenticated, NewKey};
use crate::consensus::service::Service;
use crate::consensus::types::wall_clock_millis;
use crate::error::{Rejection, Violation};
use crate::network::{Destination, Output};

impl<S: Service> Replica<S> {
    /// Rotates every inbound session key and tells each replica its new one.
    pub(super) fn send_new_key(&mut self, out: &mut Output) {
        let timestamp = wall_clock_millis().max(self.key_timestamp + 1);
        match NewKey::create(&mut self.peers, timestamp) {
            Ok(new_key) => {
                self.key_timestamp = timestamp;
                debug!(replica = self.peers.index, timestamp, "rotated session keys");
                out.send(Destination::Replicas, new_key.to_payload());
            }
            Err(err) => error!(replica = self.peers.index, %err, "cannot create new key"),
        }
    }

    pub(super) fn on_new_key(&mut self, new_key: NewKey) -> Result<(), Rejection> {
        if !new_key.use_signature() {
            return Err(Rejection::Authentication("new key must be signed"));
        }
        if new_key.replica == self.peers.index {
            return Ok(());
        }
        self.check_replica(&new_key, new_key.replica)?;

        let sender = self
            .peers
            .replica(new_key.replica)
            .ok_or(Rejection::UnknownSender(new_key.replica))?;
        if new_key.timestamp <= sender.outkeyts {
            return Err(Violation::StaleKey(new_key.timestamp).into());
        }
        let key = new_key
            .open(&self.peers)
            .map_err(|_| Rejection::Authentication("cannot open session key"))?;

        if let Some(sender) = self.peers.replica_mut(new_key.replica) {
            sender.set_outkey(key, new_key.timestamp);
        }
        debug!(
            replica = self.peers.index,
            from = new_key.replica,
            timestamp = new_key.timestamp,
            established = self.peers.keys_established(),
            "session key installed"
        );
        Ok(())
    }
}
