use std::net::SocketAddr;

use crate::common::crypto::{CryptoError, Digest, Pubkey};
use super::message::Authenticator;
use super::principal::{Direction, Principal};
use super::types::{Role, View};

/// The replica and client groups as seen by the local node.
///
/// Read-only after start-up except for the session-key fields of each
/// principal, which only the local node's authentication layer touches.
#[derive(Debug)]
pub struct Peers {
    pub replicas: Vec<Principal>,
    pub clients: Vec<Principal>,
    pub role: Role,
    pub index: usize,
    pub f: usize,
}

impl Peers {
    pub fn new(
        replicas: Vec<Principal>,
        clients: Vec<Principal>,
        role: Role,
        index: usize,
        f: usize,
    ) -> Self {
        Peers {
            replicas,
            clients,
            role,
            index,
            f,
        }
    }

    pub fn n(&self) -> usize {
        self.replicas.len()
    }

    /// `2f + 1`
    pub fn quorum(&self) -> usize {
        2 * self.f + 1
    }

    /// `2f`: prepares needed from replicas other than the local one.
    pub fn prepare_quorum(&self) -> usize {
        2 * self.f
    }

    /// `f + 1`: enough to include at least one correct replica.
    pub fn weak_quorum(&self) -> usize {
        self.f + 1
    }

    pub fn primary(&self, view: View) -> usize {
        (view % self.n() as u64) as usize
    }

    pub fn is_primary(&self, view: View) -> bool {
        self.role == Role::Replica && self.primary(view) == self.index
    }

    pub fn replica(&self, index: usize) -> Option<&Principal> {
        self.replicas.get(index)
    }

    pub fn replica_mut(&mut self, index: usize) -> Option<&mut Principal> {
        self.replicas.get_mut(index)
    }

    pub fn client(&self, index: usize) -> Option<&Principal> {
        self.clients.get(index)
    }

    pub fn local(&self) -> &Principal {
        match self.role {
            Role::Replica => &self.replicas[self.index],
            Role::Client => &self.clients[self.index],
        }
    }

    pub fn is_member(&self, pubkey: &Pubkey) -> bool {
        self.replicas.iter().any(|p| p.public_key == *pubkey)
    }

    /// Looks a client up by key value.
    pub fn find_client(&self, pubkey: &Pubkey) -> Option<usize> {
        self.clients.iter().position(|p| p.public_key == *pubkey)
    }

    pub fn replica_at(&self, addr: &SocketAddr) -> Option<usize> {
        self.replicas.iter().position(|p| p.addr == *addr)
    }

    /// Every outbound session key toward the other replicas has been rotated.
    pub fn keys_established(&self) -> bool {
        self.role == Role::Replica
            && self
                .replicas
                .iter()
                .filter(|p| p.index != self.index)
                .all(Principal::has_outkey)
    }

    /// Produces the authentication tag for `digest` in the requested mode.
    pub fn authenticate(&self, digest: &Digest, use_signature: bool) -> Result<Authenticator, CryptoError> {
        if use_signature {
            return Ok(Authenticator::Signature(self.local().sign(digest)?));
        }
        let tags = self
            .replicas
            .iter()
            .map(|p| p.gen_hmac(Direction::Out, digest))
            .collect();
        Ok(Authenticator::Vector(tags))
    }

    /// Checks `auth` over `digest` as coming from `sender`.
    ///
    /// An authenticator vector is only meaningful to a replica, and only its
    /// own entry can be checked.
    pub fn verify(&self, sender: &Principal, digest: &Digest, use_signature: bool, auth: &Authenticator) -> bool {
        match (use_signature, auth) {
            (true, Authenticator::Signature(signature)) => sender.verify(digest, signature),
            (false, Authenticator::Vector(tags)) => {
                if self.role != Role::Replica || tags.len() != self.n() {
                    return false;
                }
                sender.verify_hmac(Direction::In, digest, &tags[self.index])
            }
            _ => false,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::common::crypto::Keypair;

    /// Builds one roster per replica plus one per client, all sharing keys.
    pub(crate) fn cluster(n: usize, clients: usize) -> (Vec<Peers>, Vec<Peers>) {
        let replica_keys: Vec<Keypair> = (0..n).map(|_| Keypair::new_pair()).collect();
        let client_keys: Vec<Keypair> = (0..clients).map(|_| Keypair::new_pair()).collect();
        let f = (n - 1) / 3;

        let roster = |keys: &[Keypair], base: u16| -> Vec<Principal> {
            keys.iter()
                .enumerate()
                .map(|(i, k)| {
                    let addr = SocketAddr::from(([127, 0, 0, 1], base + i as u16));
                    Principal::new(i, k.pubkey(), addr)
                })
                .collect()
        };

        let mut replica_peers = Vec::new();
        for (i, key) in replica_keys.iter().enumerate() {
            let mut replicas = roster(&replica_keys, 25600);
            let local = replicas.remove(i).with_private_key(Keypair::from_seed(&key.seed()));
            replicas.insert(i, local);
            replica_peers.push(Peers::new(replicas, roster(&client_keys, 25700), Role::Replica, i, f));
        }

        let mut client_peers = Vec::new();
        for (i, key) in client_keys.iter().enumerate() {
            let mut clients = roster(&client_keys, 25700);
            let local = clients.remove(i).with_private_key(Keypair::from_seed(&key.seed()));
            clients.insert(i, local);
            client_peers.push(Peers::new(roster(&replica_keys, 25600), clients, Role::Client, i, f));
        }

        (replica_peers, client_peers)
    }

    /// Installs pairwise session keys as a completed key exchange would.
    pub(crate) fn establish_keys(peers: &mut [Peers]) {
        let n = peers.len();
        for receiver in 0..n {
            for sender in 0..n {
                if receiver == sender {
                    continue;
                }
                let key = peers[receiver].replicas[sender].gen_inkey();
                peers[sender].replicas[receiver].set_outkey(key, 1);
            }
        }
    }

    #[test]
    fn test_primary_rotates_with_view() {
        let (peers, _) = cluster(4, 0);
        assert_eq!(peers[0].primary(0), 0);
        assert_eq!(peers[0].primary(5), 1);
        assert!(peers[1].is_primary(1));
        assert_eq!(peers[0].quorum(), 3);
        assert_eq!(peers[0].prepare_quorum(), 2);
    }

    #[test]
    fn test_find_client_by_value() {
        let (_, clients) = cluster(4, 2);
        let key = clients[1].local().public_key;
        assert_eq!(clients[0].find_client(&key), Some(1));
        assert!(!clients[0].is_member(&key));
    }

    #[test]
    fn test_signature_mode_round() {
        let (peers, _) = cluster(4, 0);
        let digest = [8u8; 32];
        let auth = peers[0].authenticate(&digest, true).unwrap();

        assert!(peers[1].verify(&peers[1].replicas[0], &digest, true, &auth));
        assert!(!peers[1].verify(&peers[1].replicas[2], &digest, true, &auth));
        // mode flag and tag shape must agree
        assert!(!peers[1].verify(&peers[1].replicas[0], &digest, false, &auth));
    }

    #[test]
    fn test_vector_checks_own_entry_only() {
        let (mut peers, _) = cluster(4, 0);
        establish_keys(&mut peers);
        assert!(peers.iter().all(Peers::keys_established));

        let digest = [8u8; 32];
        let Authenticator::Vector(mut tags) = peers[0].authenticate(&digest, false).unwrap() else {
            panic!("expected a vector");
        };
        // corrupting someone else's entry does not matter to replica 1
        tags[2] = [0; 32];
        let auth = Authenticator::Vector(tags.clone());
        assert!(peers[1].verify(&peers[1].replicas[0], &digest, false, &auth));
        assert!(!peers[2].verify(&peers[2].replicas[0], &digest, false, &auth));

        // wrong length is rejected even when the own entry is right
        tags.push([1; 32]);
        let auth = Authenticator::Vector(tags);
        assert!(!peers[1].verify(&peers[1].replicas[0], &digest, false, &auth));
    }

    #[test]
    fn test_vector_without_keys_is_rejected() {
        let (peers, _) = cluster(4, 0);
        let digest = [8u8; 32];
        let auth = peers[0].authenticate(&digest, false).unwrap();

        assert!(!peers[0].keys_established());
        assert!(!peers[1].verify(&peers[1].replicas[0], &digest, false, &auth));
    }
}
