use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;

use bytes::Bytes;

use super::*;
use crate::consensus::log::Phase;
use crate::consensus::message::{authenticated, Checkpoint, MessageKind, Prepare, Request, RequestEntry};
use crate::consensus::peers::tests::{cluster, establish_keys};
use crate::consensus::service::KvService;
use crate::network::Action;

/// Routes datagrams between in-process replicas until the network is quiet.
pub(crate) struct Harness {
    pub replicas: Vec<Replica<KvService>>,
    pub client: Peers,
    pub crashed: HashSet<usize>,
    /// Message kinds silently lost in transit.
    pub dropped: HashSet<MessageKind>,
    pub replies: Vec<Reply>,
    pub armed: HashSet<(usize, TimerKey)>,
    queue: VecDeque<(usize, Bytes, SocketAddr)>,
}

impl Harness {
    pub fn new(n: usize, protocol: ProtocolConfig) -> Self {
        Self::build(n, protocol, false)
    }

    pub fn with_keys(n: usize, protocol: ProtocolConfig) -> Self {
        Self::build(n, protocol, true)
    }

    fn build(n: usize, protocol: ProtocolConfig, keys: bool) -> Self {
        let (mut peers, mut clients) = cluster(n, 1);
        if keys {
            establish_keys(&mut peers);
        }
        let replicas = peers
            .into_iter()
            .map(|p| Replica::new(p, protocol.clone(), KvService::new()))
            .collect();
        Harness {
            replicas,
            client: clients.remove(0),
            crashed: HashSet::new(),
            dropped: HashSet::new(),
            replies: Vec::new(),
            armed: HashSet::new(),
            queue: VecDeque::new(),
        }
    }

    pub fn start(&mut self) {
        for i in 0..self.replicas.len() {
            let out = self.replicas[i].start();
            self.collect(i, out);
        }
        self.run();
    }

    pub fn request(&self, timestamp: u64, op: &'static str) -> Request {
        Request::create(&self.client, timestamp, Bytes::from_static(op.as_bytes()), true).unwrap()
    }

    pub fn submit(&mut self, to: &[usize], request: &Request) {
        let from = self.client.local().addr;
        for &i in to {
            self.queue.push_back((i, request.to_payload(), from));
        }
        self.run();
    }

    /// Hands one datagram to one replica and returns what it produced,
    /// without routing any of it.
    pub fn inject(&mut self, to: usize, from: usize, payload: Bytes) -> Output {
        let from = self.replicas[from].local_addr();
        self.replicas[to].handle(Event::PeerMessage { payload, from })
    }

    pub fn fire(&mut self, replica: usize, key: TimerKey) {
        self.armed.remove(&(replica, key));
        let out = self.replicas[replica].handle(Event::Timer(key));
        self.collect(replica, out);
        self.run();
    }

    fn collect(&mut self, from: usize, out: Output) {
        if self.crashed.contains(&from) {
            return;
        }
        let addr = self.replicas[from].local_addr();
        let n = self.replicas.len();
        for action in out.actions {
            match action {
                Action::Send { to, payload } => {
                    let lost = MessageKind::try_from(payload[0]).is_ok_and(|k| self.dropped.contains(&k));
                    if lost {
                        continue;
                    }
                    match to {
                        Destination::Client(_) => {
                            if let Ok(reply) = Reply::from_payload(&payload, None) {
                                self.replies.push(reply);
                            }
                        }
                        Destination::Replica(j) => self.queue.push_back((j, payload, addr)),
                        Destination::Replicas => {
                            for j in (0..n).filter(|j| *j != from) {
                                self.queue.push_back((j, payload.clone(), addr));
                            }
                        }
                    }
                }
                Action::SetTimer { key, .. } => {
                    self.armed.insert((from, key));
                }
                Action::CancelTimer { key } => {
                    self.armed.remove(&(from, key));
                }
            }
        }
    }

    pub fn run(&mut self) {
        while let Some((to, payload, from)) = self.queue.pop_front() {
            if self.crashed.contains(&to) {
                continue;
            }
            let out = self.replicas[to].handle(Event::PeerMessage { payload, from });
            self.collect(to, out);
        }
    }

    pub fn live(&self) -> impl Iterator<Item = &Replica<KvService>> {
        self.replicas
            .iter()
            .filter(|r| !self.crashed.contains(&r.index()))
    }
}

fn small_batches() -> ProtocolConfig {
    ProtocolConfig {
        request_in_pre_prepare: 2,
        ..ProtocolConfig::default()
    }
}

#[test]
fn test_normal_case_executes_everywhere() {
    let mut harness = Harness::new(4, ProtocolConfig::default());
    let request = harness.request(1, "SET a 1");
    harness.submit(&[0], &request);

    for replica in &harness.replicas {
        assert_eq!(replica.log.last_executed, 1);
        assert_eq!(replica.log.phase(1), Phase::Executed);
        assert_eq!(replica.service.get("a"), Some("1"));
        assert!(!replica.store.has_unexecuted());
    }
    assert_eq!(harness.replies.len(), 4);
    assert!(harness.replies.iter().all(|r| r.result.as_ref() == b"OK" && r.timestamp == 1));
}

#[test]
fn test_backup_relays_request_to_primary() {
    let mut harness = Harness::new(4, ProtocolConfig::default());
    let request = harness.request(1, "SET k v");
    harness.submit(&[2], &request);

    assert!(harness.replicas.iter().all(|r| r.service.get("k") == Some("v")));
    // every request timer was cancelled by execution
    assert!(harness.armed.is_empty());
}

#[test]
fn test_key_exchange_switches_votes_to_vectors() {
    let mut harness = Harness::new(4, ProtocolConfig::default());
    assert!(harness.replicas.iter().all(|r| r.vote_uses_signature()));

    harness.start();
    for replica in &harness.replicas {
        assert!(replica.peers.keys_established());
        assert!(!replica.vote_uses_signature());
    }

    let request = harness.request(1, "SET a 2");
    harness.submit(&[0], &request);
    for replica in &harness.replicas {
        assert_eq!(replica.log.last_executed, 1);
        // pre-prepares stay signed, so every replica holds a usable proof
        assert_eq!(replica.log.proofs().count(), 1);
    }
}

#[test]
fn test_vector_pre_prepare_is_rejected() {
    let mut harness = Harness::with_keys(4, ProtocolConfig::default());
    let requests = vec![RequestEntry::Full(harness.request(1, "SET a 3"))];
    let pre_prepare = PrePrepare::new(0, 1, requests, Bytes::new(), false);
    let pre_prepare = authenticated(pre_prepare, &harness.replicas[0].peers).unwrap();
    assert!(!pre_prepare.use_signature());

    assert!(harness.inject(1, 0, pre_prepare.to_payload()).is_empty());
    assert_eq!(harness.replicas[1].log.phase(1), Phase::Idle);
}

fn prepares_sent(out: &Output) -> usize {
    out.actions
        .iter()
        .filter(|a| matches!(a, Action::Send { payload, .. } if payload[0] == MessageKind::Prepare as u8))
        .count()
}

#[test]
fn test_parked_pre_prepare_binds_its_slot() {
    let mut harness = Harness::new(4, ProtocolConfig::default());
    let unseen = harness.request(1, "SET a 1");
    let other = harness.request(2, "SET a 2");
    let by_digest = PrePrepare::new(0, 1, vec![RequestEntry::Digest(unseen.digest())], Bytes::new(), true);
    let full = PrePrepare::new(0, 1, vec![RequestEntry::Full(other)], Bytes::new(), true);
    let by_digest = authenticated(by_digest, &harness.replicas[0].peers).unwrap();
    let full = authenticated(full, &harness.replicas[0].peers).unwrap();

    let out = harness.inject(1, 0, by_digest.to_payload());
    assert_eq!(prepares_sent(&out), 0);
    assert_eq!(harness.replicas[1].log.phase(1), Phase::Idle);

    // a second pre-prepare for the parked slot is equivocation
    let out = harness.inject(1, 0, full.to_payload());
    assert_eq!(prepares_sent(&out), 0);
    assert_eq!(harness.replicas[1].view, 1);

    // the missing request no longer revives the parked one
    let from = harness.client.local().addr;
    let out = harness.replicas[1].handle(Event::PeerMessage {
        payload: unseen.to_payload(),
        from,
    });
    assert_eq!(prepares_sent(&out), 0);
    assert_eq!(harness.replicas[1].log.phase(1), Phase::Idle);
}

#[test]
fn test_parked_pre_prepare_never_replaces_accepted_one() {
    let mut harness = Harness::new(4, ProtocolConfig::default());
    let unseen = harness.request(1, "SET a 1");
    let other = harness.request(2, "SET a 2");
    let full = PrePrepare::new(0, 1, vec![RequestEntry::Full(other)], Bytes::new(), true);
    let full = authenticated(full, &harness.replicas[0].peers).unwrap();
    let digest = full.content_digest();

    assert_eq!(prepares_sent(&harness.inject(1, 0, full.to_payload())), 1);

    // parking behind an accepted pre-prepare is still a conflict
    let by_digest = PrePrepare::new(0, 1, vec![RequestEntry::Digest(unseen.digest())], Bytes::new(), true);
    let by_digest = authenticated(by_digest, &harness.replicas[0].peers).unwrap();
    let out = harness.inject(1, 0, by_digest.to_payload());
    assert_eq!(prepares_sent(&out), 0);
    assert_eq!(harness.replicas[1].view, 1);
    assert_eq!(harness.replicas[1].log.slot(1).and_then(|s| s.voted(0)), Some(digest));
}

#[test]
fn test_batch_over_cap_is_rejected() {
    let mut harness = Harness::new(4, small_batches());
    let requests = (1..=3)
        .map(|ts| RequestEntry::Full(harness.request(ts, "GET a")))
        .collect();
    let pre_prepare = PrePrepare::new(0, 1, requests, Bytes::new(), true);
    let pre_prepare = authenticated(pre_prepare, &harness.replicas[0].peers).unwrap();

    let out = harness.inject(1, 0, pre_prepare.to_payload());
    assert!(out.is_empty());
    assert_eq!(harness.replicas[1].log.phase(1), Phase::Idle);
}

#[test]
fn test_forged_pre_prepare_raises_suspicion() {
    let mut harness = Harness::new(4, ProtocolConfig::default());
    let requests = vec![RequestEntry::Full(harness.request(1, "SET a 9"))];
    let forged = PrePrepare::new(0, 1, requests, Bytes::new(), true);
    let forged = authenticated(forged, &harness.replicas[2].peers).unwrap();

    let out = harness.inject(1, 2, forged.to_payload());
    assert!(out.is_empty());
    assert_eq!(harness.replicas[1].suspicion(0), 1);
    assert_eq!(harness.replicas[1].log.phase(1), Phase::Idle);
}

#[test]
fn test_pre_prepare_outside_window_is_rejected() {
    let mut harness = Harness::new(4, ProtocolConfig::default());
    let high = harness.replicas[1].log.high();
    let pre_prepare = authenticated(PrePrepare::null(0, high + 1, true), &harness.replicas[0].peers).unwrap();

    assert!(harness.inject(1, 0, pre_prepare.to_payload()).is_empty());
    assert!(harness.replicas[1].log.is_empty());
}

#[test]
fn test_future_view_is_buffered_and_past_view_dropped() {
    let mut harness = Harness::new(4, ProtocolConfig::default());
    let ahead = authenticated(Prepare::new(3, 1, [7u8; 32], 2, true), &harness.replicas[2].peers).unwrap();
    harness.inject(1, 2, ahead.to_payload());
    assert_eq!(harness.replicas[1].buffered_len(), 1);

    harness.replicas[1].view = 5;
    let behind = authenticated(Prepare::new(4, 1, [7u8; 32], 2, true), &harness.replicas[2].peers).unwrap();
    harness.inject(1, 2, behind.to_payload());
    assert_eq!(harness.replicas[1].buffered_len(), 1);
}

#[test]
fn test_conflicting_pre_prepare_starts_view_change() {
    let mut harness = Harness::new(4, ProtocolConfig::default());
    let first = PrePrepare::new(0, 1, vec![RequestEntry::Full(harness.request(1, "SET a 1"))], Bytes::new(), true);
    let second = PrePrepare::new(0, 1, vec![RequestEntry::Full(harness.request(2, "SET a 2"))], Bytes::new(), true);
    let first = authenticated(first, &harness.replicas[0].peers).unwrap();
    let second = authenticated(second, &harness.replicas[0].peers).unwrap();

    harness.inject(1, 0, first.to_payload());
    assert_eq!(harness.replicas[1].log.phase(1), Phase::PrePrepared);

    let out = harness.inject(1, 0, second.to_payload());
    assert_eq!(harness.replicas[1].view, 1);
    assert!(!harness.replicas[1].active);
    let sent_view_change = out.actions.iter().any(|a| {
        matches!(a, Action::Send { to: Destination::Replicas, payload } if payload[0] == MessageKind::ViewChange as u8)
    });
    assert!(sent_view_change);
}

#[test]
fn test_view_change_after_primary_crash() {
    let mut harness = Harness::new(4, ProtocolConfig::default());
    harness.crashed.insert(0);
    let request = harness.request(1, "SET a 1");
    harness.submit(&[1, 2, 3], &request);
    assert!(harness.live().all(|r| r.log.last_executed == 0));

    for i in 1..4 {
        assert!(harness.armed.contains(&(i, TimerKey::Request { view: 0 })));
    }
    // the third firing finds its timer already cancelled by the view change
    for i in 1..4 {
        harness.fire(i, TimerKey::Request { view: 0 });
    }

    for replica in harness.live() {
        assert_eq!(replica.view, 1);
        assert!(replica.active);
        assert_eq!(replica.log.last_executed, 1);
        assert_eq!(replica.service.get("a"), Some("1"));
    }
    assert!(!harness.armed.iter().any(|(_, k)| matches!(k, TimerKey::ViewChange { .. })));
}

#[test]
fn test_prepared_batch_survives_view_change() {
    let mut harness = Harness::new(4, ProtocolConfig::default());
    harness.dropped.insert(MessageKind::Commit);
    let request = harness.request(1, "SET a 1");
    harness.submit(&[0], &request);
    for replica in &harness.replicas {
        assert_eq!(replica.log.phase(1), Phase::Prepared);
        assert_eq!(replica.log.proofs().count(), 1);
    }

    harness.dropped.clear();
    harness.crashed.insert(0);
    for i in 1..4 {
        harness.fire(i, TimerKey::Request { view: 0 });
    }

    for replica in harness.live() {
        assert_eq!(replica.view, 1);
        assert_eq!(replica.log.last_executed, 1);
        assert_eq!(replica.service.get("a"), Some("1"));
    }
    // one execution per live replica, no replay of the old view's batch
    assert_eq!(harness.replies.len(), 3);
}

#[test]
fn test_lagging_replica_joins_view_change() {
    let mut harness = Harness::new(4, ProtocolConfig::default());
    let request = harness.request(1, "SET a 1");
    harness.crashed.insert(0);
    harness.submit(&[1, 2, 3], &request);

    // two timeouts are enough to pull the third backup along
    harness.fire(1, TimerKey::Request { view: 0 });
    assert!(harness.replicas[3].active);
    harness.fire(2, TimerKey::Request { view: 0 });

    assert!(harness.live().all(|r| r.view == 1 && r.active));
    assert!(harness.live().all(|r| r.log.last_executed == 1));
}

#[test]
fn test_checkpoint_moves_window() {
    let protocol = ProtocolConfig {
        checkpoint_interval: 2,
        log_window: 4,
        ..ProtocolConfig::default()
    };
    let mut harness = Harness::new(4, protocol);
    for ts in 1..=3 {
        let request = harness.request(ts, "SET a x");
        harness.submit(&[0], &request);
    }

    for replica in &harness.replicas {
        assert_eq!(replica.log.last_executed, 3);
        assert_eq!(replica.log.low, 2);
        assert_eq!(replica.log.high(), 6);
        assert_ne!(replica.stable_digest, KvService::new().state_digest());
    }
}

#[test]
fn test_retransmitted_request_gets_cached_reply() {
    let mut harness = Harness::new(4, ProtocolConfig::default());
    let request = harness.request(1, "SET a 1");
    harness.submit(&[0], &request);
    assert_eq!(harness.replies.len(), 4);

    harness.submit(&[1], &request);
    assert_eq!(harness.replies.len(), 5);
    assert_eq!(harness.replicas[1].log.last_executed, 1);
}

#[test]
fn test_checkpoints_outside_window_are_dropped() {
    let mut harness = Harness::new(4, ProtocolConfig::default());
    let high = harness.replicas[1].log.high();
    let interval = harness.replicas[1].protocol.checkpoint_interval;

    let mut seqnos: Vec<Seqno> = (1..=50).map(|i| high + i * interval).collect();
    seqnos.push(interval + 1);
    for seqno in seqnos {
        let checkpoint = Checkpoint::new(seqno, [3u8; 32], 2, true);
        let checkpoint = authenticated(checkpoint, &harness.replicas[2].peers).unwrap();
        harness.inject(1, 2, checkpoint.to_payload());
    }
    assert_eq!(harness.replicas[1].certs.len(), 0);

    let checkpoint = authenticated(Checkpoint::new(interval, [3u8; 32], 2, true), &harness.replicas[2].peers).unwrap();
    harness.inject(1, 2, checkpoint.to_payload());
    assert_eq!(harness.replicas[1].certs.len(), 1);
}
