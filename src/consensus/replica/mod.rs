use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;

use tracing::{debug, info, warn};

use crate::common::crypto::Digest;
use crate::config::ProtocolConfig;
use crate::error::{Rejection, Violation};
use crate::network::{Destination, Event, Handler, Output};
use super::log::Log;
use super::message::{Authenticated, Message, PrePrepare, Reply, ViewChange};
use super::peers::Peers;
use super::qc::CertificateTracker;
use super::service::Service;
use super::store::RequestStore;
use super::timer::{Backoff, TimerKey, Timers};
use super::types::{Seqno, View};

mod checkpoint;
mod keys;
mod normal;
mod view_change;

/*
    One replica of the group, as a synchronous state machine.

    `handle` takes one event, runs it to completion and returns what should
    be sent and which timers should change. Nothing inside ever blocks or
    fails outward: a message that cannot be used is logged and dropped.

    The replica is `active` in `view` once it has a pre-prepare source for
    it: at start for view 0, and after installing a new-view otherwise.
    While a view change to `view` is in progress it only takes view-change
    traffic and buffers the rest.
*/

/// Whether a message for some view can be handled now.
enum Admit {
    Now,
    Later,
}

pub struct Replica<S: Service> {
    pub peers: Peers,
    pub protocol: ProtocolConfig,
    pub view: View,
    pub active: bool,
    pub log: Log,
    pub certs: CertificateTracker,
    pub store: RequestStore,
    pub service: S,
    timers: Timers,
    view_change_backoff: Backoff,
    /// Highest seqno assigned by this replica as primary of `view`.
    next_seqno: Seqno,
    /// Pre-prepares of the current view whose requests are not all known.
    parked: BTreeMap<Seqno, PrePrepare>,
    /// Latest view change from each replica, the local one included.
    view_changes: BTreeMap<usize, ViewChange>,
    buffered: VecDeque<Message>,
    replies: HashMap<usize, Reply>,
    /// Own checkpoint digests not yet stable.
    checkpoints: BTreeMap<Seqno, Digest>,
    stable_digest: Digest,
    suspicion: HashMap<usize, u64>,
    key_timestamp: u64,
}

impl<S: Service> Replica<S> {
    pub fn new(peers: Peers, protocol: ProtocolConfig, service: S) -> Self {
        let f = peers.f;
        let index = peers.index;
        let view_change_backoff = Backoff::new(protocol.view_change_timeout(), protocol.max_view_change_backoff);
        let stable_digest = service.state_digest();

        Replica {
            log: Log::new(protocol.log_window),
            certs: CertificateTracker::new(f, index),
            store: RequestStore::new(),
            view: 0,
            active: true,
            timers: Timers::new(),
            view_change_backoff,
            next_seqno: 0,
            parked: BTreeMap::new(),
            view_changes: BTreeMap::new(),
            buffered: VecDeque::new(),
            replies: HashMap::new(),
            checkpoints: BTreeMap::new(),
            stable_digest,
            suspicion: HashMap::new(),
            key_timestamp: 0,
            peers,
            protocol,
            service,
        }
    }

    pub fn index(&self) -> usize {
        self.peers.index
    }

    pub fn is_primary(&self) -> bool {
        self.peers.is_primary(self.view)
    }

    /// Authentication failures seen per replica.
    pub fn suspicion(&self, replica: usize) -> u64 {
        self.suspicion.get(&replica).copied().unwrap_or(0)
    }

    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    /// Commits and checkpoints use authenticator vectors once every
    /// outbound session key has been rotated in.
    fn vote_uses_signature(&self) -> bool {
        !self.peers.keys_established()
    }

    fn admit_view(&self, view: View) -> Result<Admit, Rejection> {
        if view < self.view {
            return Err(Violation::StaleView {
                view,
                current: self.view,
            }
            .into());
        }
        if view > self.view || !self.active {
            return Ok(Admit::Later);
        }
        Ok(Admit::Now)
    }

    /// Checks a message's authenticator against the replica it names.
    fn check_replica<M: Authenticated>(&mut self, message: &M, sender: usize) -> Result<(), Rejection> {
        let principal = self.peers.replica(sender).ok_or(Rejection::UnknownSender(sender))?;
        if message.verify(&self.peers, principal) {
            return Ok(());
        }
        let failures = self.suspicion.entry(sender).or_default();
        *failures += 1;
        warn!(
            replica = self.peers.index,
            sender,
            failures = *failures,
            kind = ?M::KIND,
            "authentication failed"
        );
        Err(Rejection::Authentication("authenticator does not verify"))
    }

    fn buffer(&mut self, message: Message) {
        if self.buffered.len() >= self.protocol.max_buffered_messages {
            debug!(replica = self.peers.index, kind = ?message.kind(), "buffer full, dropping");
            return;
        }
        self.buffered.push_back(message);
    }

    /// Re-dispatches buffered messages that may be usable now.
    fn replay_buffered(&mut self, out: &mut Output) {
        if !self.active {
            return;
        }
        let pending = std::mem::take(&mut self.buffered);
        for message in pending {
            self.deliver(message, out);
        }
    }

    fn deliver(&mut self, message: Message, out: &mut Output) {
        let kind = message.kind();
        if let Err(rejection) = self.dispatch(message, out) {
            match rejection {
                Rejection::Decode(_) => debug!(replica = self.peers.index, ?kind, %rejection, "dropped"),
                Rejection::Protocol(Violation::StaleView { .. }) => {
                    debug!(replica = self.peers.index, ?kind, %rejection, "dropped")
                }
                _ => warn!(replica = self.peers.index, ?kind, %rejection, "dropped"),
            }
        }
    }

    fn dispatch(&mut self, message: Message, out: &mut Output) -> Result<(), Rejection> {
        match message {
            Message::Request(request) => self.on_request(request, out),
            Message::PrePrepare(pre_prepare) => match self.admit_view(pre_prepare.view)? {
                Admit::Now => self.on_pre_prepare(pre_prepare, out),
                Admit::Later => {
                    self.buffer(Message::PrePrepare(pre_prepare));
                    Ok(())
                }
            },
            Message::Prepare(prepare) => match self.admit_view(prepare.view)? {
                Admit::Now => self.on_prepare(prepare, out),
                Admit::Later => {
                    self.buffer(Message::Prepare(prepare));
                    Ok(())
                }
            },
            Message::Commit(commit) => match self.admit_view(commit.view)? {
                Admit::Now => self.on_commit(commit, out),
                Admit::Later => {
                    self.buffer(Message::Commit(commit));
                    Ok(())
                }
            },
            Message::Checkpoint(checkpoint) => self.on_checkpoint(checkpoint, out),
            Message::ViewChange(view_change) => self.on_view_change(view_change, out),
            Message::NewView(new_view) => self.on_new_view(new_view, out),
            Message::NewKey(new_key) => self.on_new_key(new_key),
            Message::Reply(reply) => {
                debug!(replica = self.peers.index, from = reply.replica, "ignoring reply");
                Ok(())
            }
        }
    }

    fn on_timer(&mut self, key: TimerKey, out: &mut Output) {
        if !self.timers.fired(&key) {
            return;
        }
        match key {
            TimerKey::Request { view } if view == self.view && self.active => {
                info!(replica = self.peers.index, view, "request timed out, starting view change");
                self.start_view_change(view + 1, out);
            }
            TimerKey::ViewChange { view } if view == self.view && !self.active => {
                info!(replica = self.peers.index, view, "view change timed out");
                self.start_view_change(view + 1, out);
            }
            _ => debug!(replica = self.peers.index, ?key, "stale timer"),
        }
    }
}

impl<S: Service> Handler for Replica<S> {
    fn start(&mut self) -> Output {
        let mut out = Output::new();
        info!(replica = self.peers.index, n = self.peers.n(), f = self.peers.f, "replica starting");
        self.send_new_key(&mut out);
        out
    }

    fn handle(&mut self, event: Event) -> Output {
        let mut out = Output::new();
        match event {
            Event::ConnectionMade => self.send_new_key(&mut out),
            Event::ConnectionLost => debug!(replica = self.peers.index, "connection lost"),
            Event::PeerMessage { payload, from } => match Message::from_payload(&payload, from) {
                Ok(message) => self.deliver(message, &mut out),
                Err(err) => debug!(replica = self.peers.index, %from, %err, "undecodable datagram"),
            },
            Event::Timer(key) => self.on_timer(key, &mut out),
            Event::Submit(_) => debug!(replica = self.peers.index, "replicas do not submit requests"),
            Event::Error(err) => warn!(replica = self.peers.index, %err, "transport error"),
        }
        out
    }

    fn resolve(&self, to: Destination) -> Vec<SocketAddr> {
        match to {
            Destination::Replica(index) if index != self.peers.index => {
                self.peers.replica(index).map(|p| p.addr).into_iter().collect()
            }
            Destination::Replica(_) => Vec::new(),
            Destination::Client(index) => self.peers.client(index).map(|p| p.addr).into_iter().collect(),
            Destination::Replicas => self
                .peers
                .replicas
                .iter()
                .filter(|p| p.index != self.peers.index)
                .map(|p| p.addr)
                .collect(),
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.peers.local().addr
    }
}

#[cfg(test)]
pub(crate) mod tests;
