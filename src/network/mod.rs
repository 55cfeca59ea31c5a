use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;

use crate::consensus::timer::TimerKey;
use crate::consensus::types::Seqno;

pub mod node;
pub mod timers;

pub use node::{ChannelTransport, Node, Transport};
pub use timers::TimerManager;

/*
    Delivery is point-to-point, unordered and may drop or duplicate
    datagrams. Nothing here retransmits: the protocol's own timers and
    retries sit above it.

    A node is a single-threaded state machine. Everything it reacts to
    arrives as an `Event`, everything it wants done leaves as an `Action`,
    and the driver in `node` is the only place that touches sockets or
    clocks.
*/

#[derive(Clone, Debug)]
pub enum Event {
    ConnectionMade,
    ConnectionLost,
    PeerMessage { payload: Bytes, from: SocketAddr },
    Timer(TimerKey),
    /// A local application asks the client to run an operation.
    Submit(Bytes),
    Error(String),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Destination {
    Replica(usize),
    Client(usize),
    /// Every replica other than the sender.
    Replicas,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Action {
    Send { to: Destination, payload: Bytes },
    SetTimer { key: TimerKey, after: Duration },
    CancelTimer { key: TimerKey },
}

/// A client request that reached `f + 1` matching replies.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Completion {
    pub timestamp: u64,
    pub result: Bytes,
}

/// Everything one event produced.
#[derive(Clone, Debug, Default)]
pub struct Output {
    pub actions: Vec<Action>,
    /// Sequence numbers executed while handling the event, in order.
    pub executed: Vec<Seqno>,
    pub completed: Vec<Completion>,
}

impl Output {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&mut self, to: Destination, payload: Bytes) {
        self.actions.push(Action::Send { to, payload });
    }

    pub fn push(&mut self, action: Action) {
        self.actions.push(action);
    }

    pub fn extend(&mut self, other: Output) {
        self.actions.extend(other.actions);
        self.executed.extend(other.executed);
        self.completed.extend(other.completed);
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.executed.is_empty() && self.completed.is_empty()
    }
}

/// A node-level state machine the driver can run.
pub trait Handler {
    /// Actions to take once, before any event.
    fn start(&mut self) -> Output;

    /// Processes one event to completion. Never fails: whatever cannot be
    /// handled is logged and dropped.
    fn handle(&mut self, event: Event) -> Output;

    /// Socket addresses a destination stands for, the local node excluded.
    fn resolve(&self, to: Destination) -> Vec<SocketAddr>;

    fn local_addr(&self) -> SocketAddr;
}
