use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::config::ProtocolConfig;
use crate::error::{Rejection, SubmitError};
use crate::network::{Completion, Destination, Event, Handler, Output};
use super::message::{Authenticated, Message, Reply, Request};
use super::peers::Peers;
use super::timer::{Backoff, TimerKey, Timers};
use super::types::{wall_clock_millis, View};

/// The request a client is waiting on, with the replies seen so far.
#[derive(Debug)]
struct Outstanding {
    request: Request,
    replies: HashMap<usize, Reply>,
}

/// Submits one operation at a time and waits for `f + 1` replicas to agree
/// on its result.
pub struct Client {
    pub peers: Peers,
    pub protocol: ProtocolConfig,
    /// Best guess of the replicas' current view.
    view: View,
    timestamp: u64,
    outstanding: Option<Outstanding>,
    retry_backoff: Backoff,
    timers: Timers,
}

impl Client {
    pub fn new(peers: Peers, protocol: ProtocolConfig) -> Self {
        let retry_backoff = Backoff::new(protocol.request_timeout(), protocol.max_view_change_backoff);
        Client {
            peers,
            protocol,
            view: 0,
            timestamp: 0,
            outstanding: None,
            retry_backoff,
            timers: Timers::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.peers.index
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn is_busy(&self) -> bool {
        self.outstanding.is_some()
    }

    /// Timestamp of the outstanding request, if any.
    pub fn pending_timestamp(&self) -> Option<u64> {
        self.outstanding.as_ref().map(|o| o.request.timestamp)
    }

    /// Signs `operation` and sends it to the primary the client believes in.
    /// Operations too large to inline in a pre-prepare go to every replica.
    pub fn submit(&mut self, operation: Bytes) -> Result<Output, SubmitError> {
        if self.outstanding.is_some() {
            return Err(SubmitError::Busy);
        }
        let timestamp = wall_clock_millis().max(self.timestamp + 1);
        let broadcast = operation.len() > self.protocol.inline_request_limit;
        let request = Request::create(&self.peers, timestamp, operation, true)?;
        self.timestamp = timestamp;

        let mut out = Output::new();
        let to = if broadcast {
            Destination::Replicas
        } else {
            Destination::Replica(self.peers.primary(self.view))
        };
        debug!(client = self.peers.index, timestamp, ?to, "submitting request");
        out.send(to, request.to_payload());

        self.retry_backoff.reset();
        out.push(self.timers.arm(TimerKey::ClientRetry { timestamp }, self.retry_backoff.next()));
        self.outstanding = Some(Outstanding {
            request,
            replies: HashMap::new(),
        });
        Ok(out)
    }

    fn on_reply(&mut self, reply: Reply, out: &mut Output) -> Result<(), Rejection> {
        let Some(outstanding) = self.outstanding.as_mut() else {
            return Ok(());
        };
        if reply.client != self.peers.index || reply.timestamp != outstanding.request.timestamp {
            debug!(client = self.peers.index, timestamp = reply.timestamp, "reply for another request");
            return Ok(());
        }
        if !reply.use_signature() {
            return Err(Rejection::Authentication("reply must be signed"));
        }
        let sender = self
            .peers
            .replica(reply.replica)
            .ok_or(Rejection::UnknownSender(reply.replica))?;
        if !reply.verify(&self.peers, sender) {
            warn!(client = self.peers.index, from = reply.replica, "reply signature does not verify");
            return Err(Rejection::Authentication("reply signature"));
        }
        outstanding.replies.entry(reply.replica).or_insert(reply);

        let weak_quorum = self.peers.weak_quorum();
        let mut tally: HashMap<&Bytes, Vec<View>> = HashMap::new();
        for reply in outstanding.replies.values() {
            tally.entry(&reply.result).or_default().push(reply.view);
        }
        let Some((result, views)) = tally.into_iter().find(|(_, views)| views.len() >= weak_quorum) else {
            return Ok(());
        };
        let result = result.clone();
        let view = views.into_iter().max().unwrap_or(self.view);
        let timestamp = outstanding.request.timestamp;

        self.outstanding = None;
        self.view = self.view.max(view);
        self.retry_backoff.reset();
        if let Some(cancel) = self.timers.cancel(TimerKey::ClientRetry { timestamp }) {
            out.push(cancel);
        }
        info!(client = self.peers.index, timestamp, view = self.view, "request completed");
        out.completed.push(Completion { timestamp, result });
        Ok(())
    }

    /// No quorum of replies yet: every replica gets the request and the
    /// client assumes the primary has moved on.
    fn on_retry(&mut self, timestamp: u64, out: &mut Output) {
        let Some(outstanding) = self.outstanding.as_ref() else {
            return;
        };
        if outstanding.request.timestamp != timestamp {
            return;
        }
        self.view += 1;
        let after = self.retry_backoff.next();
        info!(client = self.peers.index, timestamp, view = self.view, ?after, "retrying request");
        out.send(Destination::Replicas, outstanding.request.to_payload());
        out.push(self.timers.arm(TimerKey::ClientRetry { timestamp }, after));
    }
}

impl Handler for Client {
    fn start(&mut self) -> Output {
        info!(client = self.peers.index, replicas = self.peers.n(), "client starting");
        Output::new()
    }

    fn handle(&mut self, event: Event) -> Output {
        let mut out = Output::new();
        match event {
            Event::PeerMessage { payload, from } => match Message::from_payload(&payload, from) {
                Ok(Message::Reply(reply)) => {
                    if let Err(rejection) = self.on_reply(reply, &mut out) {
                        warn!(client = self.peers.index, %from, %rejection, "dropped reply");
                    }
                }
                Ok(other) => debug!(client = self.peers.index, kind = ?other.kind(), "ignoring message"),
                Err(err) => debug!(client = self.peers.index, %from, %err, "undecodable datagram"),
            },
            Event::Timer(key) => {
                if !self.timers.fired(&key) {
                    return out;
                }
                if let TimerKey::ClientRetry { timestamp } = key {
                    self.on_retry(timestamp, &mut out);
                }
            }
            Event::Submit(operation) => match self.submit(operation) {
                Ok(submitted) => out.extend(submitted),
                Err(err) => warn!(client = self.peers.index, %err, "cannot submit"),
            },
            Event::ConnectionMade | Event::ConnectionLost => {}
            Event::Error(err) => warn!(client = self.peers.index, %err, "transport error"),
        }
        out
    }

    fn resolve(&self, to: Destination) -> Vec<SocketAddr> {
        match to {
            Destination::Replica(index) => self.peers.replica(index).map(|p| p.addr).into_iter().collect(),
            Destination::Client(_) => Vec::new(),
            Destination::Replicas => self.peers.replicas.iter().map(|p| p.addr).collect(),
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.peers.local().addr
    }
}
