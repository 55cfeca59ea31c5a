use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, debug_span, info, trace};

use super::{Action, Event, Handler, Output, TimerManager};
use crate::error::TransportError;

/// Best-effort datagram delivery between nodes.
pub trait Transport {
    fn send(&self, from: SocketAddr, to: SocketAddr, payload: Bytes) -> Result<(), TransportError>;
}

/// In-process transport: every registered address owns a bounded tokio
/// inbox, and a full or missing inbox drops the datagram.
#[derive(Clone, Default)]
pub struct ChannelTransport {
    routes: Arc<RwLock<HashMap<SocketAddr, mpsc::Sender<Event>>>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the inbox for `addr`. The sender half doubles as the node's
    /// own event channel for timers and local submissions.
    pub fn register(&self, addr: SocketAddr, capacity: usize) -> (mpsc::Sender<Event>, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        if let Ok(mut routes) = self.routes.write() {
            routes.insert(addr, tx.clone());
        }
        (tx, rx)
    }

    /// Stops delivering to `addr`, as if the node had crashed.
    pub fn disconnect(&self, addr: &SocketAddr) {
        if let Ok(mut routes) = self.routes.write() {
            routes.remove(addr);
        }
    }
}

impl Transport for ChannelTransport {
    fn send(&self, from: SocketAddr, to: SocketAddr, payload: Bytes) -> Result<(), TransportError> {
        let routes = self.routes.read().map_err(|_| TransportError::Unreachable(to))?;
        let inbox = routes.get(&to).ok_or(TransportError::Unreachable(to))?;
        inbox
            .try_send(Event::PeerMessage { payload, from })
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => TransportError::Full(to),
                mpsc::error::TrySendError::Closed(_) => TransportError::Unreachable(to),
            })
    }
}

/// Runs one handler: feeds it events one at a time and carries out the
/// actions it returns.
pub struct Node<H, T> {
    handler: H,
    transport: T,
    event_tx: mpsc::Sender<Event>,
    event_rx: mpsc::Receiver<Event>,
    timers: TimerManager,
    observer: Option<mpsc::UnboundedSender<Output>>,
}

impl<H: Handler, T: Transport> Node<H, T> {
    pub fn new(handler: H, transport: T, (event_tx, event_rx): (mpsc::Sender<Event>, mpsc::Receiver<Event>)) -> Self {
        let timers = TimerManager::new(event_tx.clone());
        Node {
            handler,
            transport,
            event_tx,
            event_rx,
            timers,
            observer: None,
        }
    }

    /// Reports executed seqnos and completed requests as they happen.
    pub fn with_observer(mut self, observer: mpsc::UnboundedSender<Output>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Handle for injecting local events such as `Event::Submit`.
    pub fn sender(&self) -> mpsc::Sender<Event> {
        self.event_tx.clone()
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Processes events until `shutdown` fires or every sender is gone, then
    /// hands the handler back.
    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> H {
        let local = self.handler.local_addr();
        info!(node = %local, "node running");

        let out = self.handler.start();
        self.apply(out);

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!(node = %local, "shutdown signal received");
                    break;
                }

                event = self.event_rx.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    let span = debug_span!("handle", node = %local);
                    let _guard = span.enter();
                    let out = self.handler.handle(event);
                    self.apply(out);
                }
            }
        }

        self.timers.cancel_all();
        self.handler
    }

    fn apply(&mut self, out: Output) {
        let local = self.handler.local_addr();
        for action in out.actions {
            match action {
                Action::Send { to, payload } => {
                    for addr in self.handler.resolve(to) {
                        trace!(node = %local, %addr, len = payload.len(), "send");
                        if let Err(err) = self.transport.send(local, addr, payload.clone()) {
                            debug!(node = %local, %err, "datagram dropped");
                        }
                    }
                }
                Action::SetTimer { key, after } => self.timers.set_timer(key, after),
                Action::CancelTimer { key } => self.timers.cancel_timer(key),
            }
        }

        if out.executed.is_empty() && out.completed.is_empty() {
            return;
        }
        if let Some(observer) = &self.observer {
            let report = Output {
                actions: Vec::new(),
                executed: out.executed,
                completed: out.completed,
            };
            // nobody listening any more is fine
            let _ = observer.send(report);
        }
    }
}
