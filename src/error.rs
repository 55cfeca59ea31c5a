//! Error taxonomy.
//!
//! Everything except [`ConfigError`] is a per-message drop reason: the
//! replica logs it and moves on to the next event. Configuration errors are
//! only produced at start-up and are fatal.

use std::net::SocketAddr;

use thiserror::Error;

pub use crate::common::codec::DecodeError;
pub use crate::common::crypto::CryptoError;

use crate::consensus::types::{Seqno, View};

/// Why a single inbound message was discarded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("authentication failed: {0}")]
    Authentication(&'static str),
    #[error("protocol violation: {0}")]
    Protocol(#[from] Violation),
    #[error("unknown sender {0}")]
    UnknownSender(usize),
}

/// Well-formed, authentic messages that a correct peer would not have sent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    #[error("stale view {view} (current {current})")]
    StaleView { view: View, current: View },
    #[error("seqno {seqno} outside window ({low}, {high}]")]
    OutOfWindow { seqno: Seqno, low: Seqno, high: Seqno },
    #[error("checkpoint seqno {seqno} is not a multiple of {interval}")]
    UnalignedCheckpoint { seqno: Seqno, interval: u64 },
    #[error("batch of {len} requests exceeds cap {cap}")]
    BatchTooLarge { len: usize, cap: usize },
    #[error("conflicting pre-prepare at view {view} seqno {seqno}")]
    ConflictingPrePrepare { view: View, seqno: Seqno },
    #[error("sender {0} is not the primary")]
    NotPrimary(usize),
    #[error("stale request timestamp {timestamp} from client {client}")]
    StaleRequest { client: usize, timestamp: u64 },
    #[error("invalid view-change evidence: {0}")]
    InvalidEvidence(&'static str),
    #[error("new-view does not match the view-change evidence")]
    NewViewMismatch,
    #[error("stale session key timestamp {0}")]
    StaleKey(u64),
}

/// Why a client could not submit an operation.
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("a request is already outstanding")]
    Busy,
    #[error("cannot sign request: {0}")]
    Crypto(#[from] CryptoError),
}

/// Why a datagram could not be handed to the transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("no route to {0}")]
    Unreachable(SocketAddr),
    #[error("inbox of {0} is full")]
    Full(SocketAddr),
}

/// Fatal start-up configuration problems.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("invalid hex in {field}: {reason}")]
    InvalidHex { field: &'static str, reason: String },
    #[error("invalid address {0}")]
    InvalidAddress(String),
    #[error("{replicas} replicas cannot tolerate {f} faults (need at least {needed})")]
    RosterTooSmall { replicas: usize, f: usize, needed: usize },
    #[error("roster entry {position} has index {index}")]
    IndexMismatch { position: usize, index: usize },
    #[error("node index {index} out of range for {count} {role}s")]
    IndexOutOfRange { index: usize, count: usize, role: &'static str },
    #[error("private key does not match roster entry {0}")]
    KeyMismatch(usize),
    #[error("invalid protocol parameter: {0}")]
    InvalidParameter(&'static str),
}
