use std::time::{SystemTime, UNIX_EPOCH};

use serde::Deserialize;

pub type View = u64;
pub type Seqno = u64;

/// Which group a node belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Replica,
    Client,
}

/// `extra` bit 1: the message is signed rather than carrying an
/// authenticator vector. Bit 0 is reserved.
pub const EXTRA_SIGNATURE: u64 = 1 << 1;

pub fn extra_for(use_signature: bool) -> u64 {
    if use_signature {
        EXTRA_SIGNATURE
    } else {
        0
    }
}

/// Milliseconds since the epoch, or zero on a clock set before it.
pub fn wall_clock_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
