//! Node configuration, read from TOML.
//!
//! ```toml
//! [protocol]
//! f = 1
//!
//! [node]
//! role = "replica"
//! index = 0
//! private_key = "<hex ed25519 seed>"
//!
//! [[replicas]]
//! index = 0
//! public_key = "<hex>"
//! exchange_key = "<hex>"
//! ip = "127.0.0.1"
//! port = 25600
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::common::crypto::{Keypair, Pubkey};
use crate::consensus::peers::Peers;
use crate::consensus::principal::Principal;
use crate::consensus::types::Role;
use crate::error::ConfigError;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub protocol: ProtocolConfig,

    pub node: NodeConfig,

    #[serde(default)]
    pub replicas: Vec<PrincipalEntry>,

    #[serde(default)]
    pub clients: Vec<PrincipalEntry>,
}

/// Protocol parameters shared by every node of a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProtocolConfig {
    /// Faults tolerated.
    #[serde(default = "default_f")]
    pub f: usize,

    /// Batch cap: requests per pre-prepare.
    #[serde(default = "default_request_in_pre_prepare")]
    pub request_in_pre_prepare: usize,

    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,

    /// Width of the accepted seqno range above the last stable checkpoint.
    #[serde(default = "default_log_window")]
    pub log_window: u64,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_view_change_timeout_ms")]
    pub view_change_timeout_ms: u64,

    /// Cap on the doubling exponent of both timeouts.
    #[serde(default = "default_max_view_change_backoff")]
    pub max_view_change_backoff: u32,

    /// Messages for future views held per node before new ones are dropped.
    #[serde(default = "default_max_buffered_messages")]
    pub max_buffered_messages: usize,

    /// Operations larger than this go into pre-prepares by digest only.
    #[serde(default = "default_inline_request_limit")]
    pub inline_request_limit: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            f: default_f(),
            request_in_pre_prepare: default_request_in_pre_prepare(),
            checkpoint_interval: default_checkpoint_interval(),
            log_window: default_log_window(),
            request_timeout_ms: default_request_timeout_ms(),
            view_change_timeout_ms: default_view_change_timeout_ms(),
            max_view_change_backoff: default_max_view_change_backoff(),
            max_buffered_messages: default_max_buffered_messages(),
            inline_request_limit: default_inline_request_limit(),
        }
    }
}

impl ProtocolConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn view_change_timeout(&self) -> Duration {
        Duration::from_millis(self.view_change_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_in_pre_prepare == 0 {
            return Err(ConfigError::InvalidParameter("request_in_pre_prepare must be positive"));
        }
        if self.checkpoint_interval == 0 || self.checkpoint_interval > self.log_window {
            return Err(ConfigError::InvalidParameter(
                "checkpoint_interval must be in 1..=log_window",
            ));
        }
        if self.request_timeout_ms == 0 || self.view_change_timeout_ms == 0 {
            return Err(ConfigError::InvalidParameter("timeouts must be positive"));
        }
        Ok(())
    }
}

fn default_f() -> usize {
    1
}

fn default_request_in_pre_prepare() -> usize {
    16
}

fn default_checkpoint_interval() -> u64 {
    128
}

fn default_log_window() -> u64 {
    256
}

fn default_request_timeout_ms() -> u64 {
    2000
}

fn default_view_change_timeout_ms() -> u64 {
    4000
}

fn default_max_view_change_backoff() -> u32 {
    6
}

fn default_max_buffered_messages() -> usize {
    1024
}

fn default_inline_request_limit() -> usize {
    4096
}

/// The local node's identity.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub role: Role,

    /// Looked up from the key when absent.
    #[serde(default)]
    pub index: Option<usize>,

    /// Hex-encoded Ed25519 seed.
    pub private_key: String,
}

/// One roster entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PrincipalEntry {
    pub index: usize,
    pub public_key: String,
    pub exchange_key: String,
    pub ip: String,
    pub port: u16,
}

impl PrincipalEntry {
    pub fn new(index: usize, pubkey: &Pubkey, addr: SocketAddr) -> Self {
        PrincipalEntry {
            index,
            public_key: hex::encode(pubkey.key),
            exchange_key: hex::encode(pubkey.exchange),
            ip: addr.ip().to_string(),
            port: addr.port(),
        }
    }

    fn principal(&self) -> Result<Principal, ConfigError> {
        let public_key = Pubkey {
            key: decode_key("public_key", &self.public_key)?,
            exchange: decode_key("exchange_key", &self.exchange_key)?,
        };
        let addr = format!("{}:{}", self.ip, self.port)
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidAddress(format!("{}:{}", self.ip, self.port)))?;
        Ok(Principal::new(self.index, public_key, addr))
    }
}

fn decode_key(field: &'static str, text: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = hex::decode(text.trim()).map_err(|e| ConfigError::InvalidHex {
        field,
        reason: e.to_string(),
    })?;
    bytes.as_slice().try_into().map_err(|_| ConfigError::InvalidHex {
        field,
        reason: format!("expected 32 bytes, found {}", bytes.len()),
    })
}

fn roster(entries: &[PrincipalEntry]) -> Result<Vec<Principal>, ConfigError> {
    entries
        .iter()
        .enumerate()
        .map(|(position, entry)| {
            if entry.index != position {
                return Err(ConfigError::IndexMismatch {
                    position,
                    index: entry.index,
                });
            }
            entry.principal()
        })
        .collect()
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn keypair(&self) -> Result<Keypair, ConfigError> {
        let seed = decode_key("private_key", &self.node.private_key)?;
        Ok(Keypair::from_seed(&seed))
    }

    /// Validates the whole configuration and builds the local node's view
    /// of both groups.
    pub fn peers(&self) -> Result<Peers, ConfigError> {
        self.protocol.validate()?;
        let f = self.protocol.f;
        let needed = 3 * f + 1;
        if self.replicas.len() < needed {
            return Err(ConfigError::RosterTooSmall {
                replicas: self.replicas.len(),
                f,
                needed,
            });
        }

        let mut replicas = roster(&self.replicas)?;
        let mut clients = roster(&self.clients)?;
        let keypair = self.keypair()?;
        let pubkey = keypair.pubkey();

        let (group, role_name) = match self.node.role {
            Role::Replica => (&mut replicas, "replica"),
            Role::Client => (&mut clients, "client"),
        };
        let found = group.iter().position(|p| p.public_key == pubkey);
        let index = match (self.node.index, found) {
            (Some(index), _) if index >= group.len() => {
                return Err(ConfigError::IndexOutOfRange {
                    index,
                    count: group.len(),
                    role: role_name,
                })
            }
            (Some(index), Some(found)) if index == found => index,
            (Some(index), _) => return Err(ConfigError::KeyMismatch(index)),
            (None, Some(found)) => found,
            (None, None) => return Err(ConfigError::MissingField("node.index")),
        };

        let local = group.remove(index).with_private_key(keypair);
        group.insert(index, local);

        Ok(Peers::new(replicas, clients, self.node.role, index, f))
    }
}
