use bytes::Bytes;

use crate::common::codec::{DecodeError, ListEncoder, Rlp};
use crate::common::crypto::{CryptoError, Digest};
use super::{Authenticated, Authenticator, ContentHasher, MessageKind};
use crate::consensus::peers::Peers;
use crate::consensus::types::extra_for;

/// A client operation.
///
/// The digest covers `(client, timestamp, operation)` only, so the same
/// request carried inline or by digest in a pre-prepare hashes the same.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Request {
    pub extra: u64,
    pub client: usize,
    pub timestamp: u64,
    pub operation: Bytes,
    pub auth: Authenticator,
}

impl Request {
    pub fn new(client: usize, timestamp: u64, operation: Bytes, use_signature: bool) -> Self {
        Request {
            extra: extra_for(use_signature),
            client,
            timestamp,
            operation,
            auth: Authenticator::default(),
        }
    }

    /// Builds and signs a request from the local client.
    pub fn create(peers: &Peers, timestamp: u64, operation: Bytes, use_signature: bool) -> Result<Self, CryptoError> {
        let mut request = Request::new(peers.index, timestamp, operation, use_signature);
        request.authenticate(peers)?;
        Ok(request)
    }

    pub fn digest(&self) -> Digest {
        ContentHasher::new(MessageKind::Request)
            .uint(self.client as u64)
            .uint(self.timestamp)
            .bytes(&self.operation)
            .finish()
    }

    /// Checks the signature against the issuing client's key.
    pub fn verify_client(&self, peers: &Peers) -> bool {
        match peers.client(self.client) {
            Some(client) => self.verify(peers, client),
            None => false,
        }
    }
}

impl Authenticated for Request {
    const KIND: MessageKind = MessageKind::Request;

    fn extra(&self) -> u64 {
        self.extra
    }

    fn content(&self) -> Bytes {
        ListEncoder::new()
            .uint(self.extra)
            .uint(self.client as u64)
            .uint(self.timestamp)
            .bytes(&self.operation)
            .finish()
    }

    fn from_content(content: Rlp<'_>) -> Result<Self, DecodeError> {
        let fields = content.fields(4)?;
        Ok(Request {
            extra: fields[0].as_u64()?,
            client: fields[1].as_usize()?,
            timestamp: fields[2].as_u64()?,
            operation: Bytes::copy_from_slice(fields[3].data()?),
            auth: Authenticator::default(),
        })
    }

    fn content_digest(&self) -> Digest {
        self.digest()
    }

    fn auth(&self) -> &Authenticator {
        &self.auth
    }

    fn set_auth(&mut self, auth: Authenticator) {
        self.auth = auth;
    }
}
