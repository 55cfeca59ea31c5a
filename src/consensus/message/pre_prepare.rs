use std::net::SocketAddr;

use bytes::{BufMut, Bytes, BytesMut};

use crate::common::codec::{DecodeError, ListEncoder, Rlp};
use crate::common::crypto::{CryptoError, Digest};
use super::{Authenticated, Authenticator, ContentHasher, MessageKind, Request};
use crate::config::ProtocolConfig;
use crate::consensus::peers::Peers;
use crate::consensus::store::RequestStore;
use crate::consensus::types::{extra_for, Seqno, View};

/// Leading byte of an entry that carries a whole request datagram.
pub const FULL_REQUEST_FLAG: u8 = MessageKind::Request as u8;
/// Leading byte of an entry that carries only a request digest.
pub const DIGEST_FLAG: u8 = 0x12;

/// One slot of a pre-prepare batch, decided once at decode time.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum RequestEntry {
    Full(Request),
    /// The receiver is expected to already hold the request.
    Digest(Digest),
}

impl RequestEntry {
    pub fn digest(&self) -> Digest {
        match self {
            RequestEntry::Full(request) => request.digest(),
            RequestEntry::Digest(digest) => *digest,
        }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            RequestEntry::Full(request) => request.to_payload(),
            RequestEntry::Digest(digest) => {
                let mut buf = BytesMut::with_capacity(1 + digest.len());
                buf.put_u8(DIGEST_FLAG);
                buf.put_slice(digest);
                buf.freeze()
            }
        }
    }

    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        match raw.first() {
            None => Err(DecodeError::EndOfBuffer),
            Some(&FULL_REQUEST_FLAG) => Ok(RequestEntry::Full(Request::from_payload(raw, None)?)),
            Some(&DIGEST_FLAG) => {
                let digest: Digest = raw[1..].try_into().map_err(|_| DecodeError::Length {
                    expected: 32,
                    found: raw.len() - 1,
                })?;
                Ok(RequestEntry::Digest(digest))
            }
            Some(&other) => Err(DecodeError::UnknownTag(other)),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PrePrepare {
    pub view: View,
    pub seqno: Seqno,
    pub extra: u64,
    pub requests: Vec<RequestEntry>,
    pub non_det_choices: Bytes,
    pub auth: Authenticator,
    /// Where the datagram arrived from, when it came off the network.
    pub from_addr: Option<SocketAddr>,
}

impl PrePrepare {
    pub fn new(
        view: View,
        seqno: Seqno,
        requests: Vec<RequestEntry>,
        non_det_choices: Bytes,
        use_signature: bool,
    ) -> Self {
        PrePrepare {
            view,
            seqno,
            extra: extra_for(use_signature),
            requests,
            non_det_choices,
            auth: Authenticator::default(),
            from_addr: None,
        }
    }

    /// Fills a sequence number nothing was prepared at.
    pub fn null(view: View, seqno: Seqno, use_signature: bool) -> Self {
        PrePrepare::new(view, seqno, Vec::new(), Bytes::new(), use_signature)
    }

    /// Primary side: claims up to a batch of pending requests and
    /// authenticates the result.
    ///
    /// Operations above the inline limit travel as digests; clients send
    /// those to every replica themselves.
    pub fn from_node(
        peers: &Peers,
        store: &mut RequestStore,
        view: View,
        seqno: Seqno,
        protocol: &ProtocolConfig,
        use_signature: bool,
    ) -> Result<Self, CryptoError> {
        let requests = store
            .claim_batch(protocol.request_in_pre_prepare)
            .into_iter()
            .map(|request| {
                if request.operation.len() > protocol.inline_request_limit {
                    RequestEntry::Digest(request.digest())
                } else {
                    RequestEntry::Full(request)
                }
            })
            .collect();

        let mut pre_prepare = PrePrepare::new(view, seqno, requests, Bytes::new(), use_signature);
        pre_prepare.authenticate(peers)?;
        Ok(pre_prepare)
    }

    pub fn is_null(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn request_digests(&self) -> Vec<Digest> {
        self.requests.iter().map(RequestEntry::digest).collect()
    }

    /// Covers only what is agreed on, not where or when it was proposed.
    pub fn consensus_digest(&self) -> Digest {
        let hasher = ContentHasher::new(MessageKind::PrePrepare)
            .bytes(b"consensus")
            .uint(self.requests.len() as u64);
        self.requests
            .iter()
            .fold(hasher, |hasher, entry| hasher.digest(&entry.digest()))
            .bytes(&self.non_det_choices)
            .finish()
    }
}

impl Authenticated for PrePrepare {
    const KIND: MessageKind = MessageKind::PrePrepare;

    fn extra(&self) -> u64 {
        self.extra
    }

    fn content(&self) -> Bytes {
        ListEncoder::new()
            .uint(self.view)
            .uint(self.seqno)
            .uint(self.extra)
            .list(self.requests.iter().map(RequestEntry::encode))
            .bytes(&self.non_det_choices)
            .finish()
    }

    fn from_content(content: Rlp<'_>) -> Result<Self, DecodeError> {
        let fields = content.fields(5)?;
        let requests = fields[3]
            .items()?
            .iter()
            .map(|item| RequestEntry::decode(item.data()?))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(PrePrepare {
            view: fields[0].as_u64()?,
            seqno: fields[1].as_u64()?,
            extra: fields[2].as_u64()?,
            requests,
            non_det_choices: Bytes::copy_from_slice(fields[4].data()?),
            auth: Authenticator::default(),
            from_addr: None,
        })
    }

    fn content_digest(&self) -> Digest {
        let hasher = ContentHasher::new(MessageKind::PrePrepare)
            .uint(self.view)
            .uint(self.seqno)
            .uint(self.extra)
            .uint(self.requests.len() as u64);
        self.requests
            .iter()
            .fold(hasher, |hasher, entry| hasher.digest(&entry.digest()))
            .bytes(&self.non_det_choices)
            .finish()
    }

    fn auth(&self) -> &Authenticator {
        &self.auth
    }

    fn set_auth(&mut self, auth: Authenticator) {
        self.auth = auth;
    }

    fn set_source(&mut self, from: SocketAddr) {
        self.from_addr = Some(from);
    }
}
