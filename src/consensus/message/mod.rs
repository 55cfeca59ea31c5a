use std::net::SocketAddr;

use bytes::{BufMut, Bytes, BytesMut};
use sha2::{Digest as ShaDigest, Sha256};

use crate::common::codec::{DecodeError, ListEncoder, Rlp};
use crate::common::crypto::{CryptoError, Digest, Signature, Tag};
use super::peers::Peers;
use super::principal::Principal;
use super::types::EXTRA_SIGNATURE;

mod checkpoint;
mod new_key;
mod phase;
mod pre_prepare;
mod reply;
mod request;
mod view_change;

pub use checkpoint::Checkpoint;
pub use new_key::NewKey;
pub use phase::{Commit, Prepare};
pub use pre_prepare::{PrePrepare, RequestEntry, DIGEST_FLAG, FULL_REQUEST_FLAG};
pub use reply::Reply;
pub use request::Request;
pub use view_change::{NewView, PreparedProof, Reconstruction, ViewChange};

/*
    Every datagram is `tag || [content, auth]`.

    `content` is the canonical encoding of the message fields and is what the
    content digest is computed over. `auth` is either the sender's signature
    over that digest, or one keyed-hash tag per replica; bit 1 of the
    message's `extra` field says which.
*/

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum MessageKind {
    Request = 0x60,
    PrePrepare = 0x61,
    Prepare = 0x62,
    Commit = 0x63,
    Checkpoint = 0x64,
    ViewChange = 0x65,
    NewView = 0x66,
    NewKey = 0x67,
    Reply = 0x68,
}

impl TryFrom<u8> for MessageKind {
    type Error = DecodeError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        Ok(match tag {
            0x60 => MessageKind::Request,
            0x61 => MessageKind::PrePrepare,
            0x62 => MessageKind::Prepare,
            0x63 => MessageKind::Commit,
            0x64 => MessageKind::Checkpoint,
            0x65 => MessageKind::ViewChange,
            0x66 => MessageKind::NewView,
            0x67 => MessageKind::NewKey,
            0x68 => MessageKind::Reply,
            other => return Err(DecodeError::UnknownTag(other)),
        })
    }
}

/// Authentication tag attached to a message.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Authenticator {
    Signature(Signature),
    /// One tag per replica, ordered by replica index.
    Vector(Vec<Tag>),
}

impl Default for Authenticator {
    /// An empty vector, which no replica group accepts.
    fn default() -> Self {
        Authenticator::Vector(Vec::new())
    }
}

impl Authenticator {
    pub fn encode(&self) -> Bytes {
        match self {
            Authenticator::Signature(signature) => Bytes::copy_from_slice(&signature.sig),
            Authenticator::Vector(tags) => tags
                .iter()
                .fold(ListEncoder::new(), |list, tag| list.bytes(tag))
                .finish(),
        }
    }

    pub fn decode(raw: &[u8], use_signature: bool) -> Result<Self, DecodeError> {
        if use_signature {
            let signature = Signature::from_slice(raw).ok_or(DecodeError::Length {
                expected: crate::common::crypto::SIGNATURE_LEN,
                found: raw.len(),
            })?;
            return Ok(Authenticator::Signature(signature));
        }
        let tags = Rlp::new(raw)?
            .items()?
            .iter()
            .map(|item| item.fixed::<32>())
            .collect::<Result<Vec<Tag>, _>>()?;
        Ok(Authenticator::Vector(tags))
    }
}

/// Domain-separated SHA-256 over fixed-width fields.
pub(crate) struct ContentHasher(Sha256);

impl ContentHasher {
    pub fn new(kind: MessageKind) -> Self {
        let mut hasher = Sha256::new();
        hasher.update([kind as u8]);
        ContentHasher(hasher)
    }

    pub fn uint(mut self, value: u64) -> Self {
        self.0.update(value.to_be_bytes());
        self
    }

    /// Length-prefixed, so adjacent fields cannot be shifted into each other.
    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.0.update((data.len() as u64).to_be_bytes());
        self.0.update(data);
        self
    }

    pub fn digest(mut self, digest: &Digest) -> Self {
        self.0.update(digest);
        self
    }

    pub fn finish(self) -> Digest {
        self.0.finalize().into()
    }
}

/// Shared encode / digest / authenticate / verify behaviour.
pub trait Authenticated: Sized {
    const KIND: MessageKind;

    fn extra(&self) -> u64;

    /// Canonical encoding of the message fields, without `auth`.
    fn content(&self) -> Bytes;

    /// Rebuilds the message from its content; `auth` is filled in afterwards.
    fn from_content(content: Rlp<'_>) -> Result<Self, DecodeError>;

    fn content_digest(&self) -> Digest;

    fn auth(&self) -> &Authenticator;

    fn set_auth(&mut self, auth: Authenticator);

    /// Records where the datagram came from, for the kinds that keep it.
    fn set_source(&mut self, _from: SocketAddr) {}

    fn use_signature(&self) -> bool {
        self.extra() & EXTRA_SIGNATURE != 0
    }

    fn authenticate(&mut self, peers: &Peers) -> Result<(), CryptoError> {
        let auth = peers.authenticate(&self.content_digest(), self.use_signature())?;
        self.set_auth(auth);
        Ok(())
    }

    fn verify(&self, peers: &Peers, sender: &Principal) -> bool {
        peers.verify(sender, &self.content_digest(), self.use_signature(), self.auth())
    }

    fn to_payload(&self) -> Bytes {
        let body = ListEncoder::new()
            .bytes(&self.content())
            .bytes(&self.auth().encode())
            .finish();
        let mut payload = BytesMut::with_capacity(body.len() + 1);
        payload.put_u8(Self::KIND as u8);
        payload.put_slice(&body);
        payload.freeze()
    }

    /// Parses a datagram of this kind. Nothing is kept on failure.
    fn from_payload(payload: &[u8], from: Option<SocketAddr>) -> Result<Self, DecodeError> {
        let (&tag, body) = payload.split_first().ok_or(DecodeError::EndOfBuffer)?;
        if tag != Self::KIND as u8 {
            return Err(DecodeError::UnknownTag(tag));
        }
        let fields = Rlp::new(body)?.fields(2)?;
        let mut message = Self::from_content(Rlp::new(fields[0].data()?)?)?;
        let auth = Authenticator::decode(fields[1].data()?, message.use_signature())?;
        message.set_auth(auth);
        if let Some(from) = from {
            message.set_source(from);
        }
        Ok(message)
    }
}

/// Builds, authenticates and returns a message in one step.
pub(crate) fn authenticated<M: Authenticated>(mut message: M, peers: &Peers) -> Result<M, CryptoError> {
    message.authenticate(peers)?;
    Ok(message)
}

/// Decodes a nested list of datagrams of one kind.
pub(crate) fn decode_nested<M: Authenticated>(item: &Rlp<'_>) -> Result<Vec<M>, DecodeError> {
    item.items()?
        .iter()
        .map(|entry| M::from_payload(entry.data()?, None))
        .collect()
}

#[derive(Clone, Debug)]
pub enum Message {
    Request(Request),
    PrePrepare(PrePrepare),
    Prepare(Prepare),
    Commit(Commit),
    Checkpoint(Checkpoint),
    ViewChange(ViewChange),
    NewView(NewView),
    NewKey(NewKey),
    Reply(Reply),
}

impl Message {
    pub fn from_payload(payload: &[u8], from: SocketAddr) -> Result<Self, DecodeError> {
        let tag = *payload.first().ok_or(DecodeError::EndOfBuffer)?;
        let from = Some(from);
        Ok(match MessageKind::try_from(tag)? {
            MessageKind::Request => Message::Request(Request::from_payload(payload, from)?),
            MessageKind::PrePrepare => Message::PrePrepare(PrePrepare::from_payload(payload, from)?),
            MessageKind::Prepare => Message::Prepare(Prepare::from_payload(payload, from)?),
            MessageKind::Commit => Message::Commit(Commit::from_payload(payload, from)?),
            MessageKind::Checkpoint => Message::Checkpoint(Checkpoint::from_payload(payload, from)?),
            MessageKind::ViewChange => Message::ViewChange(ViewChange::from_payload(payload, from)?),
            MessageKind::NewView => Message::NewView(NewView::from_payload(payload, from)?),
            MessageKind::NewKey => Message::NewKey(NewKey::from_payload(payload, from)?),
            MessageKind::Reply => Message::Reply(Reply::from_payload(payload, from)?),
        })
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Request(_) => MessageKind::Request,
            Message::PrePrepare(_) => MessageKind::PrePrepare,
            Message::Prepare(_) => MessageKind::Prepare,
            Message::Commit(_) => MessageKind::Commit,
            Message::Checkpoint(_) => MessageKind::Checkpoint,
            Message::ViewChange(_) => MessageKind::ViewChange,
            Message::NewView(_) => MessageKind::NewView,
            Message::NewKey(_) => MessageKind::NewKey,
            Message::Reply(_) => MessageKind::Reply,
        }
    }

    pub fn to_payload(&self) -> Bytes {
        match self {
            Message::Request(m) => m.to_payload(),
            Message::PrePrepare(m) => m.to_payload(),
            Message::Prepare(m) => m.to_payload(),
            Message::Commit(m) => m.to_payload(),
            Message::Checkpoint(m) => m.to_payload(),
            Message::ViewChange(m) => m.to_payload(),
            Message::NewView(m) => m.to_payload(),
            Message::NewKey(m) => m.to_payload(),
            Message::Reply(m) => m.to_payload(),
        }
    }
}
