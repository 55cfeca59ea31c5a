use bytes::Bytes;

use crate::common::codec::{DecodeError, ListEncoder, Rlp};
use crate::common::crypto::{CryptoError, Digest, SessionKey};
use super::{Authenticated, Authenticator, ContentHasher, MessageKind};
use crate::consensus::peers::Peers;
use crate::consensus::types::extra_for;

/// Fresh inbound session keys from one replica, one sealed box per replica.
///
/// Entry `j` holds the key replica `j` must use from now on when it
/// authenticates messages to the sender. The sender's own entry is empty.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct NewKey {
    pub extra: u64,
    pub replica: usize,
    pub timestamp: u64,
    pub keys: Vec<Bytes>,
    pub auth: Authenticator,
}

impl NewKey {
    /// Rotates every inbound key of the local replica and seals each one for
    /// its peer.
    pub fn create(peers: &mut Peers, timestamp: u64) -> Result<Self, CryptoError> {
        let local = peers.index;
        let mut keys = Vec::with_capacity(peers.n());
        for principal in peers.replicas.iter_mut() {
            if principal.index == local {
                keys.push(Bytes::new());
                continue;
            }
            let key = principal.gen_inkey();
            keys.push(Bytes::from(principal.encrypt(&key)?));
        }

        let mut new_key = NewKey {
            extra: extra_for(true),
            replica: local,
            timestamp,
            keys,
            auth: Authenticator::default(),
        };
        new_key.authenticate(peers)?;
        Ok(new_key)
    }

    /// Opens the entry addressed to the local replica.
    pub fn open(&self, peers: &Peers) -> Result<SessionKey, CryptoError> {
        let sealed = self.keys.get(peers.index).ok_or(CryptoError::Truncated(0))?;
        let plain = peers.local().decrypt(sealed)?;
        plain
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::Truncated(plain.len()))
    }
}

impl Authenticated for NewKey {
    const KIND: MessageKind = MessageKind::NewKey;

    fn extra(&self) -> u64 {
        self.extra
    }

    fn content(&self) -> Bytes {
        ListEncoder::new()
            .uint(self.extra)
            .uint(self.replica as u64)
            .uint(self.timestamp)
            .list(&self.keys)
            .finish()
    }

    fn from_content(content: Rlp<'_>) -> Result<Self, DecodeError> {
        let fields = content.fields(4)?;
        let keys = fields[3]
            .items()?
            .iter()
            .map(|item| item.data().map(Bytes::copy_from_slice))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(NewKey {
            extra: fields[0].as_u64()?,
            replica: fields[1].as_usize()?,
            timestamp: fields[2].as_u64()?,
            keys,
            auth: Authenticator::default(),
        })
    }

    fn content_digest(&self) -> Digest {
        let hasher = ContentHasher::new(MessageKind::NewKey)
            .uint(self.extra)
            .uint(self.replica as u64)
            .uint(self.timestamp)
            .uint(self.keys.len() as u64);
        self.keys
            .iter()
            .fold(hasher, |hasher, key| hasher.bytes(key))
            .finish()
    }

    fn auth(&self) -> &Authenticator {
        &self.auth
    }

    fn set_auth(&mut self, auth: Authenticator) {
        self.auth = auth;
    }
}
