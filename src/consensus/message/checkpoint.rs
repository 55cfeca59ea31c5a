use bytes::Bytes;

use crate::common::codec::{DecodeError, ListEncoder, Rlp};
use crate::common::crypto::Digest;
use super::{Authenticated, Authenticator, ContentHasher, MessageKind};
use crate::consensus::types::{extra_for, Seqno};

/// A replica's claim about the service state after executing `seqno`.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Checkpoint {
    pub extra: u64,
    pub seqno: Seqno,
    pub state_digest: Digest,
    pub replica: usize,
    pub auth: Authenticator,
}

impl Checkpoint {
    pub fn new(seqno: Seqno, state_digest: Digest, replica: usize, use_signature: bool) -> Self {
        Checkpoint {
            extra: extra_for(use_signature),
            seqno,
            state_digest,
            replica,
            auth: Authenticator::default(),
        }
    }
}

impl Authenticated for Checkpoint {
    const KIND: MessageKind = MessageKind::Checkpoint;

    fn extra(&self) -> u64 {
        self.extra
    }

    fn content(&self) -> Bytes {
        ListEncoder::new()
            .uint(self.extra)
            .uint(self.seqno)
            .bytes(&self.state_digest)
            .uint(self.replica as u64)
            .finish()
    }

    fn from_content(content: Rlp<'_>) -> Result<Self, DecodeError> {
        let fields = content.fields(4)?;
        Ok(Checkpoint {
            extra: fields[0].as_u64()?,
            seqno: fields[1].as_u64()?,
            state_digest: fields[2].fixed::<32>()?,
            replica: fields[3].as_usize()?,
            auth: Authenticator::default(),
        })
    }

    fn content_digest(&self) -> Digest {
        ContentHasher::new(MessageKind::Checkpoint)
            .uint(self.extra)
            .uint(self.seqno)
            .digest(&self.state_digest)
            .uint(self.replica as u64)
            .finish()
    }

    fn auth(&self) -> &Authenticator {
        &self.auth
    }

    fn set_auth(&mut self, auth: Authenticator) {
        self.auth = auth;
    }
}
