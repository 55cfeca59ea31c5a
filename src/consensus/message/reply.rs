use bytes::Bytes;

use crate::common::codec::{DecodeError, ListEncoder, Rlp};
use crate::common::crypto::Digest;
use super::{Authenticated, Authenticator, ContentHasher, MessageKind};
use crate::consensus::types::{extra_for, View};

/// The result of executing one client request at one replica.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Reply {
    pub extra: u64,
    pub view: View,
    pub timestamp: u64,
    pub client: usize,
    pub replica: usize,
    pub result: Bytes,
    pub auth: Authenticator,
}

impl Reply {
    pub fn new(view: View, timestamp: u64, client: usize, replica: usize, result: Bytes) -> Self {
        Reply {
            extra: extra_for(true),
            view,
            timestamp,
            client,
            replica,
            result,
            auth: Authenticator::default(),
        }
    }
}

impl Authenticated for Reply {
    const KIND: MessageKind = MessageKind::Reply;

    fn extra(&self) -> u64 {
        self.extra
    }

    fn content(&self) -> Bytes {
        ListEncoder::new()
            .uint(self.extra)
            .uint(self.view)
            .uint(self.timestamp)
            .uint(self.client as u64)
            .uint(self.replica as u64)
            .bytes(&self.result)
            .finish()
    }

    fn from_content(content: Rlp<'_>) -> Result<Self, DecodeError> {
        let fields = content.fields(6)?;
        Ok(Reply {
            extra: fields[0].as_u64()?,
            view: fields[1].as_u64()?,
            timestamp: fields[2].as_u64()?,
            client: fields[3].as_usize()?,
            replica: fields[4].as_usize()?,
            result: Bytes::copy_from_slice(fields[5].data()?),
            auth: Authenticator::default(),
        })
    }

    fn content_digest(&self) -> Digest {
        ContentHasher::new(MessageKind::Reply)
            .uint(self.extra)
            .uint(self.view)
            .uint(self.timestamp)
            .uint(self.client as u64)
            .uint(self.replica as u64)
            .bytes(&self.result)
            .finish()
    }

    fn auth(&self) -> &Authenticator {
        &self.auth
    }

    fn set_auth(&mut self, auth: Authenticator) {
        self.auth = auth;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::peers::tests::cluster;

    #[test]
    fn test_client_verifies_replica_reply() {
        let (replicas, clients) = cluster(4, 1);
        let mut reply = Reply::new(0, 3, 0, 2, Bytes::from_static(b"OK"));
        reply.authenticate(&replicas[2]).unwrap();

        let parsed = Reply::from_payload(&reply.to_payload(), None).unwrap();
        assert_eq!(parsed.result, Bytes::from_static(b"OK"));
        assert!(parsed.verify(&clients[0], &clients[0].replicas[2]));
        assert!(!parsed.verify(&clients[0], &clients[0].replicas[1]));
    }
}
