use bytes::Bytes;

use crate::common::codec::{DecodeError, ListEncoder, Rlp};
use crate::common::crypto::Digest;
use super::{Authenticated, Authenticator, ContentHasher, MessageKind};
use crate::consensus::types::{extra_for, Seqno, View};

/*
    Prepare and Commit share one layout: `[extra, view, seqno, digest, replica]`,
    where `digest` is the content digest of the pre-prepare being agreed on.
    They differ only in their kind tag, which also separates their digests.
*/

macro_rules! phase_message {
    ($name:ident, $kind:expr) => {
        #[derive(Clone, PartialEq, Eq, Debug)]
        pub struct $name {
            pub extra: u64,
            pub view: View,
            pub seqno: Seqno,
            pub digest: Digest,
            pub replica: usize,
            pub auth: Authenticator,
        }

        impl $name {
            pub fn new(view: View, seqno: Seqno, digest: Digest, replica: usize, use_signature: bool) -> Self {
                $name {
                    extra: extra_for(use_signature),
                    view,
                    seqno,
                    digest,
                    replica,
                    auth: Authenticator::default(),
                }
            }
        }

        impl Authenticated for $name {
            const KIND: MessageKind = $kind;

            fn extra(&self) -> u64 {
                self.extra
            }

            fn content(&self) -> Bytes {
                ListEncoder::new()
                    .uint(self.extra)
                    .uint(self.view)
                    .uint(self.seqno)
                    .bytes(&self.digest)
                    .uint(self.replica as u64)
                    .finish()
            }

            fn from_content(content: Rlp<'_>) -> Result<Self, DecodeError> {
                let fields = content.fields(5)?;
                Ok($name {
                    extra: fields[0].as_u64()?,
                    view: fields[1].as_u64()?,
                    seqno: fields[2].as_u64()?,
                    digest: fields[3].fixed::<32>()?,
                    replica: fields[4].as_usize()?,
                    auth: Authenticator::default(),
                })
            }

            fn content_digest(&self) -> Digest {
                ContentHasher::new($kind)
                    .uint(self.extra)
                    .uint(self.view)
                    .uint(self.seqno)
                    .digest(&self.digest)
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
    };
}

phase_message!(Prepare, MessageKind::Prepare);
phase_message!(Commit, MessageKind::Commit);
