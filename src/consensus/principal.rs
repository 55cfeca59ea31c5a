use std::net::SocketAddr;

use crate::common::crypto::{
    keyed_hash, random_session_key, verify_keyed_hash, CryptoError, Digest, Keypair, Pubkey,
    SessionKey, Signature, Tag, SESSION_KEY_LEN,
};

/// Session keys start here and must be rotated before they prove anything.
pub const ZERO_SESSION_KEY: SessionKey = [0u8; SESSION_KEY_LEN];

/// Which of the two session keys of a relationship to use.
///
/// `Out` authenticates what the local node sends to this principal, `In`
/// checks what this principal sends to the local node. Keeping them apart
/// stops a peer from reflecting our own tags back at us.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Direction {
    In,
    Out,
}

/// One node's identity as seen by the local node.
#[derive(Debug)]
pub struct Principal {
    pub index: usize,
    pub addr: SocketAddr,
    pub public_key: Pubkey,
    private_key: Option<Keypair>,
    pub outkey: SessionKey,
    pub outkeyts: u64,
    pub inkey: SessionKey,
}

impl Principal {
    pub fn new(index: usize, public_key: Pubkey, addr: SocketAddr) -> Self {
        Principal {
            index,
            addr,
            public_key,
            private_key: None,
            outkey: ZERO_SESSION_KEY,
            outkeyts: 0,
            inkey: ZERO_SESSION_KEY,
        }
    }

    /// Attaches the local node's keypair. Only the local principal has one.
    pub fn with_private_key(mut self, keypair: Keypair) -> Self {
        self.private_key = Some(keypair);
        self
    }

    pub fn is_local(&self) -> bool {
        self.private_key.is_some()
    }

    pub fn sign(&self, digest: &Digest) -> Result<Signature, CryptoError> {
        let keypair = self.private_key.as_ref().ok_or(CryptoError::MissingPrivateKey)?;
        Ok(keypair.sign(digest))
    }

    pub fn verify(&self, digest: &Digest, signature: &Signature) -> bool {
        self.public_key.verify(digest, signature)
    }

    /// Seals `message` for this principal.
    pub fn encrypt(&self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.public_key.encrypt(message)
    }

    /// Opens a box sealed for this principal. Needs the private key.
    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let keypair = self.private_key.as_ref().ok_or(CryptoError::MissingPrivateKey)?;
        keypair.decrypt(sealed)
    }

    /// Replaces `inkey` with a fresh random key and returns it.
    pub fn gen_inkey(&mut self) -> SessionKey {
        self.inkey = random_session_key();
        self.inkey
    }

    pub fn set_outkey(&mut self, key: SessionKey, timestamp: u64) {
        self.outkey = key;
        self.outkeyts = timestamp;
    }

    pub fn has_outkey(&self) -> bool {
        self.outkey != ZERO_SESSION_KEY
    }

    fn key(&self, direction: Direction) -> &SessionKey {
        match direction {
            Direction::In => &self.inkey,
            Direction::Out => &self.outkey,
        }
    }

    pub fn gen_hmac(&self, direction: Direction, digest: &Digest) -> Tag {
        keyed_hash(self.key(direction), digest)
    }

    /// Never accepts a tag made with a key that was never rotated.
    pub fn verify_hmac(&self, direction: Direction, digest: &Digest, tag: &Tag) -> bool {
        let key = self.key(direction);
        if *key == ZERO_SESSION_KEY {
            return false;
        }
        verify_keyed_hash(key, digest, tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(keypair: &Keypair) -> Principal {
        Principal::new(0, keypair.pubkey(), "127.0.0.1:25600".parse().unwrap())
    }

    #[test]
    fn test_remote_principal_cannot_sign() {
        let keypair = Keypair::new_pair();
        let remote = principal(&keypair);

        assert!(matches!(remote.sign(&[0; 32]), Err(CryptoError::MissingPrivateKey)));
        assert!(matches!(remote.decrypt(&[0; 64]), Err(CryptoError::MissingPrivateKey)));
    }

    #[test]
    fn test_local_principal_signs_and_opens() {
        let keypair = Keypair::new_pair();
        let remote = principal(&keypair);
        let local = principal(&keypair).with_private_key(keypair);

        let signature = local.sign(&[7; 32]).unwrap();
        assert!(remote.verify(&[7; 32], &signature));

        let sealed = remote.encrypt(b"fresh key").unwrap();
        assert_eq!(local.decrypt(&sealed).unwrap(), b"fresh key");
    }

    #[test]
    fn test_zero_key_is_never_evidence() {
        let keypair = Keypair::new_pair();
        let peer = principal(&keypair);
        let digest = [3u8; 32];
        let tag = peer.gen_hmac(Direction::In, &digest);

        assert!(!peer.verify_hmac(Direction::In, &digest, &tag));
    }

    #[test]
    fn test_directions_use_distinct_keys() {
        let keypair = Keypair::new_pair();
        let mut peer = principal(&keypair);
        let digest = [3u8; 32];
        peer.gen_inkey();
        peer.set_outkey([9; 32], 1);

        let inbound = peer.gen_hmac(Direction::In, &digest);
        assert!(peer.verify_hmac(Direction::In, &digest, &inbound));
        assert!(!peer.verify_hmac(Direction::Out, &digest, &inbound));
    }

    #[test]
    fn test_gen_inkey_rotates() {
        let keypair = Keypair::new_pair();
        let mut peer = principal(&keypair);
        let first = peer.gen_inkey();

        assert_ne!(first, ZERO_SESSION_KEY);
        assert_ne!(peer.gen_inkey(), first);
    }
}
