use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, VerifyingKey};
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest as ShaDigest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey as ExchangeKey, StaticSecret};

pub type Digest = [u8; 32];

/// Keyed-hash tag carried in authenticator vectors.
pub type Tag = [u8; 32];

pub type SessionKey = [u8; SESSION_KEY_LEN];

pub const SESSION_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;

const NONCE_LEN: usize = 12;
const SEAL_OVERHEAD: usize = 32 + NONCE_LEN;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("private key not available")]
    MissingPrivateKey,
    #[error("sealing failed")]
    Sealing,
    #[error("sealed box too short: {0} bytes")]
    Truncated(usize),
    #[error("decryption failed")]
    Decryption,
}

pub struct Keypair {
    pubkey: Pubkey,
    dalek_signer: SigningKey,
    exchange: StaticSecret,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Pubkey {
    /// Ed25519 verifying key.
    pub key: [u8; 32],
    /// X25519 key sealed boxes are addressed to.
    pub exchange: [u8; 32],
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Signature {
    pub sig: [u8; SIGNATURE_LEN],
}

impl Keypair {
    pub fn new_pair() -> Self {
        let mut csprng = OsRng;
        let dalek_signer = SigningKey::generate(&mut csprng);
        Self::from_signing_key(dalek_signer)
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(seed))
    }

    fn from_signing_key(dalek_signer: SigningKey) -> Self {
        let exchange = exchange_secret(&dalek_signer.to_bytes());
        let pubkey = Pubkey {
            key: dalek_signer.verifying_key().to_bytes(),
            exchange: ExchangeKey::from(&exchange).to_bytes(),
        };

        Keypair {
            pubkey,
            dalek_signer,
            exchange,
        }
    }

    pub fn sign(&self, digest: &Digest) -> Signature {
        let sig = self.dalek_signer.sign(digest).to_bytes();
        Signature { sig }
    }

    pub fn pubkey(&self) -> Pubkey {
        self.pubkey
    }

    pub fn seed(&self) -> [u8; 32] {
        self.dalek_signer.to_bytes()
    }

    /// Opens a box produced by [`Pubkey::encrypt`] for this keypair.
    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(CryptoError::Truncated(sealed.len()));
        }
        let (ephemeral, rest) = sealed.split_at(32);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

        let mut ephemeral_bytes = [0u8; 32];
        ephemeral_bytes.copy_from_slice(ephemeral);
        let shared = self
            .exchange
            .diffie_hellman(&ExchangeKey::from(ephemeral_bytes));

        let key = seal_key(shared.as_bytes(), &ephemeral_bytes, &self.pubkey.exchange);
        let cipher = ChaCha20Poly1305::new_from_slice(&key).map_err(|_| CryptoError::Decryption)?;
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decryption)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair").field("pubkey", &self.pubkey).finish_non_exhaustive()
    }
}

impl Pubkey {
    pub fn verify(&self, digest: &Digest, signature: &Signature) -> bool {
        let Ok(dalek_pubkey) = VerifyingKey::from_bytes(&self.key) else {
            return false;
        };
        let dalek_sig = DalekSignature::from_bytes(&signature.sig);
        dalek_pubkey.verify_strict(digest, &dalek_sig).is_ok()
    }

    /// Seals `plaintext` so that only the holder of this key can read it.
    ///
    /// Layout: `ephemeral public (32) || nonce (12) || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = ExchangeKey::from(&ephemeral).to_bytes();
        let shared = ephemeral.diffie_hellman(&ExchangeKey::from(self.exchange));

        let key = seal_key(shared.as_bytes(), &ephemeral_public, &self.exchange);
        let cipher = ChaCha20Poly1305::new_from_slice(&key).map_err(|_| CryptoError::Sealing)?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Sealing)?;

        let mut sealed = Vec::with_capacity(SEAL_OVERHEAD + ciphertext.len());
        sealed.extend_from_slice(&ephemeral_public);
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }
}

impl AsRef<[u8]> for Pubkey {
    fn as_ref(&self) -> &[u8] {
        &self.key
    }
}

impl Signature {
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let sig: [u8; SIGNATURE_LEN] = bytes.try_into().ok()?;
        Some(Signature { sig })
    }
}

fn exchange_secret(seed: &[u8; 32]) -> StaticSecret {
    let mut hasher = Sha256::new();
    hasher.update(b"pbft-exchange-key");
    hasher.update(seed);
    let bytes: [u8; 32] = hasher.finalize().into();
    StaticSecret::from(bytes)
}

fn seal_key(shared: &[u8; 32], ephemeral: &[u8; 32], recipient: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"pbft-session-key-seal");
    hasher.update(shared);
    hasher.update(ephemeral);
    hasher.update(recipient);
    hasher.finalize().into()
}

/// HMAC-SHA256 of `digest` under a session key.
pub fn keyed_hash(key: &SessionKey, digest: &Digest) -> Tag {
    keyed_mac(key, digest).finalize().into_bytes().into()
}

/// Checks `tag` against the HMAC of `digest` in constant time.
pub fn verify_keyed_hash(key: &SessionKey, digest: &Digest, tag: &Tag) -> bool {
    keyed_mac(key, digest).verify_slice(tag).is_ok()
}

fn keyed_mac(key: &SessionKey, digest: &Digest) -> HmacSha256 {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(digest);
    mac
}

pub fn random_session_key() -> SessionKey {
    let mut key = [0u8; SESSION_KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}
