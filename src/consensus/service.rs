use std::collections::BTreeMap;

use bytes::Bytes;
use sha2::{Digest as ShaDigest, Sha256};

use crate::common::crypto::Digest;

/// The replicated state machine the replicas agree to drive.
///
/// `execute` must be deterministic: every correct replica runs the same
/// operations in the same order and must end in the same state.
pub trait Service {
    fn execute(&mut self, client: usize, operation: &[u8]) -> Bytes;

    /// Digest of the whole state, compared across replicas at checkpoints.
    fn state_digest(&self) -> Digest;
}

/// In-memory key-value store.
///
/// Operations are `SET <key> <value>` and `GET <key>`. `SET` replies `OK`,
/// `GET` replies with the value or an empty result, anything else with `ERR`.
#[derive(Debug, Default)]
pub struct KvService {
    entries: BTreeMap<String, String>,
}

impl KvService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }
}

impl Service for KvService {
    fn execute(&mut self, _client: usize, operation: &[u8]) -> Bytes {
        let Ok(text) = std::str::from_utf8(operation) else {
            return Bytes::from_static(b"ERR");
        };
        let mut parts = text.splitn(3, ' ');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("SET"), Some(key), Some(value)) => {
                self.entries.insert(key.to_string(), value.to_string());
                Bytes::from_static(b"OK")
            }
            (Some("GET"), Some(key), None) => self
                .entries
                .get(key)
                .map(|v| Bytes::copy_from_slice(v.as_bytes()))
                .unwrap_or_default(),
            _ => Bytes::from_static(b"ERR"),
        }
    }

    fn state_digest(&self) -> Digest {
        let mut hasher = Sha256::new();
        for (key, value) in &self.entries {
            hasher.update((key.len() as u64).to_be_bytes());
            hasher.update(key.as_bytes());
            hasher.update((value.len() as u64).to_be_bytes());
            hasher.update(value.as_bytes());
        }
        hasher.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(b"SET a 1", b"OK" ; "set")]
    #[test_case(b"GET missing", b"" ; "get missing")]
    #[test_case(b"DEL a", b"ERR" ; "unknown verb")]
    #[test_case(b"GET", b"ERR" ; "missing key")]
    #[test_case(&[0xff, 0xfe], b"ERR" ; "not utf8")]
    fn test_kv_operations(op: &[u8], expected: &[u8]) {
        let mut service = KvService::new();
        assert_eq!(service.execute(0, op).as_ref(), expected);
    }

    #[test]
    fn test_state_digest_tracks_contents() {
        let mut a = KvService::new();
        let mut b = KvService::new();
        assert_eq!(a.state_digest(), b.state_digest());

        a.execute(0, b"SET k hello world");
        assert_eq!(a.get("k"), Some("hello world"));
        assert_ne!(a.state_digest(), b.state_digest());

        b.execute(1, b"SET k hello world");
        assert_eq!(a.state_digest(), b.state_digest());
    }
}
