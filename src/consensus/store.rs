use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use crate::common::crypto::Digest;
use super::message::Request;
use super::types::Seqno;

/// What happened to a request offered to the store.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Admission {
    New,
    /// Same digest already held.
    Known,
    /// At or below the client's last executed timestamp.
    Stale,
    /// A different request with the same (client, timestamp) is pending.
    Conflict,
}

/// Client requests known to a replica, from arrival until the checkpoint
/// covering their execution is stable.
#[derive(Debug, Default)]
pub struct RequestStore {
    requests: HashMap<Digest, Request>,
    /// Pending digests in arrival order. May hold claimed or executed
    /// digests, which are skipped lazily.
    queue: VecDeque<Digest>,
    claimed: HashSet<Digest>,
    pending: HashMap<(usize, u64), Digest>,
    last_executed: HashMap<usize, u64>,
    retired: BTreeMap<Seqno, Vec<Digest>>,
}

impl RequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, request: Request) -> Admission {
        if self.is_stale(request.client, request.timestamp) {
            return Admission::Stale;
        }
        let digest = request.digest();
        if self.requests.contains_key(&digest) {
            return Admission::Known;
        }
        let key = (request.client, request.timestamp);
        if self.pending.contains_key(&key) {
            return Admission::Conflict;
        }

        self.pending.insert(key, digest);
        self.requests.insert(digest, request);
        self.queue.push_back(digest);
        Admission::New
    }

    pub fn get(&self, digest: &Digest) -> Option<&Request> {
        self.requests.get(digest)
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.requests.contains_key(digest)
    }

    pub fn is_stale(&self, client: usize, timestamp: u64) -> bool {
        self.last_executed
            .get(&client)
            .is_some_and(|last| timestamp <= *last)
    }

    pub fn last_executed(&self, client: usize) -> Option<u64> {
        self.last_executed.get(&client).copied()
    }

    fn is_pending(&self, digest: &Digest) -> bool {
        self.requests
            .get(digest)
            .is_some_and(|r| self.pending.get(&(r.client, r.timestamp)) == Some(digest))
    }

    /// Takes up to `cap` pending requests no batch has claimed yet.
    pub fn claim_batch(&mut self, cap: usize) -> Vec<Request> {
        let mut batch = Vec::new();
        while batch.len() < cap {
            let Some(digest) = self.queue.pop_front() else {
                break;
            };
            if self.claimed.contains(&digest) || !self.is_pending(&digest) {
                continue;
            }
            if let Some(request) = self.requests.get(&digest) {
                self.claimed.insert(digest);
                batch.push(request.clone());
            }
        }
        batch
    }

    /// Records that an accepted pre-prepare carries `digest`.
    pub fn mark_claimed(&mut self, digest: Digest) {
        self.claimed.insert(digest);
    }

    /// Makes every claimed but unexecuted request proposable again, ahead of
    /// anything that arrived later.
    pub fn release_claims(&mut self) {
        let mut released: Vec<Digest> = self
            .claimed
            .drain()
            .filter(|d| self.requests.contains_key(d))
            .collect();
        released.retain(|d| self.is_pending(d));
        released.sort_by_key(|d| self.requests.get(d).map(|r| (r.client, r.timestamp)));
        for digest in released.into_iter().rev() {
            self.queue.push_front(digest);
        }
    }

    pub fn has_unexecuted(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn has_unclaimed(&self) -> bool {
        self.pending.values().any(|d| !self.claimed.contains(d))
    }

    /// Moves a request from pending to executed at `seqno`.
    pub fn executed(&mut self, seqno: Seqno, digest: &Digest) {
        let Some(request) = self.requests.get(digest) else {
            return;
        };
        let (client, timestamp) = (request.client, request.timestamp);
        if self.pending.get(&(client, timestamp)) == Some(digest) {
            self.pending.remove(&(client, timestamp));
        }
        self.claimed.remove(digest);
        let last = self.last_executed.entry(client).or_default();
        *last = (*last).max(timestamp);
        // anything older from this client can never run now
        self.pending.retain(|(c, ts), _| *c != client || *ts > timestamp);
        self.retired.entry(seqno).or_default().push(*digest);
    }

    /// Forgets executed request bodies at or below a stable checkpoint, and
    /// pending ones that became stale.
    pub fn collect_garbage(&mut self, stable: Seqno) {
        let keep = self.retired.split_off(&(stable + 1));
        for digest in std::mem::replace(&mut self.retired, keep).into_values().flatten() {
            self.requests.remove(&digest);
        }
        let pending: HashSet<Digest> = self.pending.values().copied().collect();
        let retired: HashSet<Digest> = self.retired.values().flatten().copied().collect();
        self.requests
            .retain(|d, _| pending.contains(d) || retired.contains(d));
        self.queue.retain(|d| pending.contains(d));
        self.claimed.retain(|d| pending.contains(d));
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn request(client: usize, timestamp: u64, op: &'static [u8]) -> Request {
        Request::new(client, timestamp, Bytes::from_static(op), true)
    }

    #[test]
    fn test_admission_rules() {
        let mut store = RequestStore::new();
        assert_eq!(store.insert(request(0, 1, b"SET a 1")), Admission::New);
        assert_eq!(store.insert(request(0, 1, b"SET a 1")), Admission::Known);
        assert_eq!(store.insert(request(0, 1, b"SET a 2")), Admission::Conflict);

        let digest = request(0, 1, b"SET a 1").digest();
        store.executed(1, &digest);
        assert_eq!(store.insert(request(0, 1, b"SET a 3")), Admission::Stale);
        assert_eq!(store.insert(request(0, 2, b"SET a 3")), Admission::New);
        assert_eq!(store.last_executed(0), Some(1));
    }

    #[test]
    fn test_claims_are_released_in_order() {
        let mut store = RequestStore::new();
        for ts in 1..=4 {
            store.insert(request(0, ts, b"GET a"));
        }
        let first: Vec<u64> = store.claim_batch(3).iter().map(|r| r.timestamp).collect();
        assert_eq!(first, vec![1, 2, 3]);
        assert!(store.has_unclaimed());

        store.executed(1, &request(0, 1, b"GET a").digest());
        store.release_claims();
        let again: Vec<u64> = store.claim_batch(8).iter().map(|r| r.timestamp).collect();
        assert_eq!(again, vec![2, 3, 4]);
        assert!(!store.has_unclaimed());
        assert!(store.has_unexecuted());
    }

    #[test]
    fn test_marked_requests_are_not_reproposed() {
        let mut store = RequestStore::new();
        store.insert(request(1, 1, b"GET a"));
        store.mark_claimed(request(1, 1, b"GET a").digest());
        assert!(store.claim_batch(4).is_empty());
    }

    #[test]
    fn test_garbage_collection_keeps_unstable_bodies() {
        let mut store = RequestStore::new();
        let a = request(0, 1, b"GET a");
        let b = request(1, 1, b"GET b");
        let c = request(2, 1, b"GET c");
        store.insert(a.clone());
        store.insert(b.clone());
        store.insert(c.clone());
        store.executed(1, &a.digest());
        store.executed(2, &b.digest());

        store.collect_garbage(1);
        assert!(!store.contains(&a.digest()));
        assert!(store.contains(&b.digest()));
        assert!(store.contains(&c.digest()));
        assert_eq!(store.len(), 2);
    }
}
