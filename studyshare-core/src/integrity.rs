//! Integrity: payload SHA-256, incremental hashing, per-endpoint trust tracking.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::identity::EndpointId;

/// Default maximum integrity failures before an endpoint is isolated.
pub const DEFAULT_MAX_INTEGRITY_FAILURES: u32 = 3;

/// Incremental hasher for payloads streamed in chunks.
#[derive(Default, Clone)]
pub struct PayloadHasher {
    inner: Sha256,
    len: u64,
}

impl PayloadHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
        self.len += bytes.len() as u64;
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn finalize(self) -> [u8; 32] {
        self.inner.finalize().into()
    }

    /// True iff the hashed bytes have the expected length and digest.
    pub fn verify(self, expected_len: u64, expected_hash: &[u8; 32]) -> bool {
        self.len == expected_len && self.finalize() == *expected_hash
    }
}

/// Tracks integrity failures per endpoint; isolated endpoints get their payloads rejected.
pub struct PeerTrustTracker {
    failures: HashMap<EndpointId, u32>,
    max_failures: u32,
}

impl PeerTrustTracker {
    pub fn new(max_failures: u32) -> Self {
        Self {
            failures: HashMap::new(),
            max_failures,
        }
    }

    pub fn record_failure(&mut self, endpoint: EndpointId) {
        *self.failures.entry(endpoint).or_insert(0) += 1;
    }

    /// An endpoint is isolated once failures >= max. A max of 0 disables isolation.
    pub fn is_isolated(&self, endpoint: &EndpointId) -> bool {
        self.max_failures > 0 && self.failure_count(endpoint) >= self.max_failures
    }

    pub fn failure_count(&self, endpoint: &EndpointId) -> u32 {
        self.failures.get(endpoint).copied().unwrap_or(0)
    }
}

impl Default for PeerTrustTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_INTEGRITY_FAILURES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn hash_payload(payload: &[u8]) -> [u8; 32] {
        Sha256::digest(payload).into()
    }

    #[test]
    fn incremental_matches_one_shot() {
        let payload = b"part bytes streamed in pieces";
        let mut hasher = PayloadHasher::new();
        for piece in payload.chunks(5) {
            hasher.update(piece);
        }
        assert_eq!(hasher.len(), payload.len() as u64);
        assert_eq!(hasher.finalize(), hash_payload(payload));
    }

    #[test]
    fn verify_rejects_tampered_or_short() {
        let payload = b"hello part";
        let hash = hash_payload(payload);

        let mut ok = PayloadHasher::new();
        ok.update(payload);
        assert!(ok.verify(payload.len() as u64, &hash));

        let mut tampered = PayloadHasher::new();
        tampered.update(b"hello pars");
        assert!(!tampered.verify(payload.len() as u64, &hash));

        let mut short = PayloadHasher::new();
        short.update(&payload[..4]);
        assert!(!short.verify(payload.len() as u64, &hash));
    }

    #[test]
    fn endpoint_isolated_after_threshold() {
        let mut tracker = PeerTrustTracker::default();
        let peer = Keypair::generate().endpoint_id();
        for _ in 0..DEFAULT_MAX_INTEGRITY_FAILURES - 1 {
            tracker.record_failure(peer);
        }
        assert!(!tracker.is_isolated(&peer));
        tracker.record_failure(peer);
        assert_eq!(tracker.failure_count(&peer), DEFAULT_MAX_INTEGRITY_FAILURES);
        assert!(tracker.is_isolated(&peer));
    }

    #[test]
    fn zero_threshold_never_isolates() {
        let mut tracker = PeerTrustTracker::new(0);
        let peer = Keypair::generate().endpoint_id();
        tracker.record_failure(peer);
        assert!(!tracker.is_isolated(&peer));
    }
}
