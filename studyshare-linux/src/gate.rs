//! Inbound admission: one active inbound transfer per chunk identity, whichever path it
//! comes from (HTTP download or peer payload), plus the bounds applied to peer payloads.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use studyshare_core::integrity::PeerTrustTracker;
use studyshare_core::{ChunkIdentity, EndpointId, PayloadOffer, RejectReason, TransferId};
use tracing::{debug, warn};

use crate::store::ChunkStore;
use crate::transport::InboundPolicy;

pub struct ReceiveGate {
    store: Arc<ChunkStore>,
    claims: Mutex<HashMap<ChunkIdentity, TransferId>>,
    trust: Mutex<PeerTrustTracker>,
    max_payload_bytes: u64,
}

impl ReceiveGate {
    pub fn new(store: Arc<ChunkStore>, max_payload_bytes: u64, max_integrity_failures: u32) -> Self {
        Self {
            store,
            claims: Mutex::new(HashMap::new()),
            trust: Mutex::new(PeerTrustTracker::new(max_integrity_failures)),
            max_payload_bytes,
        }
    }

    /// Claim `identity` for transfer `id`. Fails if the part is already local or already
    /// being received.
    pub fn claim(&self, identity: &ChunkIdentity, id: TransferId) -> Result<(), RejectReason> {
        let mut claims = self.claims.lock();
        if self.store.has_chunk(identity) {
            return Err(RejectReason::AlreadyHave);
        }
        if let Some(existing) = claims.get(identity) {
            if *existing != id {
                return Err(RejectReason::AlreadyInProgress);
            }
        }
        claims.insert(identity.clone(), id);
        Ok(())
    }

    /// Release whatever `id` holds. No-op if it holds nothing.
    pub fn release(&self, id: TransferId) {
        self.claims.lock().retain(|_, v| *v != id);
    }

    pub fn claimed_by(&self, identity: &ChunkIdentity) -> Option<TransferId> {
        self.claims.lock().get(identity).copied()
    }
}

impl InboundPolicy for ReceiveGate {
    fn admit(&self, from: EndpointId, offer: &PayloadOffer) -> Result<PathBuf, RejectReason> {
        if self.trust.lock().is_isolated(&from) {
            warn!(endpoint = %from.short(), transfer = %offer.transfer_id, "payload from isolated endpoint");
            return Err(RejectReason::Untrusted);
        }
        if offer.total_bytes > self.max_payload_bytes {
            warn!(
                endpoint = %from.short(),
                total_bytes = offer.total_bytes,
                max = self.max_payload_bytes,
                "payload too large"
            );
            return Err(RejectReason::TooLarge);
        }
        if let Some(identity) = offer.label.identity() {
            self.claim(&identity, offer.transfer_id)?;
        }
        debug!(endpoint = %from.short(), transfer = %offer.transfer_id, "payload admitted");
        Ok(self.store.incoming_path(offer.transfer_id))
    }

    fn finished(&self, transfer_id: TransferId) {
        self.release(transfer_id);
    }

    fn integrity_failed(&self, from: EndpointId) {
        let mut trust = self.trust.lock();
        trust.record_failure(from);
        if trust.is_isolated(&from) {
            warn!(endpoint = %from.short(), failures = trust.failure_count(&from), "endpoint isolated");
        }
    }
}
