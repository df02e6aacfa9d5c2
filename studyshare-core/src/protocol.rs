//! Wire protocol: message types, protocol version and service namespace.

use serde::{Deserialize, Serialize};

use crate::chunk::ChunkIdentity;
use crate::identity::{EndpointId, PublicKey};
use crate::transfer::TransferId;

/// Current protocol version. Used in beacon and handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// Service namespace. Advertiser and discoverer must match exactly.
pub const SERVICE_ID: &str = "com.humblecoders.humblecoders.SERVICE_ID";

/// Max payload bytes carried by one `PayloadChunk`.
pub const PAYLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// What an inbound payload claims to be.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadLabel {
    /// A video part with its identity.
    Part { video_title: String, part_index: u32 },
    /// A bare file with no part identity.
    File { file_name: String },
}

impl PayloadLabel {
    pub fn for_part(identity: &ChunkIdentity) -> Self {
        PayloadLabel::Part {
            video_title: identity.video_title.clone(),
            part_index: identity.part_index,
        }
    }

    /// Part identity, if the sender supplied a usable one.
    pub fn identity(&self) -> Option<ChunkIdentity> {
        match self {
            PayloadLabel::Part {
                video_title,
                part_index,
            } if !video_title.trim().is_empty() => {
                Some(ChunkIdentity::new(video_title.clone(), *part_index))
            }
            _ => None,
        }
    }
}

/// Metadata sent ahead of the payload bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadOffer {
    pub transfer_id: TransferId,
    pub label: PayloadLabel,
    pub total_bytes: u64,
    pub sha256: [u8; 32],
}

/// Why a receiver refused a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// Receiver already holds this part.
    AlreadyHave,
    /// Another inbound transfer of this part is active.
    AlreadyInProgress,
    TooLarge,
    /// Sender has been isolated after repeated integrity failures.
    Untrusted,
    IntegrityFailed,
    Storage,
    Protocol,
    /// Sender went quiet in the middle of a payload.
    Stalled,
}

/// All wire message types. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Discovery: advertise presence.
    Beacon {
        protocol_version: u8,
        service_id: String,
        endpoint_id: EndpointId,
        public_key: PublicKey,
        display_name: String,
        listen_port: u16,
    },
    /// Unicast answer to a beacon so the advertiser learns about us quickly.
    DiscoveryResponse {
        protocol_version: u8,
        service_id: String,
        endpoint_id: EndpointId,
        public_key: PublicKey,
        display_name: String,
        listen_port: u16,
    },
    /// Liveness on an open connection.
    Heartbeat { endpoint_id: EndpointId },
    /// Graceful disconnect.
    Leave { endpoint_id: EndpointId },
    PayloadStart(PayloadOffer),
    PayloadChunk {
        transfer_id: TransferId,
        offset: u64,
        bytes: Vec<u8>,
    },
    PayloadEnd { transfer_id: TransferId },
    /// Receiver verified and kept the payload.
    PayloadAccepted { transfer_id: TransferId },
    PayloadRejected {
        transfer_id: TransferId,
        reason: RejectReason,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_label_carries_identity() {
        let id = ChunkIdentity::new("Sorting", 3);
        let label = PayloadLabel::for_part(&id);
        assert_eq!(label.identity(), Some(id));
    }

    #[test]
    fn file_label_and_blank_title_have_no_identity() {
        let file = PayloadLabel::File {
            file_name: "lecture.mp4".into(),
        };
        assert_eq!(file.identity(), None);
        let blank = PayloadLabel::Part {
            video_title: "  ".into(),
            part_index: 0,
        };
        assert_eq!(blank.identity(), None);
    }
}
