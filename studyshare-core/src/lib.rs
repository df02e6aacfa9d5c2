//! StudyShare core: chunk model, wire protocol, transfer and session state.
//! Host-driven: no I/O; the daemon owns sockets, files and HTTP and feeds events in.

pub mod chunk;
pub mod endpoint;
pub mod identity;
pub mod integrity;
pub mod protocol;
pub mod session;
pub mod transfer;
pub mod wire;

pub use chunk::{AcquisitionSource, AssemblyState, ChunkIdentity, ChunkRecord, SectionVideo};
pub use endpoint::{Endpoint, EndpointState, EndpointTable};
pub use identity::{EndpointId, Keypair, PublicKey};
pub use protocol::{Message, PayloadLabel, PayloadOffer, RejectReason, PROTOCOL_VERSION};
pub use session::{Capability, PartStatus, SessionModel, SessionState, VideoProgress};
pub use transfer::{
    Direction, ErrorKind, JobError, JobState, TransferEvent, TransferId, TransferJob,
};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
