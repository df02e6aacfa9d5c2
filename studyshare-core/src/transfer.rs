//! Transfer jobs: one tracked movement of a chunk's bytes, in either direction.
//!
//! The table enforces the per-job event contract: progress never goes backwards,
//! the terminal state is reached exactly once, and nothing is applied after it.
//! It also enforces at most one active inbound job per chunk identity.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chunk::ChunkIdentity;
use crate::identity::EndpointId;

/// Opaque transfer identifier; also the payload id on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransferId(Uuid);

impl TransferId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        TransferId(Uuid::new_v4())
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl fmt::Debug for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0.simple().to_string();
        write!(f, "TransferId({})", &s[..8])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    Canceled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Canceled)
    }
}

/// Shared error taxonomy. Component errors map onto one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Connection or timeout; retryable by the caller.
    Network,
    /// Disk full or unwritable.
    Storage,
    /// Missing radio/network capability; recoverable by granting it and re-invoking.
    PermissionDenied,
    /// A transfer for the same chunk is already running.
    AlreadyInProgress,
    /// Tried to share a part that is not on this device.
    ChunkNotLocal,
    /// Link lost mid-transfer.
    PeerDisconnected,
    /// Non-success HTTP status.
    InvalidResponse,
    /// Payload hash or length mismatch.
    Integrity,
    /// Receiver refused the payload.
    Rejected,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Network | ErrorKind::PeerDisconnected)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Network => "network error",
            ErrorKind::Storage => "storage error",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::AlreadyInProgress => "already in progress",
            ErrorKind::ChunkNotLocal => "chunk not local",
            ErrorKind::PeerDisconnected => "peer disconnected",
            ErrorKind::InvalidResponse => "invalid response",
            ErrorKind::Integrity => "integrity check failed",
            ErrorKind::Rejected => "rejected by peer",
        };
        f.write_str(s)
    }
}

/// Error attached to a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferJob {
    pub id: TransferId,
    /// None only for inbound payloads that arrived without a part identity.
    pub identity: Option<ChunkIdentity>,
    pub direction: Direction,
    /// None for plain HTTP downloads.
    pub endpoint: Option<EndpointId>,
    pub bytes_transferred: u64,
    pub total_bytes: Option<u64>,
    pub state: JobState,
    pub error: Option<JobError>,
}

impl TransferJob {
    fn pending(
        identity: Option<ChunkIdentity>,
        direction: Direction,
        endpoint: Option<EndpointId>,
        total_bytes: Option<u64>,
    ) -> Self {
        Self {
            id: TransferId::new(),
            identity,
            direction,
            endpoint,
            bytes_transferred: 0,
            total_bytes,
            state: JobState::Pending,
            error: None,
        }
    }

    /// Inbound HTTP download.
    pub fn download(identity: ChunkIdentity) -> Self {
        Self::pending(Some(identity), Direction::Inbound, None, None)
    }

    /// Outbound push to a peer.
    pub fn outbound(identity: ChunkIdentity, endpoint: EndpointId, total_bytes: u64) -> Self {
        Self::pending(
            Some(identity),
            Direction::Outbound,
            Some(endpoint),
            Some(total_bytes),
        )
    }

    /// Inbound payload from a peer; the id is the sender's transfer id.
    pub fn inbound(
        id: TransferId,
        identity: Option<ChunkIdentity>,
        endpoint: EndpointId,
        total_bytes: u64,
    ) -> Self {
        Self {
            id,
            ..Self::pending(identity, Direction::Inbound, Some(endpoint), Some(total_bytes))
        }
    }

    /// An already-terminal success for a chunk that was on disk before anything ran.
    pub fn already_local(identity: ChunkIdentity, size: u64) -> Self {
        Self {
            bytes_transferred: size,
            total_bytes: Some(size),
            state: JobState::Succeeded,
            ..Self::download(identity)
        }
    }

    /// An already-terminal failure, for requests refused before any I/O.
    pub fn refused(
        identity: ChunkIdentity,
        direction: Direction,
        endpoint: Option<EndpointId>,
        error: JobError,
    ) -> Self {
        Self {
            state: JobState::Failed,
            error: Some(error),
            ..Self::pending(Some(identity), direction, endpoint, None)
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// 0–100 when the total is known and non-zero.
    pub fn percent(&self) -> Option<u8> {
        percent_of(self.bytes_transferred, self.total_bytes?)
    }

    /// Apply one event. Progress is clamped to be non-decreasing; anything after a
    /// terminal state is refused.
    pub fn apply(&mut self, event: &TransferEvent) -> Result<(), TableError> {
        if self.is_terminal() {
            return Err(TableError::AlreadyTerminal(self.id));
        }
        match event {
            TransferEvent::Progress {
                bytes_transferred,
                total_bytes,
                ..
            } => {
                self.state = JobState::InProgress;
                self.bytes_transferred = self.bytes_transferred.max(*bytes_transferred);
                if total_bytes.is_some() {
                    self.total_bytes = *total_bytes;
                }
            }
            TransferEvent::Succeeded { .. } => {
                self.state = JobState::Succeeded;
                if let Some(total) = self.total_bytes {
                    self.bytes_transferred = self.bytes_transferred.max(total);
                }
            }
            TransferEvent::Failed { error, .. } => {
                self.state = JobState::Failed;
                self.error = Some(error.clone());
            }
            TransferEvent::Canceled { .. } => {
                self.state = JobState::Canceled;
            }
        }
        Ok(())
    }
}

pub fn percent_of(bytes: u64, total: u64) -> Option<u8> {
    if total == 0 {
        return None;
    }
    Some(((bytes.min(total) as u128 * 100) / total as u128) as u8)
}

/// Emits whole percentages, only when the value increases. Nothing when the total is unknown.
#[derive(Debug, Clone)]
pub struct PercentMeter {
    total: Option<u64>,
    done: u64,
    last: Option<u8>,
}

impl PercentMeter {
    pub fn new(total: Option<u64>) -> Self {
        Self {
            total: total.filter(|t| *t > 0),
            done: 0,
            last: None,
        }
    }

    /// Add `n` bytes; returns the new percentage if it changed.
    pub fn advance(&mut self, n: u64) -> Option<u8> {
        self.done = self.done.saturating_add(n);
        let pct = percent_of(self.done, self.total?)?;
        if self.last.map_or(true, |last| pct > last) {
            self.last = Some(pct);
            Some(pct)
        } else {
            None
        }
    }

    pub fn bytes(&self) -> u64 {
        self.done
    }
}

/// Event for one job. Progress events precede exactly one terminal event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Progress {
        id: TransferId,
        bytes_transferred: u64,
        total_bytes: Option<u64>,
    },
    Succeeded {
        id: TransferId,
    },
    Failed {
        id: TransferId,
        error: JobError,
    },
    Canceled {
        id: TransferId,
    },
}

impl TransferEvent {
    pub fn id(&self) -> TransferId {
        match self {
            TransferEvent::Progress { id, .. }
            | TransferEvent::Succeeded { id }
            | TransferEvent::Failed { id, .. }
            | TransferEvent::Canceled { id } => *id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransferEvent::Progress { .. })
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TableError {
    #[error("transfer {0} is unknown")]
    UnknownJob(TransferId),
    #[error("transfer {0} already reached a terminal state")]
    AlreadyTerminal(TransferId),
    #[error("transfer {0} already registered")]
    Duplicate(TransferId),
    #[error("inbound transfer {existing} already active for {identity}")]
    InboundActive {
        identity: ChunkIdentity,
        existing: TransferId,
    },
}

/// Active and finished jobs, keyed by id.
#[derive(Debug, Default, Clone)]
pub struct TransferTable {
    jobs: HashMap<TransferId, TransferJob>,
}

impl TransferTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new job. Refuses a second active inbound job for the same identity.
    pub fn insert(&mut self, job: TransferJob) -> Result<(), TableError> {
        if self.jobs.contains_key(&job.id) {
            return Err(TableError::Duplicate(job.id));
        }
        if job.direction == Direction::Inbound && !job.is_terminal() {
            if let Some(identity) = &job.identity {
                if let Some(existing) = self.active_inbound(identity) {
                    return Err(TableError::InboundActive {
                        identity: identity.clone(),
                        existing,
                    });
                }
            }
        }
        self.jobs.insert(job.id, job);
        Ok(())
    }

    pub fn apply(&mut self, event: &TransferEvent) -> Result<&TransferJob, TableError> {
        let id = event.id();
        let job = self.jobs.get_mut(&id).ok_or(TableError::UnknownJob(id))?;
        job.apply(event)?;
        Ok(job)
    }

    pub fn get(&self, id: &TransferId) -> Option<&TransferJob> {
        self.jobs.get(id)
    }

    pub fn active_inbound(&self, identity: &ChunkIdentity) -> Option<TransferId> {
        self.jobs
            .values()
            .find(|j| {
                j.direction == Direction::Inbound
                    && !j.is_terminal()
                    && j.identity.as_ref() == Some(identity)
            })
            .map(|j| j.id)
    }

    pub fn active(&self) -> impl Iterator<Item = &TransferJob> {
        self.jobs.values().filter(|j| !j.is_terminal())
    }

    /// Fail every active job on `endpoint`; returns the failed ids.
    pub fn fail_endpoint(&mut self, endpoint: EndpointId, error: JobError) -> Vec<TransferId> {
        let mut out = Vec::new();
        for job in self.jobs.values_mut() {
            if job.endpoint == Some(endpoint) && !job.is_terminal() {
                job.state = JobState::Failed;
                job.error = Some(error.clone());
                out.push(job.id);
            }
        }
        out
    }

    /// Drop terminal jobs; returns them.
    pub fn take_finished(&mut self) -> Vec<TransferJob> {
        let done: Vec<TransferId> = self
            .jobs
            .values()
            .filter(|j| j.is_terminal())
            .map(|j| j.id)
            .collect();
        done.into_iter()
            .filter_map(|id| self.jobs.remove(&id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn progress(id: TransferId, bytes: u64) -> TransferEvent {
        TransferEvent::Progress {
            id,
            bytes_transferred: bytes,
            total_bytes: Some(100),
        }
    }

    #[test]
    fn progress_is_monotonic() {
        let mut table = TransferTable::new();
        let job = TransferJob::download(ChunkIdentity::new("Heaps", 0));
        let id = job.id;
        table.insert(job).unwrap();

        table.apply(&progress(id, 40)).unwrap();
        let job = table.apply(&progress(id, 10)).unwrap();
        assert_eq!(job.bytes_transferred, 40);
        assert_eq!(job.percent(), Some(40));
        assert_eq!(job.state, JobState::InProgress);
    }

    #[test]
    fn nothing_applies_after_terminal() {
        let mut table = TransferTable::new();
        let job = TransferJob::download(ChunkIdentity::new("Heaps", 1));
        let id = job.id;
        table.insert(job).unwrap();
        table.apply(&TransferEvent::Succeeded { id }).unwrap();

        assert_eq!(
            table.apply(&progress(id, 50)).unwrap_err(),
            TableError::AlreadyTerminal(id)
        );
        assert_eq!(
            table
                .apply(&TransferEvent::Failed {
                    id,
                    error: JobError::new(ErrorKind::Network, "late"),
                })
                .unwrap_err(),
            TableError::AlreadyTerminal(id)
        );
        assert_eq!(table.get(&id).unwrap().state, JobState::Succeeded);
    }

    #[test]
    fn one_active_inbound_per_identity() {
        let mut table = TransferTable::new();
        let identity = ChunkIdentity::new("Graphs", 2);
        let peer = Keypair::generate().endpoint_id();
        let first = TransferJob::inbound(TransferId::new(), Some(identity.clone()), peer, 10);
        let first_id = first.id;
        table.insert(first).unwrap();

        let second = TransferJob::download(identity.clone());
        assert_eq!(
            table.insert(second).unwrap_err(),
            TableError::InboundActive {
                identity: identity.clone(),
                existing: first_id,
            }
        );

        // An outbound push of the same part is not an inbound race.
        table
            .insert(TransferJob::outbound(identity.clone(), peer, 10))
            .unwrap();

        table
            .apply(&TransferEvent::Failed {
                id: first_id,
                error: JobError::new(ErrorKind::PeerDisconnected, "gone"),
            })
            .unwrap();
        table.insert(TransferJob::download(identity)).unwrap();
    }

    #[test]
    fn fail_endpoint_only_touches_that_peer() {
        let mut table = TransferTable::new();
        let a = Keypair::generate().endpoint_id();
        let b = Keypair::generate().endpoint_id();
        let ja = TransferJob::outbound(ChunkIdentity::new("V", 0), a, 5);
        let jb = TransferJob::outbound(ChunkIdentity::new("V", 0), b, 5);
        let (ida, idb) = (ja.id, jb.id);
        table.insert(ja).unwrap();
        table.insert(jb).unwrap();

        let failed = table.fail_endpoint(a, JobError::new(ErrorKind::PeerDisconnected, "lost"));
        assert_eq!(failed, vec![ida]);
        assert_eq!(table.get(&ida).unwrap().state, JobState::Failed);
        assert_eq!(table.get(&idb).unwrap().state, JobState::Pending);

        let finished = table.take_finished();
        assert_eq!(finished.len(), 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn percent_meter_emits_only_increases() {
        let mut meter = PercentMeter::new(Some(200));
        assert_eq!(meter.advance(1), Some(0));
        assert_eq!(meter.advance(1), Some(1));
        assert_eq!(meter.advance(0), None);
        assert_eq!(meter.advance(98), Some(50));
        assert_eq!(meter.advance(500), Some(100));
        assert_eq!(meter.advance(10), None);

        let mut unknown = PercentMeter::new(None);
        assert_eq!(unknown.advance(1000), None);
        assert_eq!(unknown.bytes(), 1000);
    }

    #[test]
    fn already_local_job_is_terminal_success() {
        let job = TransferJob::already_local(ChunkIdentity::new("V", 3), 42);
        assert!(job.is_terminal());
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.percent(), Some(100));
    }
}
