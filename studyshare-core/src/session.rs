//! Host-driven session model: the host feeds store, endpoint and transfer events in;
//! the presentation layer reads [`SessionState`] snapshots out. No logic of its own
//! beyond projecting what it was told.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::chunk::{AcquisitionSource, AssemblyState, ChunkIdentity, ChunkRecord, SectionVideo};
use crate::endpoint::{Endpoint, EndpointTable};
use crate::identity::EndpointId;
use crate::transfer::{
    Direction, ErrorKind, JobError, TableError, TransferEvent, TransferId, TransferJob,
    TransferTable,
};

/// Platform capability a sharing operation needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    Advertise,
    Discover,
    Connect,
}

/// Per-part status as shown next to each part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartStatus {
    NotReceived,
    InFlight {
        direction: Direction,
        percent: Option<u8>,
    },
    Received {
        source: AcquisitionSource,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoProgress {
    pub title: String,
    pub acquired: u32,
    pub total: u32,
    pub ready: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionError {
    pub kind: ErrorKind,
    pub message: String,
    pub identity: Option<ChunkIdentity>,
}

impl SessionError {
    /// Permission failures prompt for a grant; everything else is a generic error.
    pub fn needs_permission(&self) -> bool {
        self.kind == ErrorKind::PermissionDenied
    }
}

/// Snapshot published to the presentation layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub section_title: Option<String>,
    pub discovered: Vec<Endpoint>,
    pub connected: Vec<Endpoint>,
    pub advertising: bool,
    pub discovering: bool,
    pub permission_denied: BTreeSet<Capability>,
    pub parts: BTreeMap<ChunkIdentity, PartStatus>,
    pub videos: Vec<VideoProgress>,
    pub transfers: Vec<TransferJob>,
    pub orphans: Vec<PathBuf>,
    pub last_error: Option<SessionError>,
}

impl SessionState {
    pub fn video(&self, title: &str) -> Option<&VideoProgress> {
        self.videos.iter().find(|v| v.title == title)
    }

    pub fn is_ready(&self, title: &str) -> bool {
        self.video(title).map_or(false, |v| v.ready)
    }

    pub fn part(&self, identity: &ChunkIdentity) -> PartStatus {
        self.parts
            .get(identity)
            .copied()
            .unwrap_or(PartStatus::NotReceived)
    }
}

#[derive(Debug, Default)]
pub struct SessionModel {
    section_title: Option<String>,
    videos: Vec<SectionVideo>,
    endpoints: EndpointTable,
    transfers: TransferTable,
    records: BTreeMap<ChunkIdentity, ChunkRecord>,
    advertising: bool,
    discovering: bool,
    denied: BTreeSet<Capability>,
    orphans: Vec<PathBuf>,
    last_error: Option<SessionError>,
}

impl SessionModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the study session (section and its ordered videos).
    pub fn set_session(&mut self, section_title: &str, videos: Vec<SectionVideo>) {
        self.section_title = Some(section_title.to_string());
        self.videos = videos;
    }

    pub fn videos(&self) -> &[SectionVideo] {
        &self.videos
    }

    pub fn video(&self, title: &str) -> Option<&SectionVideo> {
        self.videos.iter().find(|v| v.title == title)
    }

    /// Replace the whole inventory (after opening or rescanning the store).
    pub fn set_records(&mut self, records: impl IntoIterator<Item = ChunkRecord>) {
        self.records = records
            .into_iter()
            .map(|r| (r.identity.clone(), r))
            .collect();
    }

    pub fn on_chunk_recorded(&mut self, record: ChunkRecord) {
        self.records.entry(record.identity.clone()).or_insert(record);
    }

    pub fn on_chunk_removed(&mut self, identity: &ChunkIdentity) {
        self.records.remove(identity);
    }

    pub fn on_video_cleared(&mut self, video_title: &str) {
        self.records.retain(|k, _| k.video_title != video_title);
    }

    pub fn on_all_cleared(&mut self) {
        self.records.clear();
        self.orphans.clear();
    }

    pub fn endpoints(&self) -> &EndpointTable {
        &self.endpoints
    }

    pub fn endpoints_mut(&mut self) -> &mut EndpointTable {
        &mut self.endpoints
    }

    pub fn on_transfer_started(&mut self, job: TransferJob) -> Result<(), TableError> {
        self.transfers.insert(job)
    }

    /// Apply a job event. On a terminal event the job leaves the active list; a failure
    /// becomes `last_error`. Returns the job as it stands after the event.
    pub fn on_transfer_event(&mut self, event: &TransferEvent) -> Result<TransferJob, TableError> {
        let job = self.transfers.apply(event)?.clone();
        if job.is_terminal() {
            if let Some(error) = &job.error {
                self.record_error(error.clone(), job.identity.clone());
            }
            self.transfers.take_finished();
        }
        Ok(job)
    }

    /// Fail all active jobs of an endpoint (link lost); returns their ids.
    pub fn fail_endpoint_transfers(&mut self, endpoint: EndpointId) -> Vec<TransferId> {
        let error = JobError::new(ErrorKind::PeerDisconnected, "endpoint disconnected");
        let failed = self.transfers.fail_endpoint(endpoint, error.clone());
        if !failed.is_empty() {
            self.record_error(error, None);
        }
        self.transfers.take_finished();
        failed
    }

    pub fn set_advertising(&mut self, on: bool) {
        self.advertising = on;
        if on {
            self.denied.remove(&Capability::Advertise);
        }
    }

    pub fn set_discovering(&mut self, on: bool) {
        self.discovering = on;
        if on {
            self.denied.remove(&Capability::Discover);
        }
    }

    pub fn on_permission_denied(&mut self, capability: Capability) {
        self.denied.insert(capability);
        match capability {
            Capability::Advertise => self.advertising = false,
            Capability::Discover => self.discovering = false,
            Capability::Connect => {}
        }
        self.record_error(
            JobError::new(
                ErrorKind::PermissionDenied,
                format!("{:?} capability unavailable", capability),
            ),
            None,
        );
    }

    pub fn add_orphan(&mut self, path: PathBuf) {
        if !self.orphans.contains(&path) {
            self.orphans.push(path);
        }
    }

    pub fn record_error(&mut self, error: JobError, identity: Option<ChunkIdentity>) {
        self.last_error = Some(SessionError {
            kind: error.kind,
            message: error.message,
            identity,
        });
    }

    pub fn assembly(&self, video_title: &str) -> Option<AssemblyState> {
        let video = self.video(video_title)?;
        let records: Vec<ChunkRecord> = self
            .records
            .range(ChunkIdentity::new(video_title, 0)..=ChunkIdentity::new(video_title, u32::MAX))
            .map(|(_, r)| r.clone())
            .collect();
        Some(AssemblyState::compute(video, &records))
    }

    pub fn is_ready(&self, video_title: &str) -> bool {
        self.assembly(video_title).map_or(false, |a| a.is_ready())
    }

    pub fn snapshot(&self) -> SessionState {
        let mut parts: BTreeMap<ChunkIdentity, PartStatus> = BTreeMap::new();
        for video in &self.videos {
            for identity in video.expected_parts() {
                parts.insert(identity, PartStatus::NotReceived);
            }
        }
        for job in self.transfers.active() {
            if job.direction != Direction::Inbound {
                continue;
            }
            if let Some(identity) = &job.identity {
                parts.insert(
                    identity.clone(),
                    PartStatus::InFlight {
                        direction: job.direction,
                        percent: job.percent(),
                    },
                );
            }
        }
        for (identity, record) in &self.records {
            parts.insert(
                identity.clone(),
                PartStatus::Received {
                    source: record.source,
                },
            );
        }

        let videos = self
            .videos
            .iter()
            .filter_map(|v| self.assembly(&v.title))
            .map(|a| VideoProgress {
                acquired: a.acquired(),
                total: a.total,
                ready: a.is_ready(),
                title: a.video_title,
            })
            .collect();

        let mut transfers: Vec<TransferJob> = self.transfers.active().cloned().collect();
        transfers.sort_by_key(|j| j.id);

        SessionState {
            section_title: self.section_title.clone(),
            discovered: self.endpoints.discovered(),
            connected: self.endpoints.connected(),
            advertising: self.advertising,
            discovering: self.discovering,
            permission_denied: self.denied.clone(),
            parts,
            videos,
            transfers,
            orphans: self.orphans.clone(),
            last_error: self.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::transfer::{JobState, TransferId};

    fn session() -> SessionModel {
        let mut model = SessionModel::new();
        model.set_session(
            "Week 1",
            vec![SectionVideo::new(
                "Recursion",
                vec!["http://a/0".into(), "http://a/1".into(), "http://a/2".into()],
            )],
        );
        model
    }

    fn record(part: u32, source: AcquisitionSource) -> ChunkRecord {
        ChunkRecord {
            identity: ChunkIdentity::new("Recursion", part),
            path: PathBuf::from(format!("/data/Recursion/part_{}.mp4", part)),
            size: 100,
            source,
        }
    }

    #[test]
    fn readiness_follows_records_in_any_order() {
        let mut model = session();
        for (i, part) in [2u32, 0, 1].iter().enumerate() {
            assert!(!model.is_ready("Recursion"));
            let source = if i == 1 {
                AcquisitionSource::Downloaded
            } else {
                AcquisitionSource::Received
            };
            model.on_chunk_recorded(record(*part, source));
        }
        assert!(model.is_ready("Recursion"));
        let snap = model.snapshot();
        let video = snap.video("Recursion").unwrap();
        assert_eq!((video.acquired, video.total, video.ready), (3, 3, true));
    }

    #[test]
    fn part_status_reflects_inflight_and_received() {
        let mut model = session();
        let peer = Keypair::generate().endpoint_id();
        let job = TransferJob::inbound(
            TransferId::new(),
            Some(ChunkIdentity::new("Recursion", 1)),
            peer,
            200,
        );
        let id = job.id;
        model.on_transfer_started(job).unwrap();
        model
            .on_transfer_event(&TransferEvent::Progress {
                id,
                bytes_transferred: 50,
                total_bytes: Some(200),
            })
            .unwrap();
        model.on_chunk_recorded(record(0, AcquisitionSource::Downloaded));

        let snap = model.snapshot();
        assert_eq!(
            snap.part(&ChunkIdentity::new("Recursion", 0)),
            PartStatus::Received {
                source: AcquisitionSource::Downloaded
            }
        );
        assert_eq!(
            snap.part(&ChunkIdentity::new("Recursion", 1)),
            PartStatus::InFlight {
                direction: Direction::Inbound,
                percent: Some(25)
            }
        );
        assert_eq!(
            snap.part(&ChunkIdentity::new("Recursion", 2)),
            PartStatus::NotReceived
        );
        assert_eq!(snap.transfers.len(), 1);
    }

    #[test]
    fn failed_job_becomes_last_error_and_leaves_active_list() {
        let mut model = session();
        let job = TransferJob::download(ChunkIdentity::new("Recursion", 1));
        let id = job.id;
        model.on_transfer_started(job).unwrap();
        let done = model
            .on_transfer_event(&TransferEvent::Failed {
                id,
                error: JobError::new(ErrorKind::Network, "connection reset"),
            })
            .unwrap();
        assert_eq!(done.state, JobState::Failed);

        let snap = model.snapshot();
        assert!(snap.transfers.is_empty());
        let err = snap.last_error.unwrap();
        assert_eq!(err.kind, ErrorKind::Network);
        assert!(!err.needs_permission());
        assert_eq!(err.identity, Some(ChunkIdentity::new("Recursion", 1)));
    }

    #[test]
    fn permission_denied_is_distinguishable() {
        let mut model = session();
        model.set_discovering(true);
        model.on_permission_denied(Capability::Discover);
        let snap = model.snapshot();
        assert!(!snap.discovering);
        assert!(snap.permission_denied.contains(&Capability::Discover));
        assert!(snap.last_error.unwrap().needs_permission());

        model.set_discovering(true);
        assert!(model.snapshot().permission_denied.is_empty());
    }

    #[test]
    fn duplicate_record_keeps_first() {
        let mut model = session();
        model.on_chunk_recorded(record(0, AcquisitionSource::Downloaded));
        model.on_chunk_recorded(record(0, AcquisitionSource::Received));
        assert_eq!(
            model.snapshot().part(&ChunkIdentity::new("Recursion", 0)),
            PartStatus::Received {
                source: AcquisitionSource::Downloaded
            }
        );
    }

    #[test]
    fn clearing_video_resets_readiness() {
        let mut model = session();
        for part in 0..3 {
            model.on_chunk_recorded(record(part, AcquisitionSource::Downloaded));
        }
        assert!(model.is_ready("Recursion"));
        model.on_video_cleared("Recursion");
        assert!(!model.is_ready("Recursion"));
    }
}
