//! Group-study policy: downloads, manual shares, always-on reception and the merge of
//! whatever arrives into the store. One event loop consumes transport events; public
//! operations can run next to it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use studyshare_core::{
    AcquisitionSource, ChunkIdentity, Direction, EndpointId, ErrorKind, JobError, PayloadLabel,
    SectionVideo, SessionModel, SessionState, TransferEvent, TransferId, TransferJob,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::downloader::{DownloadProgress, PartFetcher};
use crate::gate::ReceiveGate;
use crate::store::{ChunkStore, StoreError};
use crate::transport::{PeerTransport, TransportEvent};

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("video {0:?} is not part of the session")]
    UnknownVideo(String),
    #[error("{0} has no source url in the session")]
    UnknownPart(ChunkIdentity),
    #[error("no single endpoint matches {0:?}")]
    UnknownEndpoint(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CoordinatorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoordinatorError::Store(e) => e.kind(),
            CoordinatorError::UnknownVideo(_) | CoordinatorError::UnknownPart(_) => {
                ErrorKind::ChunkNotLocal
            }
            CoordinatorError::UnknownEndpoint(_) => ErrorKind::PeerDisconnected,
        }
    }
}

type JobWatch = watch::Receiver<Option<TransferJob>>;

pub struct TransferCoordinator {
    store: Arc<ChunkStore>,
    gate: Arc<ReceiveGate>,
    fetcher: Arc<dyn PartFetcher>,
    transport: Arc<dyn PeerTransport>,
    model: Mutex<SessionModel>,
    state_tx: watch::Sender<SessionState>,
    /// Downloads in flight; later callers for the same part wait on the first one.
    downloads: Mutex<HashMap<ChunkIdentity, JobWatch>>,
    auto_connect: bool,
}

/// The leader's claim on one download. Dropping it frees the part for the next request.
struct DownloadSlot<'a> {
    coordinator: &'a TransferCoordinator,
    identity: ChunkIdentity,
    job_id: TransferId,
    tx: watch::Sender<Option<TransferJob>>,
}

impl DownloadSlot<'_> {
    fn finish(&self, job: &TransferJob) {
        self.tx.send_replace(Some(job.clone()));
    }
}

impl Drop for DownloadSlot<'_> {
    fn drop(&mut self) {
        self.coordinator.downloads.lock().remove(&self.identity);
        self.coordinator.gate.release(self.job_id);
    }
}

impl TransferCoordinator {
    pub fn new(
        store: Arc<ChunkStore>,
        gate: Arc<ReceiveGate>,
        fetcher: Arc<dyn PartFetcher>,
        transport: Arc<dyn PeerTransport>,
        auto_connect: bool,
    ) -> Self {
        let mut model = SessionModel::new();
        model.set_records(store.all_chunks());
        for orphan in store.orphans() {
            model.add_orphan(orphan);
        }
        let (state_tx, _) = watch::channel(model.snapshot());
        Self {
            store,
            gate,
            fetcher,
            transport,
            model: Mutex::new(model),
            state_tx,
            downloads: Mutex::new(HashMap::new()),
            auto_connect,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn local_id(&self) -> EndpointId {
        self.transport.local_id()
    }

    fn update<R>(&self, f: impl FnOnce(&mut SessionModel) -> R) -> R {
        let (out, snapshot) = {
            let mut model = self.model.lock();
            let out = f(&mut model);
            (out, model.snapshot())
        };
        self.state_tx.send_replace(snapshot);
        out
    }

    fn apply(&self, event: TransferEvent) -> Option<TransferJob> {
        match self.update(|m| m.on_transfer_event(&event)) {
            Ok(job) => Some(job),
            Err(e) => {
                debug!(transfer = %event.id(), error = %e, "transfer event dropped");
                None
            }
        }
    }

    fn refuse(
        &self,
        identity: &ChunkIdentity,
        direction: Direction,
        endpoint: Option<EndpointId>,
        error: JobError,
    ) -> TransferJob {
        warn!(
            video = %identity.video_title,
            part = identity.part_index,
            kind = ?error.kind,
            error = %error.message,
            "request refused"
        );
        let job = TransferJob::refused(identity.clone(), direction, endpoint, error.clone());
        self.update(|m| m.record_error(error, Some(identity.clone())));
        job
    }

    /// Install the study session and pick up part files already on disk.
    pub fn load_session(&self, section_title: &str, videos: Vec<SectionVideo>) -> Result<(), CoordinatorError> {
        for video in &videos {
            self.store.rescan(&video.title)?;
        }
        let records = self.store.all_chunks();
        info!(section = %section_title, videos = videos.len(), parts_on_disk = records.len(), "session loaded");
        self.update(|m| {
            m.set_session(section_title, videos);
            m.set_records(records);
        });
        Ok(())
    }

    /// Fetch one part over HTTP unless it is already here. Concurrent requests for the same
    /// part share one fetch; failures come back as a terminal job, never as an error.
    pub async fn request_download(&self, identity: &ChunkIdentity, url: &str) -> TransferJob {
        if let Some(record) = self.store.get(identity) {
            return TransferJob::already_local(identity.clone(), record.size);
        }

        let job = TransferJob::download(identity.clone());
        let slot = {
            let mut downloads = self.downloads.lock();
            match downloads.get(identity) {
                Some(existing) => Err(existing.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    downloads.insert(identity.clone(), rx);
                    Ok(DownloadSlot {
                        coordinator: self,
                        identity: identity.clone(),
                        job_id: job.id,
                        tx,
                    })
                }
            }
        };
        let slot = match slot {
            Ok(slot) => slot,
            Err(mut leader) => {
                debug!(video = %identity.video_title, part = identity.part_index, "joining download in flight");
                let outcome = leader.wait_for(Option::is_some).await.map(|j| (*j).clone());
                return match outcome {
                    Ok(Some(job)) => job,
                    _ => self.refuse(
                        identity,
                        Direction::Inbound,
                        None,
                        JobError::new(ErrorKind::Network, "download abandoned"),
                    ),
                };
            }
        };

        if let Err(reason) = self.gate.claim(identity, job.id) {
            let job = match self.store.get(identity) {
                Some(record) => TransferJob::already_local(identity.clone(), record.size),
                None => self.refuse(
                    identity,
                    Direction::Inbound,
                    None,
                    JobError::new(
                        ErrorKind::AlreadyInProgress,
                        format!("part is being received from a peer ({:?})", reason),
                    ),
                ),
            };
            slot.finish(&job);
            return job;
        }

        let id = job.id;
        let tracked = match self.update(|m| m.on_transfer_started(job.clone())) {
            Ok(()) => true,
            Err(e) => {
                warn!(transfer = %id, error = %e, "download not tracked in session state");
                false
            }
        };
        info!(video = %identity.video_title, part = identity.part_index, transfer = %id, %url, "download started");

        let on_progress = |p: DownloadProgress| {
            if tracked {
                self.apply(TransferEvent::Progress {
                    id,
                    bytes_transferred: p.bytes,
                    total_bytes: Some(p.total),
                });
            }
        };
        let terminal = match self.fetcher.fetch(identity, url, &on_progress).await {
            Ok(record) => {
                self.update(|m| m.on_chunk_recorded(record));
                TransferEvent::Succeeded { id }
            }
            Err(e) => {
                warn!(video = %identity.video_title, part = identity.part_index, error = %e, "download failed");
                TransferEvent::Failed {
                    id,
                    error: JobError::new(e.kind(), e.to_string()),
                }
            }
        };
        let finished = match tracked.then(|| self.apply(terminal.clone())).flatten() {
            Some(job) => job,
            None => self.finish_untracked(job, &terminal),
        };
        slot.finish(&finished);
        finished
    }

    /// Terminal job for a download the session table would not hold. A failure still
    /// reaches `last_error`.
    fn finish_untracked(&self, mut job: TransferJob, terminal: &TransferEvent) -> TransferJob {
        if let Err(e) = job.apply(terminal) {
            debug!(transfer = %job.id, error = %e, "terminal event not applied");
        }
        if let Some(error) = job.error.clone() {
            self.update(|m| m.record_error(error, job.identity.clone()));
        }
        job
    }

    /// Download one part using the session's url for it.
    pub async fn download_part(&self, identity: &ChunkIdentity) -> Result<TransferJob, CoordinatorError> {
        let url = {
            let model = self.model.lock();
            model
                .video(&identity.video_title)
                .and_then(|v| v.url_for(identity.part_index))
                .map(str::to_string)
        };
        let url = url.ok_or_else(|| CoordinatorError::UnknownPart(identity.clone()))?;
        Ok(self.request_download(identity, &url).await)
    }

    /// Request every missing part of a video at once. One failing part leaves the others be.
    pub async fn download_video(&self, video_title: &str) -> Result<Vec<TransferJob>, CoordinatorError> {
        let video = self
            .model
            .lock()
            .video(video_title)
            .cloned()
            .ok_or_else(|| CoordinatorError::UnknownVideo(video_title.to_string()))?;
        let requests: Vec<(ChunkIdentity, String)> = video
            .expected_parts()
            .into_iter()
            .filter(|identity| !self.store.has_chunk(identity))
            .filter_map(|identity| {
                let url = video.url_for(identity.part_index)?.to_string();
                Some((identity, url))
            })
            .collect();
        info!(video = %video_title, missing = requests.len(), "downloading video");
        Ok(join_all(requests.iter().map(|(identity, url)| self.request_download(identity, url))).await)
    }

    /// Push one local part to one endpoint. Nothing is sent if the part is not here.
    pub async fn share_part(&self, identity: &ChunkIdentity, endpoint: EndpointId) -> TransferJob {
        let Some(record) = self.store.get(identity) else {
            return self.refuse(
                identity,
                Direction::Outbound,
                Some(endpoint),
                JobError::new(ErrorKind::ChunkNotLocal, "part has not been acquired yet"),
            );
        };
        match self
            .transport
            .send_payload(endpoint, identity, &record.path)
            .await
        {
            Ok(job) => job,
            Err(e) => self.refuse(
                identity,
                Direction::Outbound,
                Some(endpoint),
                JobError::new(e.kind(), e.to_string()),
            ),
        }
    }

    pub async fn connect(&self, endpoint: EndpointId) {
        self.transport.connect(endpoint).await;
    }

    pub async fn disconnect(&self, endpoint: EndpointId) {
        self.transport.disconnect(endpoint).await;
    }

    /// Resolve an operator-typed endpoint id prefix.
    pub fn resolve_endpoint(&self, prefix: &str) -> Result<EndpointId, CoordinatorError> {
        self.model
            .lock()
            .endpoints()
            .find_by_prefix(prefix)
            .map(|e| e.id)
            .ok_or_else(|| CoordinatorError::UnknownEndpoint(prefix.to_string()))
    }

    /// Advertise and discover together.
    pub async fn start_sharing(&self) {
        self.transport.start_advertising().await;
        self.transport.start_discovery().await;
    }

    pub async fn stop_sharing(&self) {
        self.transport.cleanup().await;
    }

    pub fn is_ready(&self, video_title: &str) -> bool {
        self.model.lock().is_ready(video_title)
    }

    /// On-disk parts of a video, in part order.
    pub fn playback_files(&self, video_title: &str) -> Vec<PathBuf> {
        self.store
            .list_chunks(video_title)
            .into_iter()
            .map(|r| r.path)
            .collect()
    }

    pub fn clear_video(&self, video_title: &str) -> Result<(), CoordinatorError> {
        self.store.clear(video_title)?;
        self.update(|m| m.on_video_cleared(video_title));
        Ok(())
    }

    /// Every part of every video, and the orphans.
    pub fn clear_all(&self) -> Result<(), CoordinatorError> {
        self.store.clear_all()?;
        self.update(|m| m.on_all_cleared());
        Ok(())
    }

    /// Returns false if the part was not stored.
    pub fn delete_part(&self, identity: &ChunkIdentity) -> Result<bool, CoordinatorError> {
        let removed = self.store.delete_chunk(identity)?;
        if removed {
            self.update(|m| m.on_chunk_removed(identity));
        }
        Ok(removed)
    }

    /// Consume transport events until the channel closes.
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        debug!("transport event channel closed");
    }

    pub async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::AdvertisingChanged(on) => self.update(|m| m.set_advertising(on)),
            TransportEvent::DiscoveringChanged(on) => self.update(|m| m.set_discovering(on)),
            TransportEvent::PermissionDenied(capability) => {
                self.update(|m| m.on_permission_denied(capability))
            }
            TransportEvent::EndpointFound { id, name } => {
                let is_new = self.update(|m| m.endpoints_mut().on_found(id, &name));
                if is_new {
                    info!(endpoint = %id.short(), %name, "endpoint found");
                    if self.auto_connect {
                        self.transport.connect(id).await;
                    }
                }
            }
            TransportEvent::EndpointLost { id } => {
                if self.update(|m| m.endpoints_mut().on_lost(id)).is_some() {
                    info!(endpoint = %id.short(), "endpoint lost");
                }
            }
            TransportEvent::Connecting { id } => {
                if let Err(e) = self.update(|m| m.endpoints_mut().on_connecting(id).map(|_| ())) {
                    debug!(endpoint = %id.short(), error = %e, "connecting ignored");
                }
            }
            TransportEvent::Connected { id, name } => {
                if let Err(e) = self.update(|m| m.endpoints_mut().on_connected(id, name.as_deref()).map(|_| ())) {
                    warn!(endpoint = %id.short(), error = %e, "connected ignored");
                    return;
                }
                self.on_connection_established(id);
            }
            TransportEvent::Disconnected { id } => {
                let failed = self.update(|m| {
                    let _ = m.endpoints_mut().on_disconnected(id);
                    m.fail_endpoint_transfers(id)
                });
                for transfer in &failed {
                    self.gate.release(*transfer);
                }
                info!(endpoint = %id.short(), failed_transfers = failed.len(), "endpoint disconnected");
            }
            TransportEvent::TransferStarted(job) => {
                let id = job.id;
                if let Err(e) = self.update(|m| m.on_transfer_started(job)) {
                    warn!(transfer = %id, error = %e, "transfer not tracked");
                }
            }
            TransportEvent::Transfer(event) => {
                let (id, terminal) = (event.id(), event.is_terminal());
                self.apply(event);
                // The transport leaves admitted payloads claimed; the claim goes only once the
                // job is terminal here. Outbound ids hold no claim.
                if terminal {
                    self.gate.release(id);
                }
            }
            TransportEvent::InboundCompleted {
                transfer_id,
                from,
                label,
                path,
                size,
            } => self.merge_inbound(transfer_id, from, label, path, size),
        }
    }

    /// Reception is always on; nothing is pushed from here. A manifest exchange would go here.
    fn on_connection_established(&self, endpoint: EndpointId) {
        let missing: usize = {
            let model = self.model.lock();
            model
                .videos()
                .iter()
                .filter_map(|v| model.assembly(&v.title))
                .map(|a| a.missing().len())
                .sum()
        };
        info!(
            endpoint = %endpoint.short(),
            missing_parts = missing,
            "connected, ready to receive"
        );
    }

    /// Put a verified inbound file where it belongs: its part slot, or `orphaned/`.
    fn merge_inbound(&self, id: TransferId, from: EndpointId, label: PayloadLabel, path: PathBuf, size: u64) {
        let outcome = match &label {
            PayloadLabel::Part {
                video_title,
                part_index,
            } => {
                let identity = ChunkIdentity::new(video_title.clone(), *part_index);
                self.store
                    .record_chunk(&identity, &path, AcquisitionSource::Received)
                    .map(|record| {
                        info!(
                            video = %identity.video_title,
                            part = identity.part_index,
                            endpoint = %from.short(),
                            size,
                            "received part merged"
                        );
                        self.update(|m| m.on_chunk_recorded(record));
                    })
            }
            PayloadLabel::File { file_name } => {
                self.store.adopt_orphan(&path, file_name).map(|orphan| {
                    self.update(|m| m.add_orphan(orphan));
                })
            }
        };
        let terminal = match outcome {
            Ok(()) => TransferEvent::Succeeded { id },
            Err(e) => {
                error!(transfer = %id, error = %e, "could not keep inbound file");
                self.store.discard(&path);
                TransferEvent::Failed {
                    id,
                    error: JobError::new(e.kind(), e.to_string()),
                }
            }
        };
        self.apply(terminal);
        self.gate.release(id);
    }
}
