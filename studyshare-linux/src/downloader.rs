//! HTTP part downloader: streams one part into a staging file, then hands it to the store.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use studyshare_core::transfer::PercentMeter;
use studyshare_core::{AcquisitionSource, ChunkIdentity, ChunkRecord, ErrorKind};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::store::{ChunkStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("network request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("server returned an unsuccessful status code: {0}")]
    InvalidResponse(StatusCode),
    #[error("body ended after {got} of {expected} bytes")]
    Truncated { got: u64, expected: u64 },
    #[error("storage: {0}")]
    Storage(#[from] StoreError),
    #[error("write: {0}")]
    Write(#[from] std::io::Error),
    #[error("download of {0} already in progress")]
    AlreadyInProgress(ChunkIdentity),
}

impl DownloadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DownloadError::Network(_) | DownloadError::Timeout(_) | DownloadError::Truncated { .. } => {
                ErrorKind::Network
            }
            DownloadError::InvalidResponse(_) => ErrorKind::InvalidResponse,
            DownloadError::Storage(_) | DownloadError::Write(_) => ErrorKind::Storage,
            DownloadError::AlreadyInProgress(_) => ErrorKind::AlreadyInProgress,
        }
    }
}

/// Progress report, emitted only when the whole percentage increases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    pub percent: u8,
    pub bytes: u64,
    pub total: u64,
}

/// Something that can bring one part onto this device. The coordinator only sees this.
#[async_trait]
pub trait PartFetcher: Send + Sync {
    async fn fetch(
        &self,
        identity: &ChunkIdentity,
        url: &str,
        on_progress: &(dyn Fn(DownloadProgress) + Send + Sync),
    ) -> Result<ChunkRecord, DownloadError>;
}

pub struct ChunkDownloader {
    client: Client,
    store: Arc<ChunkStore>,
    read_timeout: Duration,
    in_flight: Mutex<HashSet<ChunkIdentity>>,
}

/// Releases the in-flight claim on drop, including on early return.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<ChunkIdentity>>,
    identity: ChunkIdentity,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.identity);
    }
}

impl ChunkDownloader {
    pub fn new(
        store: Arc<ChunkStore>,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, DownloadError> {
        let client = Client::builder().connect_timeout(connect_timeout).build()?;
        Ok(Self {
            client,
            store,
            read_timeout,
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    fn claim(&self, identity: &ChunkIdentity) -> Result<InFlight<'_>, DownloadError> {
        let mut set = self.in_flight.lock();
        if !set.insert(identity.clone()) {
            return Err(DownloadError::AlreadyInProgress(identity.clone()));
        }
        Ok(InFlight {
            set: &self.in_flight,
            identity: identity.clone(),
        })
    }

    /// Download `url` as `identity`. The staging file is removed on any failure.
    pub async fn download(
        &self,
        identity: &ChunkIdentity,
        url: &str,
        on_progress: &(dyn Fn(DownloadProgress) + Send + Sync),
    ) -> Result<ChunkRecord, DownloadError> {
        let _claim = self.claim(identity)?;
        let staging = self.store.staging_path(identity)?;
        debug!(video = %identity.video_title, part = identity.part_index, url, "download started");
        let result = self.stream_to(&staging, url, on_progress).await;
        match result {
            Ok(bytes) => {
                let record = self
                    .store
                    .record_chunk(identity, &staging, AcquisitionSource::Downloaded)
                    .map_err(|e| {
                        self.store.discard(&staging);
                        e
                    })?;
                info!(video = %identity.video_title, part = identity.part_index, bytes, "download finished");
                Ok(record)
            }
            Err(e) => {
                self.store.discard(&staging);
                warn!(video = %identity.video_title, part = identity.part_index, error = %e, "download failed");
                Err(e)
            }
        }
    }

    async fn stream_to(
        &self,
        staging: &std::path::Path,
        url: &str,
        on_progress: &(dyn Fn(DownloadProgress) + Send + Sync),
    ) -> Result<u64, DownloadError> {
        let mut response = tokio::time::timeout(self.read_timeout, self.client.get(url).send())
            .await
            .map_err(|_| DownloadError::Timeout("response headers"))??;
        if !response.status().is_success() {
            return Err(DownloadError::InvalidResponse(response.status()));
        }

        let total = response.content_length();
        let mut meter = PercentMeter::new(total);
        let mut file = tokio::fs::File::create(staging).await?;
        loop {
            let next = tokio::time::timeout(self.read_timeout, response.chunk())
                .await
                .map_err(|_| DownloadError::Timeout("response body"))??;
            let Some(chunk) = next else { break };
            file.write_all(&chunk).await?;
            if let Some(percent) = meter.advance(chunk.len() as u64) {
                on_progress(DownloadProgress {
                    percent,
                    bytes: meter.bytes(),
                    total: total.unwrap_or_default(),
                });
            }
        }
        file.flush().await?;
        file.sync_all().await?;

        if let Some(expected) = total {
            if meter.bytes() != expected {
                return Err(DownloadError::Truncated {
                    got: meter.bytes(),
                    expected,
                });
            }
        }
        Ok(meter.bytes())
    }
}

#[async_trait]
impl PartFetcher for ChunkDownloader {
    async fn fetch(
        &self,
        identity: &ChunkIdentity,
        url: &str,
        on_progress: &(dyn Fn(DownloadProgress) + Send + Sync),
    ) -> Result<ChunkRecord, DownloadError> {
        self.download(identity, url, on_progress).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::get;
    use axum::Router;
    use futures::StreamExt;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    struct TestServer {
        base: String,
        shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    }

    impl TestServer {
        async fn new(router: Router) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
            let server = axum::serve(listener, router).with_graceful_shutdown(async {
                shutdown_rx.await.ok();
            });
            tokio::spawn(async move {
                server.await.unwrap();
            });
            Self {
                base: format!("http://{}", addr),
                shutdown_tx: Some(shutdown_tx),
            }
        }

        fn url(&self, path: &str) -> String {
            format!("{}{}", self.base, path)
        }
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            if let Some(tx) = self.shutdown_tx.take() {
                let _ = tx.send(());
            }
        }
    }

    fn router() -> Router {
        Router::new()
            .route("/part", get(|| async { vec![7u8; 300_000] }))
            .route("/missing", get(|| async { AxumStatus::NOT_FOUND }))
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_millis(400)).await;
                    vec![1u8; 10]
                }),
            )
            .route(
                "/stall",
                get(|| async {
                    let first = futures::stream::once(async {
                        Ok::<Vec<u8>, std::io::Error>(vec![0u8; 16])
                    });
                    Body::from_stream(first.chain(futures::stream::pending()))
                }),
            )
    }

    fn downloader(dir: &TempDir, read_timeout: Duration) -> (Arc<ChunkStore>, Arc<ChunkDownloader>) {
        let store = Arc::new(ChunkStore::open(dir.path()).unwrap());
        let dl = ChunkDownloader::new(store.clone(), Duration::from_secs(5), read_timeout).unwrap();
        (store, Arc::new(dl))
    }

    #[tokio::test]
    async fn downloads_into_store_with_monotonic_progress() {
        let server = TestServer::new(router()).await;
        let dir = TempDir::new().unwrap();
        let (store, dl) = downloader(&dir, Duration::from_secs(5));
        let id = ChunkIdentity::new("Linked Lists", 0);

        let seen = Mutex::new(Vec::new());
        let record = dl
            .download(&id, &server.url("/part"), &|p| seen.lock().push(p.percent))
            .await
            .unwrap();

        assert_eq!(record.size, 300_000);
        assert_eq!(record.source, AcquisitionSource::Downloaded);
        assert!(store.has_chunk(&id));
        let seen = seen.into_inner();
        assert_eq!(seen.last(), Some(&100));
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn non_success_status_is_invalid_response() {
        let server = TestServer::new(router()).await;
        let dir = TempDir::new().unwrap();
        let (store, dl) = downloader(&dir, Duration::from_secs(5));
        let id = ChunkIdentity::new("Linked Lists", 1);

        let err = dl
            .download(&id, &server.url("/missing"), &|_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::InvalidResponse(s) if s == StatusCode::NOT_FOUND));
        assert_eq!(err.kind(), ErrorKind::InvalidResponse);
        assert!(!store.has_chunk(&id));
    }

    #[tokio::test]
    async fn unreachable_host_is_network_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let dir = TempDir::new().unwrap();
        let (_store, dl) = downloader(&dir, Duration::from_secs(5));

        let err = dl
            .download(
                &ChunkIdentity::new("Stacks", 0),
                &format!("http://{}/part", addr),
                &|_| {},
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
    }

    #[tokio::test]
    async fn stalled_body_times_out_and_leaves_no_staging() {
        let server = TestServer::new(router()).await;
        let dir = TempDir::new().unwrap();
        let (store, dl) = downloader(&dir, Duration::from_millis(200));
        let id = ChunkIdentity::new("Queues", 0);

        let err = dl
            .download(&id, &server.url("/stall"), &|_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Timeout(_)));
        assert_eq!(err.kind(), ErrorKind::Network);

        let video_dir = store.part_path(&id).parent().unwrap().to_path_buf();
        let leftovers = std::fs::read_dir(video_dir).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn same_identity_concurrently_is_rejected() {
        let server = TestServer::new(router()).await;
        let dir = TempDir::new().unwrap();
        let (_store, dl) = downloader(&dir, Duration::from_secs(5));
        let id = ChunkIdentity::new("Tries", 3);
        let url = server.url("/slow");

        let first = {
            let dl = dl.clone();
            let id = id.clone();
            let url = url.clone();
            tokio::spawn(async move { dl.download(&id, &url, &|_| {}).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let err = dl.download(&id, &url, &|_| {}).await.unwrap_err();
        assert!(matches!(err, DownloadError::AlreadyInProgress(_)));

        // A different identity is not blocked.
        dl.download(&ChunkIdentity::new("Tries", 4), &url, &|_| {})
            .await
            .unwrap();
        first.await.unwrap().unwrap();
    }
}
