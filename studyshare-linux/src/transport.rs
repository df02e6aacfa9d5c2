//! Peer transport: the `PeerTransport` seam the coordinator talks to, and its LAN backend.
//!
//! Links are TCP with a fixed handshake (version, endpoint id, public key, link salt), then
//! ChaCha20-Poly1305 frames. Every inbound connection is accepted. Payloads go as
//! PayloadStart / PayloadChunk* / PayloadEnd; the receiver answers Accepted or Rejected.
//! Everything the coordinator needs to know arrives as a `TransportEvent`.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use studyshare_core::identity::{
    derive_session_key, link_ciphers, link_salt, Opener, Sealer, LINK_SALT_LEN,
};
use studyshare_core::integrity::PayloadHasher;
use studyshare_core::protocol::PAYLOAD_CHUNK_SIZE;
use studyshare_core::transfer::PercentMeter;
use studyshare_core::wire::{decode_frame, encode_frame, LEN_SIZE, MAX_FRAME_LEN};
use studyshare_core::{
    Capability, ChunkIdentity, EndpointId, ErrorKind, JobError, Keypair, Message, PayloadLabel,
    PayloadOffer, PublicKey, RejectReason, TransferEvent, TransferId, TransferJob,
    PROTOCOL_VERSION,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::discovery::Discovery;

const HANDSHAKE_SIZE: usize = 1 + 16 + 32 + LINK_SALT_LEN; // version + endpoint_id + public_key + salt
const TAG_SIZE: usize = 16;
const MAX_CIPHER_LEN: usize = LEN_SIZE + MAX_FRAME_LEN as usize + TAG_SIZE;
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// A link with no frame for this long is closed.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(20);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const ACK_TIMEOUT: Duration = Duration::from_secs(60);
/// An inbound payload with no chunk for this long is dropped, freeing its part for others.
const INBOUND_STALL_TIMEOUT: Duration = Duration::from_secs(30);
const LINK_QUEUE: usize = 64;

#[derive(Debug, Clone)]
pub enum TransportEvent {
    AdvertisingChanged(bool),
    DiscoveringChanged(bool),
    PermissionDenied(Capability),
    EndpointFound {
        id: EndpointId,
        name: String,
    },
    EndpointLost {
        id: EndpointId,
    },
    Connecting {
        id: EndpointId,
    },
    Connected {
        id: EndpointId,
        name: Option<String>,
    },
    /// Link closed, or a connect attempt failed.
    Disconnected {
        id: EndpointId,
    },
    /// A job exists; its progress and terminal events follow as `Transfer`.
    TransferStarted(TransferJob),
    Transfer(TransferEvent),
    /// Inbound payload verified and staged at `path`. This stands in for the job's
    /// terminal success: whoever places the file reports it.
    InboundCompleted {
        transfer_id: TransferId,
        from: EndpointId,
        label: PayloadLabel,
        path: PathBuf,
        size: u64,
    },
}

/// Decides whether an inbound payload is taken, and where it is staged.
/// `finished` is called only when an admitted payload fails before `TransferStarted` went
/// out. After that the admission is held until whoever consumes the job's terminal event
/// (or `InboundCompleted`) releases it, so it never frees up ahead of the job.
pub trait InboundPolicy: Send + Sync {
    fn admit(&self, from: EndpointId, offer: &PayloadOffer) -> Result<PathBuf, RejectReason>;
    fn finished(&self, transfer_id: TransferId);
    fn integrity_failed(&self, from: EndpointId);
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("endpoint {0} is not connected")]
    NotConnected(EndpointId),
    #[error("{path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

impl TransportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::NotConnected(_) => ErrorKind::PeerDisconnected,
            TransportError::File { .. } => ErrorKind::Storage,
            TransportError::Bind { source, .. } if source.kind() == io::ErrorKind::PermissionDenied => {
                ErrorKind::PermissionDenied
            }
            TransportError::Bind { .. } => ErrorKind::Network,
        }
    }
}

/// Discovery, links and payload exchange. Fail-soft operations report through events;
/// `connect` reports its outcome as Connected or Disconnected.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    fn local_id(&self) -> EndpointId;
    async fn start_advertising(&self);
    async fn stop_advertising(&self);
    async fn start_discovery(&self);
    async fn stop_discovery(&self);
    async fn connect(&self, endpoint: EndpointId);
    async fn disconnect(&self, endpoint: EndpointId);
    /// Begin pushing `path` as `identity`. The returned job is Pending; its events follow.
    async fn send_payload(
        &self,
        endpoint: EndpointId,
        identity: &ChunkIdentity,
        path: &Path,
    ) -> Result<TransferJob, TransportError>;
    /// Stop discovery and advertising, disconnect every endpoint.
    async fn cleanup(&self);
}

#[derive(Debug, Clone)]
pub struct LanSettings {
    pub display_name: String,
    pub listen_addr: SocketAddr,
    pub discovery_port: u16,
}

struct Link {
    serial: u64,
    initiated_by_me: bool,
    tx: mpsc::Sender<Message>,
    close: Arc<Notify>,
}

type AckSender = oneshot::Sender<Result<(), RejectReason>>;

struct Shared {
    keypair: Arc<Keypair>,
    events: mpsc::UnboundedSender<TransportEvent>,
    policy: Arc<dyn InboundPolicy>,
    discovery: Discovery,
    /// Endpoints registered directly rather than through beacons.
    known: Mutex<HashMap<EndpointId, (String, SocketAddr)>>,
    links: Mutex<HashMap<EndpointId, Link>>,
    /// Outbound payloads waiting for the receiver's verdict, with the link they went out on.
    acks: Mutex<HashMap<TransferId, (u64, AckSender)>>,
    next_serial: AtomicU64,
}

struct Inbound {
    offer: PayloadOffer,
    path: PathBuf,
    file: tokio::fs::File,
    hasher: PayloadHasher,
    meter: PercentMeter,
    last_activity: Instant,
}

pub struct LanTransport {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl LanTransport {
    /// Bind the listener and start accepting. Receiving is on from here.
    pub async fn start(
        settings: LanSettings,
        keypair: Arc<Keypair>,
        policy: Arc<dyn InboundPolicy>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Self, TransportError> {
        let addr = settings.listen_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| TransportError::Bind { addr, source })?;
        let discovery = Discovery::new(
            keypair.clone(),
            settings.display_name,
            settings.discovery_port,
            local_addr.port(),
            events.clone(),
        );
        let shared = Arc::new(Shared {
            keypair,
            events,
            policy,
            discovery,
            known: Mutex::new(HashMap::new()),
            links: Mutex::new(HashMap::new()),
            acks: Mutex::new(HashMap::new()),
            next_serial: AtomicU64::new(0),
        });
        info!(addr = %local_addr, endpoint = %shared.keypair.endpoint_id().short(), "transport listening");
        let accept_task = tokio::spawn(accept_loop(listener, shared.clone()));
        Ok(Self {
            shared,
            local_addr,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Make an endpoint connectable without a beacon.
    pub fn register_endpoint(&self, id: EndpointId, name: &str, addr: SocketAddr) {
        self.shared
            .known
            .lock()
            .insert(id, (name.to_string(), addr));
        self.shared.emit(TransportEvent::EndpointFound {
            id,
            name: name.to_string(),
        });
    }

    fn peer_addr(&self, id: &EndpointId) -> Option<SocketAddr> {
        let known = self.shared.known.lock().get(id).map(|(_, addr)| *addr);
        known.or_else(|| self.shared.discovery.addr_of(id))
    }
}

impl Drop for LanTransport {
    fn drop(&mut self) {
        self.accept_task.abort();
        for link in self.shared.links.lock().values() {
            link.close.notify_one();
        }
    }
}

#[async_trait]
impl PeerTransport for LanTransport {
    fn local_id(&self) -> EndpointId {
        self.shared.keypair.endpoint_id()
    }

    async fn start_advertising(&self) {
        self.shared.discovery.start_advertising();
    }

    async fn stop_advertising(&self) {
        self.shared.discovery.stop_advertising();
    }

    async fn start_discovery(&self) {
        self.shared.discovery.start_discovery();
    }

    async fn stop_discovery(&self) {
        self.shared.discovery.stop_discovery();
    }

    async fn connect(&self, endpoint: EndpointId) {
        if self.shared.links.lock().contains_key(&endpoint) {
            self.shared.emit(TransportEvent::Connected {
                id: endpoint,
                name: self.shared.name_of(&endpoint),
            });
            return;
        }
        let Some(addr) = self.peer_addr(&endpoint) else {
            warn!(endpoint = %endpoint.short(), "connect: no address for endpoint");
            self.shared.endpoint_gone(endpoint);
            return;
        };
        self.shared.emit(TransportEvent::Connecting { id: endpoint });
        debug!(endpoint = %endpoint.short(), %addr, "connecting");
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let attempt = tokio::time::timeout(CONNECT_TIMEOUT, async {
                let mut stream = TcpStream::connect(addr).await?;
                let (peer, key) = handshake_connect(&mut stream, &shared.keypair).await?;
                Ok::<_, io::Error>((stream, peer, key))
            })
            .await;
            match attempt {
                Ok(Ok((stream, peer, key))) if peer == endpoint => {
                    run_connection(stream, peer, key, true, shared).await;
                }
                Ok(Ok((_, peer, _))) => {
                    warn!(expected = %endpoint.short(), got = %peer.short(), "handshake id mismatch");
                    shared.endpoint_gone(endpoint);
                }
                Ok(Err(e)) => {
                    warn!(endpoint = %endpoint.short(), error = %e, "connect failed");
                    shared.endpoint_gone(endpoint);
                }
                Err(_) => {
                    warn!(endpoint = %endpoint.short(), "connect timed out");
                    shared.endpoint_gone(endpoint);
                }
            }
        });
    }

    async fn disconnect(&self, endpoint: EndpointId) {
        let link = self
            .shared
            .links
            .lock()
            .get(&endpoint)
            .map(|l| (l.tx.clone(), l.close.clone()));
        if let Some((tx, close)) = link {
            let _ = tx.try_send(Message::Leave {
                endpoint_id: self.local_id(),
            });
            close.notify_one();
        }
    }

    async fn send_payload(
        &self,
        endpoint: EndpointId,
        identity: &ChunkIdentity,
        path: &Path,
    ) -> Result<TransferJob, TransportError> {
        let (serial, tx) = self
            .shared
            .links
            .lock()
            .get(&endpoint)
            .map(|l| (l.serial, l.tx.clone()))
            .ok_or(TransportError::NotConnected(endpoint))?;
        let total = tokio::fs::metadata(path)
            .await
            .map_err(|source| TransportError::File {
                path: path.to_path_buf(),
                source,
            })?
            .len();

        let job = TransferJob::outbound(identity.clone(), endpoint, total);
        self.shared.emit(TransportEvent::TransferStarted(job.clone()));
        info!(
            video = %identity.video_title,
            part = identity.part_index,
            endpoint = %endpoint.short(),
            transfer = %job.id,
            total,
            "sending part"
        );

        let shared = self.shared.clone();
        let label = PayloadLabel::for_part(identity);
        let path = path.to_path_buf();
        let id = job.id;
        tokio::spawn(async move {
            let terminal = match shared.stream_payload(serial, tx, id, label, &path, total).await {
                Ok(()) => TransferEvent::Succeeded { id },
                Err(error) => {
                    warn!(transfer = %id, error = %error, "send failed");
                    TransferEvent::Failed { id, error }
                }
            };
            shared.emit(TransportEvent::Transfer(terminal));
        });
        Ok(job)
    }

    async fn cleanup(&self) {
        self.stop_discovery().await;
        self.stop_advertising().await;
        let peers: Vec<EndpointId> = self.shared.links.lock().keys().copied().collect();
        for peer in peers {
            self.disconnect(peer).await;
        }
        info!("transport cleaned up");
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        match listener.accept().await {
            Ok((mut stream, addr)) => {
                let shared = shared.clone();
                tokio::spawn(async move {
                    let hs = tokio::time::timeout(
                        CONNECT_TIMEOUT,
                        handshake_accept(&mut stream, &shared.keypair),
                    )
                    .await;
                    match hs {
                        Ok(Ok((peer, key))) => run_connection(stream, peer, key, false, shared).await,
                        Ok(Err(e)) => debug!(%addr, error = %e, "inbound handshake failed"),
                        Err(_) => debug!(%addr, "inbound handshake timed out"),
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

fn invalid<E>(e: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, e)
}

fn handshake_bytes(keypair: &Keypair, salt: &[u8; LINK_SALT_LEN]) -> [u8; HANDSHAKE_SIZE] {
    let mut out = [0u8; HANDSHAKE_SIZE];
    out[0] = PROTOCOL_VERSION;
    out[1..17].copy_from_slice(keypair.endpoint_id().as_bytes());
    out[17..49].copy_from_slice(keypair.public_key().as_bytes());
    out[49..].copy_from_slice(salt);
    out
}

/// What the far side said in its handshake, with the X25519 agreement already done.
struct PeerHello {
    id: EndpointId,
    secret: [u8; 32],
    salt: [u8; LINK_SALT_LEN],
}

/// Parse the peer's handshake. The id must match the key.
fn parse_handshake(buf: &[u8; HANDSHAKE_SIZE], keypair: &Keypair) -> io::Result<PeerHello> {
    if buf[0] != PROTOCOL_VERSION {
        return Err(invalid("unsupported protocol version"));
    }
    let mut id = [0u8; 16];
    id.copy_from_slice(&buf[1..17]);
    let mut public_key = [0u8; 32];
    public_key.copy_from_slice(&buf[17..49]);
    let mut salt = [0u8; LINK_SALT_LEN];
    salt.copy_from_slice(&buf[49..]);
    let peer = EndpointId::from_bytes(id);
    if EndpointId::from_public_key(&public_key) != peer {
        return Err(invalid("endpoint id does not match public key"));
    }
    Ok(PeerHello {
        id: peer,
        secret: keypair.shared_secret(&PublicKey::from_bytes(public_key)),
        salt,
    })
}

async fn handshake_accept(stream: &mut TcpStream, keypair: &Keypair) -> io::Result<(EndpointId, [u8; 32])> {
    let mut buf = [0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut buf).await?;
    let hello = parse_handshake(&buf, keypair)?;
    let salt = link_salt();
    stream.write_all(&handshake_bytes(keypair, &salt)).await?;
    stream.flush().await?;
    Ok((hello.id, derive_session_key(&hello.secret, &hello.salt, &salt)))
}

async fn handshake_connect(stream: &mut TcpStream, keypair: &Keypair) -> io::Result<(EndpointId, [u8; 32])> {
    let salt = link_salt();
    stream.write_all(&handshake_bytes(keypair, &salt)).await?;
    stream.flush().await?;
    let mut buf = [0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut buf).await?;
    let hello = parse_handshake(&buf, keypair)?;
    Ok((hello.id, derive_session_key(&hello.secret, &salt, &hello.salt)))
}

async fn write_message(writer: &mut OwnedWriteHalf, sealer: &mut Sealer, msg: &Message) -> io::Result<()> {
    let plain = encode_frame(msg).map_err(invalid)?;
    let cipher = sealer.seal(&plain).map_err(invalid)?;
    writer.write_all(&(cipher.len() as u32).to_le_bytes()).await?;
    writer.write_all(&cipher).await?;
    writer.flush().await
}

async fn read_message(reader: &mut OwnedReadHalf, opener: &mut Opener) -> io::Result<Message> {
    let mut len_buf = [0u8; LEN_SIZE];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_CIPHER_LEN {
        return Err(invalid("frame too large"));
    }
    let mut cipher = vec![0u8; len];
    reader.read_exact(&mut cipher).await?;
    let plain = opener.open(&cipher).map_err(invalid)?;
    let (msg, used) = decode_frame(&plain).map_err(invalid)?;
    if used != plain.len() {
        return Err(invalid("trailing bytes after frame"));
    }
    Ok(msg)
}

async fn run_connection(
    stream: TcpStream,
    peer: EndpointId,
    key: [u8; 32],
    initiated_by_me: bool,
    shared: Arc<Shared>,
) {
    let (tx, mut rx) = mpsc::channel::<Message>(LINK_QUEUE);
    let close = Arc::new(Notify::new());
    let serial = shared.next_serial.fetch_add(1, Ordering::Relaxed);
    let link = Link {
        serial,
        initiated_by_me,
        tx: tx.clone(),
        close: close.clone(),
    };
    if !shared.install_link(peer, link) {
        debug!(endpoint = %peer.short(), "duplicate link dropped");
        return;
    }
    let name = shared.name_of(&peer);
    info!(endpoint = %peer.short(), name = ?name, outbound = initiated_by_me, "connected");
    shared.emit(TransportEvent::Connected { id: peer, name });

    let (mut sealer, mut opener) = link_ciphers(&key, initiated_by_me);
    let (mut reader, mut writer) = stream.into_split();
    let writer_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = write_message(&mut writer, &mut sealer, &msg).await {
                debug!(error = %e, "link write failed");
                break;
            }
        }
    });
    let heartbeat_tx = tx.clone();
    let me = shared.keypair.endpoint_id();
    let heartbeat_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if heartbeat_tx.send(Message::Heartbeat { endpoint_id: me }).await.is_err() {
                break;
            }
        }
    });

    let mut inbound: HashMap<TransferId, Inbound> = HashMap::new();
    loop {
        let next = tokio::select! {
            _ = close.notified() => {
                debug!(endpoint = %peer.short(), "link closed locally");
                break;
            }
            r = tokio::time::timeout(IDLE_TIMEOUT, read_message(&mut reader, &mut opener)) => r,
        };
        let msg = match next {
            Ok(Ok(msg)) => msg,
            Ok(Err(e)) => {
                debug!(endpoint = %peer.short(), error = %e, "link read ended");
                break;
            }
            Err(_) => {
                info!(endpoint = %peer.short(), "link silent, closing");
                break;
            }
        };
        if !shared.on_message(peer, msg, &tx, &mut inbound).await {
            break;
        }
        // Heartbeats keep this running on a quiet link.
        shared.sweep_stalled(peer, &tx, &mut inbound, Instant::now()).await;
    }
    writer_task.abort();
    heartbeat_task.abort();
    shared.teardown(peer, serial, inbound).await;
}

async fn hash_file(path: &Path) -> io::Result<[u8; 32]> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = PayloadHasher::new();
    let mut buf = vec![0u8; PAYLOAD_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

/// AlreadyHave means the receiver is where we wanted it to be.
fn ack_outcome(outcome: Result<(), RejectReason>) -> Result<(), JobError> {
    match outcome {
        Ok(()) | Err(RejectReason::AlreadyHave) => Ok(()),
        Err(reason) => Err(JobError::new(
            ErrorKind::Rejected,
            format!("receiver refused: {:?}", reason),
        )),
    }
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// Consumers drop a disconnected endpoint; discovery reports it again if it still beacons.
    fn endpoint_gone(&self, id: EndpointId) {
        self.discovery.rediscover(&id);
        self.emit(TransportEvent::Disconnected { id });
    }

    fn name_of(&self, id: &EndpointId) -> Option<String> {
        let known = self.known.lock().get(id).map(|(name, _)| name.clone());
        known.or_else(|| self.discovery.name_of(id))
    }

    /// Simultaneous connects: both sides keep the link opened by the lower endpoint id.
    fn install_link(&self, peer: EndpointId, link: Link) -> bool {
        let mut links = self.links.lock();
        if let Some(existing) = links.get(&peer) {
            let lower_initiates = self.keypair.endpoint_id() < peer;
            if link.initiated_by_me != lower_initiates {
                return false;
            }
            existing.close.notify_one();
        }
        links.insert(peer, link);
        true
    }

    async fn teardown(&self, peer: EndpointId, serial: u64, mut inbound: HashMap<TransferId, Inbound>) {
        for (id, state) in inbound.drain() {
            drop(state.file);
            let _ = tokio::fs::remove_file(&state.path).await;
            self.emit(TransportEvent::Transfer(TransferEvent::Failed {
                id,
                error: JobError::new(ErrorKind::PeerDisconnected, "link lost mid-transfer"),
            }));
        }
        // Dropping the ack senders fails the outbound sends that used this link.
        self.acks.lock().retain(|_, (s, _)| *s != serial);
        let removed = {
            let mut links = self.links.lock();
            if links.get(&peer).map(|l| l.serial) == Some(serial) {
                links.remove(&peer);
                true
            } else {
                false
            }
        };
        if removed {
            info!(endpoint = %peer.short(), "disconnected");
            self.endpoint_gone(peer);
        }
    }

    /// Returns false when the link should close.
    async fn on_message(
        &self,
        peer: EndpointId,
        msg: Message,
        tx: &mpsc::Sender<Message>,
        inbound: &mut HashMap<TransferId, Inbound>,
    ) -> bool {
        match msg {
            Message::Heartbeat { .. } => {}
            Message::Leave { .. } => {
                info!(endpoint = %peer.short(), "endpoint left");
                return false;
            }
            Message::PayloadStart(offer) => self.on_payload_start(peer, offer, tx, inbound).await,
            Message::PayloadChunk {
                transfer_id,
                offset,
                bytes,
            } => {
                self.on_payload_chunk(peer, transfer_id, offset, bytes, tx, inbound)
                    .await
            }
            Message::PayloadEnd { transfer_id } => {
                self.on_payload_end(peer, transfer_id, tx, inbound).await
            }
            Message::PayloadAccepted { transfer_id } => self.resolve_ack(transfer_id, Ok(())),
            Message::PayloadRejected {
                transfer_id,
                reason,
            } => self.resolve_ack(transfer_id, Err(reason)),
            Message::Beacon { .. } | Message::DiscoveryResponse { .. } => {
                debug!(endpoint = %peer.short(), "discovery message on a link, ignored");
            }
        }
        true
    }

    fn resolve_ack(&self, transfer_id: TransferId, outcome: Result<(), RejectReason>) {
        match self.acks.lock().remove(&transfer_id) {
            Some((_, ack)) => {
                let _ = ack.send(outcome);
            }
            None => debug!(transfer = %transfer_id, "verdict for unknown transfer"),
        }
    }

    async fn reply(&self, tx: &mpsc::Sender<Message>, msg: Message) {
        if tx.send(msg).await.is_err() {
            debug!("reply dropped, link closing");
        }
    }

    async fn on_payload_start(
        &self,
        peer: EndpointId,
        offer: PayloadOffer,
        tx: &mpsc::Sender<Message>,
        inbound: &mut HashMap<TransferId, Inbound>,
    ) {
        let id = offer.transfer_id;
        if inbound.contains_key(&id) {
            self.reply(tx, Message::PayloadRejected { transfer_id: id, reason: RejectReason::Protocol })
                .await;
            return;
        }
        let path = match self.policy.admit(peer, &offer) {
            Ok(path) => path,
            Err(reason) => {
                info!(endpoint = %peer.short(), transfer = %id, reason = ?reason, "payload refused");
                self.reply(tx, Message::PayloadRejected { transfer_id: id, reason })
                    .await;
                return;
            }
        };
        let file = match tokio::fs::File::create(&path).await {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot stage inbound payload");
                self.policy.finished(id);
                self.reply(tx, Message::PayloadRejected { transfer_id: id, reason: RejectReason::Storage })
                    .await;
                return;
            }
        };
        let identity = offer.label.identity();
        info!(
            endpoint = %peer.short(),
            transfer = %id,
            part = ?identity,
            total = offer.total_bytes,
            "receiving payload"
        );
        self.emit(TransportEvent::TransferStarted(TransferJob::inbound(
            id,
            identity,
            peer,
            offer.total_bytes,
        )));
        inbound.insert(
            id,
            Inbound {
                meter: PercentMeter::new(Some(offer.total_bytes)),
                offer,
                path,
                file,
                hasher: PayloadHasher::new(),
                last_activity: Instant::now(),
            },
        );
    }

    async fn on_payload_chunk(
        &self,
        peer: EndpointId,
        id: TransferId,
        offset: u64,
        bytes: Vec<u8>,
        tx: &mpsc::Sender<Message>,
        inbound: &mut HashMap<TransferId, Inbound>,
    ) {
        let Some(state) = inbound.get_mut(&id) else {
            debug!(transfer = %id, "chunk for unknown transfer");
            return;
        };
        let received = state.hasher.len();
        let failure = if offset != received {
            Some((
                RejectReason::Protocol,
                JobError::new(
                    ErrorKind::Integrity,
                    format!("chunk at offset {}, expected {}", offset, received),
                ),
            ))
        } else if received + bytes.len() as u64 > state.offer.total_bytes {
            Some((
                RejectReason::Protocol,
                JobError::new(ErrorKind::Integrity, "payload longer than announced"),
            ))
        } else if let Err(e) = state.file.write_all(&bytes).await {
            Some((
                RejectReason::Storage,
                JobError::new(ErrorKind::Storage, e.to_string()),
            ))
        } else {
            None
        };
        if let Some((reason, error)) = failure {
            if let Some(state) = inbound.remove(&id) {
                self.fail_inbound(peer, id, state, reason, error, tx).await;
            }
            return;
        }
        state.hasher.update(&bytes);
        state.last_activity = Instant::now();
        if state.meter.advance(bytes.len() as u64).is_some() {
            self.emit(TransportEvent::Transfer(TransferEvent::Progress {
                id,
                bytes_transferred: state.hasher.len(),
                total_bytes: Some(state.offer.total_bytes),
            }));
        }
    }

    async fn on_payload_end(
        &self,
        peer: EndpointId,
        id: TransferId,
        tx: &mpsc::Sender<Message>,
        inbound: &mut HashMap<TransferId, Inbound>,
    ) {
        let Some(mut state) = inbound.remove(&id) else {
            debug!(transfer = %id, "end for unknown transfer");
            return;
        };
        if let Err(e) = state.file.flush().await {
            let error = JobError::new(ErrorKind::Storage, e.to_string());
            self.fail_inbound(peer, id, state, RejectReason::Storage, error, tx)
                .await;
            return;
        }
        if !state
            .hasher
            .clone()
            .verify(state.offer.total_bytes, &state.offer.sha256)
        {
            self.policy.integrity_failed(peer);
            let error = JobError::new(ErrorKind::Integrity, "payload hash or length mismatch");
            self.fail_inbound(peer, id, state, RejectReason::IntegrityFailed, error, tx)
                .await;
            return;
        }
        let Inbound {
            offer,
            path,
            file,
            hasher,
            ..
        } = state;
        drop(file);
        let size = hasher.len();
        self.reply(tx, Message::PayloadAccepted { transfer_id: id }).await;
        info!(endpoint = %peer.short(), transfer = %id, size, "payload verified");
        self.emit(TransportEvent::InboundCompleted {
            transfer_id: id,
            from: peer,
            label: offer.label,
            path,
            size,
        });
    }

    async fn fail_inbound(
        &self,
        peer: EndpointId,
        id: TransferId,
        state: Inbound,
        reason: RejectReason,
        error: JobError,
        tx: &mpsc::Sender<Message>,
    ) {
        warn!(endpoint = %peer.short(), transfer = %id, error = %error, "inbound payload failed");
        drop(state.file);
        let _ = tokio::fs::remove_file(&state.path).await;
        self.reply(tx, Message::PayloadRejected { transfer_id: id, reason })
            .await;
        self.emit(TransportEvent::Transfer(TransferEvent::Failed { id, error }));
    }

    /// Fail inbound payloads whose sender stopped short of `PayloadEnd`.
    async fn sweep_stalled(
        &self,
        peer: EndpointId,
        tx: &mpsc::Sender<Message>,
        inbound: &mut HashMap<TransferId, Inbound>,
        now: Instant,
    ) {
        let stalled: Vec<TransferId> = inbound
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.last_activity) >= INBOUND_STALL_TIMEOUT)
            .map(|(id, _)| *id)
            .collect();
        for id in stalled {
            if let Some(state) = inbound.remove(&id) {
                let error = JobError::new(ErrorKind::Network, "sender stalled mid-payload");
                self.fail_inbound(peer, id, state, RejectReason::Stalled, error, tx)
                    .await;
            }
        }
    }

    async fn stream_payload(
        &self,
        serial: u64,
        tx: mpsc::Sender<Message>,
        id: TransferId,
        label: PayloadLabel,
        path: &Path,
        total: u64,
    ) -> Result<(), JobError> {
        let storage = |e: io::Error| JobError::new(ErrorKind::Storage, e.to_string());
        let closed = || JobError::new(ErrorKind::PeerDisconnected, "link closed");

        let sha256 = hash_file(path).await.map_err(storage)?;
        let (ack_tx, mut ack_rx) = oneshot::channel();
        self.acks.lock().insert(id, (serial, ack_tx));

        let result = async {
            tx.send(Message::PayloadStart(PayloadOffer {
                transfer_id: id,
                label,
                total_bytes: total,
                sha256,
            }))
            .await
            .map_err(|_| closed())?;

            let mut file = tokio::fs::File::open(path).await.map_err(storage)?;
            let mut buf = vec![0u8; PAYLOAD_CHUNK_SIZE];
            let mut offset: u64 = 0;
            let mut meter = PercentMeter::new(Some(total));
            loop {
                match ack_rx.try_recv() {
                    Ok(outcome) => return ack_outcome(outcome),
                    Err(oneshot::error::TryRecvError::Closed) => return Err(closed()),
                    Err(oneshot::error::TryRecvError::Empty) => {}
                }
                let n = file.read(&mut buf).await.map_err(storage)?;
                if n == 0 {
                    break;
                }
                tx.send(Message::PayloadChunk {
                    transfer_id: id,
                    offset,
                    bytes: buf[..n].to_vec(),
                })
                .await
                .map_err(|_| closed())?;
                offset += n as u64;
                if meter.advance(n as u64).is_some() {
                    self.emit(TransportEvent::Transfer(TransferEvent::Progress {
                        id,
                        bytes_transferred: offset,
                        total_bytes: Some(total),
                    }));
                }
            }
            tx.send(Message::PayloadEnd { transfer_id: id })
                .await
                .map_err(|_| closed())?;

            match tokio::time::timeout(ACK_TIMEOUT, &mut ack_rx).await {
                Ok(Ok(outcome)) => ack_outcome(outcome),
                Ok(Err(_)) => Err(closed()),
                Err(_) => Err(JobError::new(ErrorKind::Network, "no verdict from receiver")),
            }
        }
        .await;
        self.acks.lock().remove(&id);
        result
    }
}
