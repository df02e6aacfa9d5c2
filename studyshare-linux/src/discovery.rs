//! LAN discovery: UDP multicast beacons, parse beacons/responses, maintain the endpoint list.
//! Advertising (sending beacons) and discovering (processing them) switch independently.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use studyshare_core::protocol::SERVICE_ID;
use studyshare_core::wire::{decode_frame, encode_frame};
use studyshare_core::{Capability, EndpointId, Keypair, Message, PROTOCOL_VERSION};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::TransportEvent;

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 60);
const BEACON_INTERVAL: Duration = Duration::from_secs(4);
const PEER_TIMEOUT: Duration = Duration::from_secs(16);

struct PeerState {
    name: String,
    addr: SocketAddr,
    last_seen: Instant,
    /// `EndpointFound` went out and still stands.
    announced: bool,
}

struct Inner {
    keypair: Arc<Keypair>,
    display_name: String,
    discovery_port: u16,
    listen_port: u16,
    advertising: AtomicBool,
    discovering: AtomicBool,
    peers: Mutex<HashMap<EndpointId, PeerState>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

pub struct Discovery {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Discovery {
    pub fn new(
        keypair: Arc<Keypair>,
        display_name: String,
        discovery_port: u16,
        listen_port: u16,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                keypair,
                display_name,
                discovery_port,
                listen_port,
                advertising: AtomicBool::new(false),
                discovering: AtomicBool::new(false),
                peers: Mutex::new(HashMap::new()),
                events,
            }),
            task: Mutex::new(None),
        }
    }

    pub fn start_advertising(&self) {
        self.enable(Capability::Advertise);
    }

    pub fn start_discovery(&self) {
        self.enable(Capability::Discover);
    }

    pub fn stop_advertising(&self) {
        if self.inner.advertising.swap(false, Ordering::SeqCst) {
            info!("advertising stopped");
        }
        self.inner.emit(TransportEvent::AdvertisingChanged(false));
        self.stop_if_idle();
    }

    /// Stops processing beacons and forgets every discovered endpoint.
    pub fn stop_discovery(&self) {
        if self.inner.discovering.swap(false, Ordering::SeqCst) {
            info!("discovery stopped");
        }
        let gone: Vec<EndpointId> = self.inner.peers.lock().drain().map(|(id, _)| id).collect();
        for id in gone {
            self.inner.emit(TransportEvent::EndpointLost { id });
        }
        self.inner.emit(TransportEvent::DiscoveringChanged(false));
        self.stop_if_idle();
    }

    pub fn addr_of(&self, id: &EndpointId) -> Option<SocketAddr> {
        self.inner.peers.lock().get(id).map(|p| p.addr)
    }

    pub fn name_of(&self, id: &EndpointId) -> Option<String> {
        self.inner.peers.lock().get(id).map(|p| p.name.clone())
    }

    /// The endpoint's link ended and consumers dropped it. Its next beacon reports it as found
    /// again; the address stays usable meanwhile.
    pub fn rediscover(&self, id: &EndpointId) {
        if let Some(peer) = self.inner.peers.lock().get_mut(id) {
            peer.announced = false;
        }
    }

    /// Fail-soft: a socket that cannot be opened surfaces as an event, never as an error.
    fn enable(&self, capability: Capability) {
        if let Err(e) = self.ensure_running() {
            if e.kind() == io::ErrorKind::PermissionDenied {
                warn!(capability = ?capability, error = %e, "permission denied");
                self.inner.emit(TransportEvent::PermissionDenied(capability));
            } else {
                warn!(capability = ?capability, error = %e, "could not open discovery socket");
            }
            return;
        }
        match capability {
            Capability::Advertise => {
                self.inner.advertising.store(true, Ordering::SeqCst);
                info!(name = %self.inner.display_name, "advertising started");
                self.inner.emit(TransportEvent::AdvertisingChanged(true));
            }
            Capability::Discover => {
                self.inner.discovering.store(true, Ordering::SeqCst);
                info!("discovery started");
                self.inner.emit(TransportEvent::DiscoveringChanged(true));
            }
            Capability::Connect => {}
        }
    }

    fn ensure_running(&self) -> io::Result<()> {
        let mut task = self.task.lock();
        if task.is_some() {
            return Ok(());
        }
        let socket = make_multicast_socket(self.inner.discovery_port)?;
        let inner = self.inner.clone();
        *task = Some(tokio::spawn(async move { inner.run(socket).await }));
        Ok(())
    }

    fn stop_if_idle(&self) {
        if self.inner.advertising.load(Ordering::SeqCst) || self.inner.discovering.load(Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
            debug!("discovery socket closed");
        }
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

fn make_multicast_socket(discovery_port: u16) -> io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

impl Inner {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    async fn run(self: Arc<Self>, socket: UdpSocket) {
        let dest = SocketAddr::new(MULTICAST_GROUP.into(), self.discovery_port);
        let mut beacon_tick = tokio::time::interval(BEACON_INTERVAL);
        let mut expiry_tick = tokio::time::interval(BEACON_INTERVAL);
        let mut buf = vec![0u8; 65536];
        loop {
            tokio::select! {
                _ = beacon_tick.tick() => {
                    let frame = self
                        .advertising
                        .load(Ordering::SeqCst)
                        .then(|| self.announcement(true))
                        .flatten();
                    if let Some(frame) = frame {
                        if let Err(e) = socket.send_to(&frame, dest).await {
                            debug!(error = %e, "beacon send failed");
                        }
                    }
                }
                _ = expiry_tick.tick() => {
                    self.expire(Instant::now());
                }
                r = socket.recv_from(&mut buf) => match r {
                    Ok((n, from)) => {
                        if let Some(reply) = self.on_datagram(&buf[..n], from) {
                            let _ = socket.send_to(&reply, from).await;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "discovery socket failed");
                        return;
                    }
                },
            }
        }
    }

    /// Our beacon (multicast) or discovery response (unicast reply to a beacon).
    fn announcement(&self, beacon: bool) -> Option<Vec<u8>> {
        let endpoint_id = self.keypair.endpoint_id();
        let public_key = self.keypair.public_key().clone();
        let display_name = self.display_name.clone();
        let msg = if beacon {
            Message::Beacon {
                protocol_version: PROTOCOL_VERSION,
                service_id: SERVICE_ID.to_string(),
                endpoint_id,
                public_key,
                display_name,
                listen_port: self.listen_port,
            }
        } else {
            Message::DiscoveryResponse {
                protocol_version: PROTOCOL_VERSION,
                service_id: SERVICE_ID.to_string(),
                endpoint_id,
                public_key,
                display_name,
                listen_port: self.listen_port,
            }
        };
        encode_frame(&msg).ok()
    }

    /// Handle one datagram. Returns a reply to send back to `from`, if any.
    fn on_datagram(&self, bytes: &[u8], from: SocketAddr) -> Option<Vec<u8>> {
        let (msg, _) = decode_frame(bytes).ok()?;
        let is_beacon = matches!(msg, Message::Beacon { .. });
        let (protocol_version, service_id, endpoint_id, public_key, display_name, listen_port) =
            match msg {
                Message::Beacon {
                    protocol_version,
                    service_id,
                    endpoint_id,
                    public_key,
                    display_name,
                    listen_port,
                }
                | Message::DiscoveryResponse {
                    protocol_version,
                    service_id,
                    endpoint_id,
                    public_key,
                    display_name,
                    listen_port,
                } => (
                    protocol_version,
                    service_id,
                    endpoint_id,
                    public_key,
                    display_name,
                    listen_port,
                ),
                _ => return None,
            };
        if protocol_version != PROTOCOL_VERSION || service_id != SERVICE_ID {
            return None;
        }
        if endpoint_id == self.keypair.endpoint_id()
            || EndpointId::from_public_key(public_key.as_bytes()) != endpoint_id
        {
            return None;
        }
        if self.discovering.load(Ordering::SeqCst) {
            self.note_peer(endpoint_id, display_name, SocketAddr::new(from.ip(), listen_port));
        }
        if is_beacon && self.advertising.load(Ordering::SeqCst) {
            self.announcement(false)
        } else {
            None
        }
    }

    fn note_peer(&self, id: EndpointId, name: String, addr: SocketAddr) {
        let announce = {
            let mut peers = self.peers.lock();
            let announce = peers.get(&id).map_or(true, |p| !p.announced);
            peers.insert(
                id,
                PeerState {
                    name: name.clone(),
                    addr,
                    last_seen: Instant::now(),
                    announced: true,
                },
            );
            announce
        };
        if announce {
            info!(endpoint = %id.short(), name = %name, %addr, "endpoint found");
            self.emit(TransportEvent::EndpointFound { id, name });
        }
    }

    fn expire(&self, now: Instant) -> Vec<EndpointId> {
        let gone: Vec<EndpointId> = {
            let mut peers = self.peers.lock();
            let list: Vec<EndpointId> = peers
                .iter()
                .filter(|(_, s)| now.duration_since(s.last_seen) >= PEER_TIMEOUT)
                .map(|(id, _)| *id)
                .collect();
            for id in &list {
                peers.remove(id);
            }
            list
        };
        for id in &gone {
            info!(endpoint = %id.short(), "endpoint lost");
            self.emit(TransportEvent::EndpointLost { id: *id });
        }
        gone
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discovery() -> (Discovery, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let d = Discovery::new(Arc::new(Keypair::generate()), "me".into(), 45678, 45679, tx);
        (d, rx)
    }

    fn beacon_from(kp: &Keypair, service_id: &str, version: u8) -> Vec<u8> {
        encode_frame(&Message::Beacon {
            protocol_version: version,
            service_id: service_id.to_string(),
            endpoint_id: kp.endpoint_id(),
            public_key: kp.public_key().clone(),
            display_name: "Tablet".into(),
            listen_port: 5000,
        })
        .unwrap()
    }

    fn from() -> SocketAddr {
        "192.168.1.20:45678".parse().unwrap()
    }

    #[test]
    fn beacon_creates_endpoint_when_discovering() {
        let (d, mut rx) = discovery();
        let other = Keypair::generate();
        d.inner.discovering.store(true, Ordering::SeqCst);

        assert!(d.inner.on_datagram(&beacon_from(&other, SERVICE_ID, PROTOCOL_VERSION), from()).is_none());
        match rx.try_recv().unwrap() {
            TransportEvent::EndpointFound { id, name } => {
                assert_eq!(id, other.endpoint_id());
                assert_eq!(name, "Tablet");
            }
            e => panic!("unexpected {:?}", e),
        }
        assert_eq!(
            d.addr_of(&other.endpoint_id()),
            Some("192.168.1.20:5000".parse().unwrap())
        );

        // A repeat beacon refreshes without a second event.
        d.inner.on_datagram(&beacon_from(&other, SERVICE_ID, PROTOCOL_VERSION), from());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_endpoint_is_found_again_on_its_next_beacon() {
        let (d, mut rx) = discovery();
        let other = Keypair::generate();
        let beacon = beacon_from(&other, SERVICE_ID, PROTOCOL_VERSION);
        d.inner.discovering.store(true, Ordering::SeqCst);
        d.inner.on_datagram(&beacon, from());
        assert!(matches!(rx.try_recv().unwrap(), TransportEvent::EndpointFound { .. }));

        d.rediscover(&other.endpoint_id());
        assert!(d.addr_of(&other.endpoint_id()).is_some());
        d.inner.on_datagram(&beacon, from());
        assert!(matches!(
            rx.try_recv().unwrap(),
            TransportEvent::EndpointFound { id, .. } if id == other.endpoint_id()
        ));
        for _ in 0..3 {
            d.inner.on_datagram(&beacon, from());
        }
        assert!(rx.try_recv().is_err());

        // Unknown ids are ignored.
        d.rediscover(&Keypair::generate().endpoint_id());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn foreign_service_version_and_self_are_ignored() {
        let (d, mut rx) = discovery();
        d.inner.discovering.store(true, Ordering::SeqCst);
        let other = Keypair::generate();
        d.inner.on_datagram(&beacon_from(&other, "com.example.other", PROTOCOL_VERSION), from());
        d.inner.on_datagram(&beacon_from(&other, SERVICE_ID, PROTOCOL_VERSION + 1), from());
        let me = d.inner.keypair.clone();
        d.inner.on_datagram(&beacon_from(&me, SERVICE_ID, PROTOCOL_VERSION), from());
        d.inner.on_datagram(b"garbage", from());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn not_discovering_means_no_endpoints() {
        let (d, mut rx) = discovery();
        let other = Keypair::generate();
        d.inner.on_datagram(&beacon_from(&other, SERVICE_ID, PROTOCOL_VERSION), from());
        assert!(rx.try_recv().is_err());
        assert!(d.addr_of(&other.endpoint_id()).is_none());
    }

    #[test]
    fn replies_to_beacons_only_while_advertising() {
        let (d, _rx) = discovery();
        let other = Keypair::generate();
        let beacon = beacon_from(&other, SERVICE_ID, PROTOCOL_VERSION);
        assert!(d.inner.on_datagram(&beacon, from()).is_none());

        d.inner.advertising.store(true, Ordering::SeqCst);
        let reply = d.inner.on_datagram(&beacon, from()).unwrap();
        let (msg, _) = decode_frame(&reply).unwrap();
        assert!(matches!(
            msg,
            Message::DiscoveryResponse { endpoint_id, listen_port: 45679, .. }
                if endpoint_id == d.inner.keypair.endpoint_id()
        ));
    }

    #[test]
    fn silent_endpoints_expire() {
        let (d, mut rx) = discovery();
        d.inner.discovering.store(true, Ordering::SeqCst);
        let other = Keypair::generate();
        d.inner.on_datagram(&beacon_from(&other, SERVICE_ID, PROTOCOL_VERSION), from());
        let _found = rx.try_recv().unwrap();

        assert!(d.inner.expire(Instant::now()).is_empty());
        let gone = d.inner.expire(Instant::now() + PEER_TIMEOUT);
        assert_eq!(gone, vec![other.endpoint_id()]);
        assert!(matches!(rx.try_recv().unwrap(), TransportEvent::EndpointLost { id } if id == other.endpoint_id()));
    }

    #[test]
    fn stop_discovery_reports_every_endpoint_lost() {
        let (d, mut rx) = discovery();
        d.inner.discovering.store(true, Ordering::SeqCst);
        let other = Keypair::generate();
        d.inner.on_datagram(&beacon_from(&other, SERVICE_ID, PROTOCOL_VERSION), from());
        let _found = rx.try_recv().unwrap();

        d.stop_discovery();
        assert!(matches!(rx.try_recv().unwrap(), TransportEvent::EndpointLost { .. }));
        assert!(matches!(rx.try_recv().unwrap(), TransportEvent::DiscoveringChanged(false)));
    }
}
