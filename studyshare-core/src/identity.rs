//! Who we are on the LAN (X25519 keypair, endpoint id) and how a link's frames are sealed.

use std::fmt;
use std::str::FromStr;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// X25519 public key of an endpoint, as carried in beacons and the link handshake.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "fixed_bytes")] [u8; 32]);

/// Fixed-size arrays as length-checked byte sequences.
mod fixed_bytes {
    use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(v: &[u8; N], s: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(d: D) -> Result<[u8; N], D::Error> {
        let bytes = Vec::<u8>::deserialize(d)?;
        let got = bytes.len();
        bytes
            .try_into()
            .map_err(|_| de::Error::invalid_length(got, &"a fixed-size byte array"))
    }
}

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }
}

/// Endpoint identifier: the first 16 bytes of SHA-256 over the public key.
/// Shown as 32 lowercase hex characters.
#[derive(Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointId(#[serde(with = "fixed_bytes")] [u8; 16]);

impl EndpointId {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        EndpointId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn from_public_key(public: &[u8; 32]) -> Self {
        let digest = Sha256::digest(public);
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        EndpointId(id)
    }

    /// First 8 hex characters, for logs.
    pub fn short(&self) -> String {
        let mut s = self.to_string();
        s.truncate(8);
        s
    }

    /// Case-insensitive hex prefix match (operator-typed ids).
    pub fn matches_prefix(&self, prefix: &str) -> bool {
        !prefix.is_empty() && self.to_string().starts_with(&prefix.to_ascii_lowercase())
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EndpointId({})", self.short())
    }
}

impl FromStr for EndpointId {
    type Err = ParseEndpointIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 || !s.is_ascii() {
            return Err(ParseEndpointIdError);
        }
        let mut out = [0u8; 16];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).map_err(|_| ParseEndpointIdError)?;
        }
        Ok(EndpointId(out))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("endpoint id must be 32 hex characters")]
pub struct ParseEndpointIdError;

/// This device's identity for the lifetime of the process.
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
    endpoint_id: EndpointId,
}

impl Keypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        let endpoint_id = EndpointId::from_public_key(&public.0);
        Self {
            secret,
            public,
            endpoint_id,
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn endpoint_id(&self) -> EndpointId {
        self.endpoint_id
    }

    /// X25519 agreement with a peer; feed the result to [`derive_session_key`].
    pub fn shared_secret(&self, peer: &PublicKey) -> [u8; 32] {
        self.secret
            .diffie_hellman(&X25519PublicKey::from(peer.0))
            .to_bytes()
    }
}

/// Random bytes each side contributes to a link's key.
pub const LINK_SALT_LEN: usize = 16;

pub fn link_salt() -> [u8; LINK_SALT_LEN] {
    let mut salt = [0u8; LINK_SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Key for one link between an endpoint pair. Both sides derive the same value, and the salts
/// make it differ on every reconnect, so the counter nonces below never repeat under one key.
pub fn derive_session_key(
    shared_secret: &[u8; 32],
    dialer_salt: &[u8; LINK_SALT_LEN],
    listener_salt: &[u8; LINK_SALT_LEN],
) -> [u8; 32] {
    Sha256::new()
        .chain_update(b"studyshare-link-v2")
        .chain_update(shared_secret)
        .chain_update(dialer_salt)
        .chain_update(listener_salt)
        .finalize()
        .into()
}

/// Nonces from the dialing side carry this bit, so the two directions never collide under
/// the shared link key.
const DIALER_LANE: u64 = 1 << 63;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireCryptoError {
    #[error("frame failed authentication")]
    Open,
    #[error("frame could not be sealed")]
    Seal,
    #[error("nonce space exhausted, reconnect")]
    Exhausted,
}

/// Counter nonce within one direction's lane.
#[derive(Debug)]
struct NonceLane {
    lane: u64,
    next: u64,
}

impl NonceLane {
    fn advance(&mut self) -> Result<Nonce, WireCryptoError> {
        if self.next >= DIALER_LANE {
            return Err(WireCryptoError::Exhausted);
        }
        let mut bytes = [0u8; 12];
        bytes[4..].copy_from_slice(&(self.lane | self.next).to_le_bytes());
        self.next += 1;
        Ok(Nonce::from(bytes))
    }
}

/// Outgoing half of a link.
pub struct Sealer {
    cipher: ChaCha20Poly1305,
    nonce: NonceLane,
}

impl Sealer {
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, WireCryptoError> {
        let nonce = self.nonce.advance()?;
        self.cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| WireCryptoError::Seal)
    }
}

/// Incoming half of a link. Frames must be opened in the order they were sealed.
pub struct Opener {
    cipher: ChaCha20Poly1305,
    nonce: NonceLane,
}

impl Opener {
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, WireCryptoError> {
        let nonce = self.nonce.advance()?;
        self.cipher
            .decrypt(&nonce, ciphertext)
            .map_err(|_| WireCryptoError::Open)
    }
}

/// Both halves of a link under `key`. `dialer` is true on the side that opened the connection.
pub fn link_ciphers(key: &[u8; 32], dialer: bool) -> (Sealer, Opener) {
    let (send_lane, recv_lane) = if dialer { (DIALER_LANE, 0) } else { (0, DIALER_LANE) };
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    (
        Sealer {
            cipher: cipher.clone(),
            nonce: NonceLane { lane: send_lane, next: 0 },
        },
        Opener {
            cipher,
            nonce: NonceLane { lane: recv_lane, next: 0 },
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_endpoint_id_derivation() {
        let kp = Keypair::generate();
        let id = EndpointId::from_public_key(kp.public_key().as_bytes());
        assert_eq!(id, kp.endpoint_id());
    }

    #[test]
    fn key_exchange_symmetric() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let secret_a = a.shared_secret(b.public_key());
        let secret_b = b.shared_secret(a.public_key());
        let (dial, listen) = (link_salt(), link_salt());
        assert_eq!(
            derive_session_key(&secret_a, &dial, &listen),
            derive_session_key(&secret_b, &dial, &listen)
        );
    }

    #[test]
    fn reconnecting_pair_gets_a_fresh_key_stream() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let secret = a.shared_secret(b.public_key());
        let first = derive_session_key(&secret, &link_salt(), &link_salt());
        let second = derive_session_key(&secret, &link_salt(), &link_salt());
        assert_ne!(first, second);

        // Same position in both links, different plaintexts: the ciphertext xor must not
        // leak the plaintext xor.
        let (p1, p2) = (b"part_0.mp4 chunk", b"part_1.mp4 chunk");
        let c1 = link_ciphers(&first, true).0.seal(p1).unwrap();
        let c2 = link_ciphers(&second, true).0.seal(p2).unwrap();
        let cipher_xor: Vec<u8> = c1.iter().zip(&c2).take(p1.len()).map(|(x, y)| x ^ y).collect();
        let plain_xor: Vec<u8> = p1.iter().zip(p2).map(|(x, y)| x ^ y).collect();
        assert_ne!(cipher_xor, plain_xor);
    }

    #[test]
    fn dialer_and_listener_understand_each_other() {
        let key = [7u8; 32];
        let (mut dial_seal, mut dial_open) = link_ciphers(&key, true);
        let (mut listen_seal, mut listen_open) = link_ciphers(&key, false);

        for frame in [&b"part_0.mp4 bytes"[..], b"", b"heartbeat"] {
            let sealed = dial_seal.seal(frame).unwrap();
            assert_eq!(listen_open.open(&sealed).unwrap(), frame);
        }
        let reply = listen_seal.seal(b"accepted").unwrap();
        assert_eq!(dial_open.open(&reply).unwrap(), b"accepted");
    }

    #[test]
    fn directions_never_share_a_nonce() {
        let key = [9u8; 32];
        let (mut dial_seal, _) = link_ciphers(&key, true);
        let (mut listen_seal, _) = link_ciphers(&key, false);
        assert_ne!(dial_seal.seal(b"same").unwrap(), listen_seal.seal(b"same").unwrap());
    }

    #[test]
    fn out_of_order_or_replayed_frames_fail() {
        let key = [3u8; 32];
        let (mut seal, _) = link_ciphers(&key, true);
        let (_, mut open) = link_ciphers(&key, false);
        let first = seal.seal(b"one").unwrap();
        let second = seal.seal(b"two").unwrap();
        assert_eq!(open.open(&second), Err(WireCryptoError::Open));
        // The failed frame consumed its nonce; the stream is now unusable, as on a real link.
        assert_eq!(open.open(&first), Err(WireCryptoError::Open));
    }

    #[test]
    fn lane_refuses_to_wrap() {
        let mut lane = NonceLane {
            lane: DIALER_LANE,
            next: DIALER_LANE - 1,
        };
        assert!(lane.advance().is_ok());
        assert_eq!(lane.advance(), Err(WireCryptoError::Exhausted));
    }

    #[test]
    fn endpoint_id_hex_parse_and_prefix() {
        let id = Keypair::generate().endpoint_id();
        let text = id.to_string();
        assert_eq!(text.len(), 32);
        let parsed: EndpointId = text.parse().unwrap();
        assert_eq!(parsed, id);
        assert!(id.matches_prefix(&text[..6].to_ascii_uppercase()));
        assert!(!id.matches_prefix(""));
        assert!("not-hex".parse::<EndpointId>().is_err());
    }
}
