//! Handshake glue: server configuration, negotiated connection
//! parameters, and the AEAD provider the packer/unpacker seal and open
//! packets with.
//!
//! The handshake itself is intentionally small: the session only needs
//! an opaque packet protector plus a byte-stream peer on the crypto
//! stream. Before key derivation, packets are protected by an integrity
//! tag only (the null protector); after the hellos have been exchanged,
//! packets are sealed with ChaCha20-Poly1305 under keys derived from the
//! server config and both hello nonces. The server keeps sealing with
//! the null protector until the peer demonstrably owns the derived keys
//! (its first forward-secure packet opens), so the server hello itself
//! is always readable.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use blake2::{Blake2b512, Digest};
use bytes::{BufMut, Bytes, BytesMut};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::core::constants::{DEFAULT_IDLE_TIMEOUT, MAX_IDLE_TIMEOUT, NULL_PROTECTOR_TAG_SIZE};
use crate::core::types::{ErrorCode, PacketNumber, QuicError};
use crate::stream::Stream;

/// Handshake message type bytes on the crypto stream.
mod msg_type {
    /// Client hello: 32-byte nonce + requested idle timeout.
    pub const CLIENT_HELLO: u8 = 0x01;
    /// Server hello: 32-byte nonce.
    pub const SERVER_HELLO: u8 = 0x02;
}

/// Client hello payload: nonce plus requested idle timeout in seconds.
const CLIENT_HELLO_LEN: usize = 32 + 4;
/// Upper bound on any handshake message payload.
const MAX_HELLO_LEN: usize = 1024;

/// Static server-side key material.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ServerConfig {
    key: [u8; 32],
}

impl ServerConfig {
    /// Create a config from existing key material.
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Generate a config with a random key.
    pub fn generate() -> Self {
        Self {
            key: rand::random(),
        }
    }
}

/// Connection parameters negotiated during the handshake.
///
/// Read concurrently by the event loop (idle timer) while the handshake
/// task writes, hence the interior lock.
#[derive(Debug)]
pub struct ConnectionParams {
    idle_timeout: RwLock<Duration>,
}

impl ConnectionParams {
    /// Create parameters with protocol defaults.
    pub fn new() -> Self {
        Self {
            idle_timeout: RwLock::new(DEFAULT_IDLE_TIMEOUT),
        }
    }

    /// The currently negotiated idle connection lifetime.
    pub fn idle_connection_state_lifetime(&self) -> Duration {
        *self
            .idle_timeout
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the peer's requested idle lifetime, clamped to the
    /// protocol maximum.
    pub fn set_idle_timeout(&self, requested: Duration) {
        let clamped = requested.clamp(Duration::from_secs(1), MAX_IDLE_TIMEOUT);
        *self
            .idle_timeout
            .write()
            .unwrap_or_else(PoisonError::into_inner) = clamped;
    }
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self::new()
    }
}

/// Directional packet-protection keys derived by the handshake.
struct DerivedKeys {
    sealer: ChaCha20Poly1305,
    opener: ChaCha20Poly1305,
}

struct ProtectState {
    keys: Option<DerivedKeys>,
    /// Set once the peer's first forward-secure packet opens; from then
    /// on outgoing packets are sealed forward-secure too.
    seal_forward_secure: bool,
}

/// The session's opaque AEAD provider and handshake driver.
pub struct CryptoSetup {
    config: ServerConfig,
    params: Arc<ConnectionParams>,
    state: RwLock<ProtectState>,
}

impl CryptoSetup {
    /// Create a crypto setup in the null-protection phase.
    pub fn new(config: ServerConfig, params: Arc<ConnectionParams>) -> Self {
        Self {
            config,
            params,
            state: RwLock::new(ProtectState {
                keys: None,
                seal_forward_secure: false,
            }),
        }
    }

    /// Seal a packet payload. `associated_data` is the public header as
    /// it appears on the wire.
    pub fn seal(
        &self,
        packet_number: PacketNumber,
        associated_data: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, QuicError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        if state.seal_forward_secure {
            if let Some(keys) = &state.keys {
                return keys
                    .sealer
                    .encrypt(
                        &packet_nonce(packet_number),
                        Payload {
                            msg: plaintext,
                            aad: associated_data,
                        },
                    )
                    .map_err(|_| {
                        QuicError::new(ErrorCode::InternalError, "AEAD encryption failed")
                    });
            }
        }
        Ok(null_seal(associated_data, plaintext))
    }

    /// Open a packet payload, trying the forward-secure keys first and
    /// falling back to the null protector for packets sent before the
    /// peer switched over.
    pub fn open(
        &self,
        packet_number: PacketNumber,
        associated_data: &[u8],
        sealed: &[u8],
    ) -> Result<Vec<u8>, QuicError> {
        let opened_forward_secure = {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            match &state.keys {
                Some(keys) => keys
                    .opener
                    .decrypt(
                        &packet_nonce(packet_number),
                        Payload {
                            msg: sealed,
                            aad: associated_data,
                        },
                    )
                    .ok(),
                None => None,
            }
        };

        if let Some(plaintext) = opened_forward_secure {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if !state.seal_forward_secure {
                debug!("peer switched to forward-secure packets, following");
                state.seal_forward_secure = true;
            }
            return Ok(plaintext);
        }

        null_open(associated_data, sealed)
    }

    /// Whether forward-secure keys have been derived.
    pub fn is_forward_secure(&self) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys
            .is_some()
    }

    /// Drive the handshake exchange on the crypto stream: read the
    /// client hello, answer with the server hello, derive packet keys.
    ///
    /// Spawned once at session construction; a failure here is fatal for
    /// the session.
    pub async fn handle_crypto_stream(&self, stream: &Stream) -> Result<(), QuicError> {
        let (msg_ty, payload) = read_hello(stream).await?;
        if msg_ty != msg_type::CLIENT_HELLO {
            return Err(QuicError::new(
                ErrorCode::HandshakeFailed,
                format!("expected client hello, got message type {:#04x}", msg_ty),
            ));
        }
        if payload.len() < CLIENT_HELLO_LEN {
            return Err(QuicError::new(
                ErrorCode::HandshakeFailed,
                "client hello too short",
            ));
        }

        let mut client_nonce = [0u8; 32];
        client_nonce.copy_from_slice(&payload[..32]);
        let mut idle_secs = [0u8; 4];
        idle_secs.copy_from_slice(&payload[32..36]);
        self.params
            .set_idle_timeout(Duration::from_secs(u32::from_le_bytes(idle_secs) as u64));

        let server_nonce: [u8; 32] = rand::random();
        stream.write(encode_hello(msg_type::SERVER_HELLO, &server_nonce))?;

        let (server_write, client_write) =
            derive_key_material(&self.config.key, &client_nonce, &server_nonce)?;
        self.install_keys(&server_write, &client_write);
        debug!("handshake complete, forward-secure keys derived");
        Ok(())
    }

    pub(crate) fn install_keys(&self, seal_key: &[u8; 32], open_key: &[u8; 32]) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.keys = Some(DerivedKeys {
            sealer: ChaCha20Poly1305::new(Key::from_slice(seal_key)),
            opener: ChaCha20Poly1305::new(Key::from_slice(open_key)),
        });
    }
}

/// Derive the (server-write, client-write) key pair from the config key
/// and both hello nonces.
pub(crate) fn derive_key_material(
    config_key: &[u8; 32],
    client_nonce: &[u8; 32],
    server_nonce: &[u8; 32],
) -> Result<([u8; 32], [u8; 32]), QuicError> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(client_nonce);
    salt[32..].copy_from_slice(server_nonce);

    let hk = Hkdf::<Sha256>::new(Some(&salt), config_key);
    let mut okm = [0u8; 64];
    hk.expand(b"quic-session key expansion", &mut okm)
        .map_err(|_| QuicError::new(ErrorCode::HandshakeFailed, "key derivation failed"))?;

    let mut server_write = [0u8; 32];
    let mut client_write = [0u8; 32];
    server_write.copy_from_slice(&okm[..32]);
    client_write.copy_from_slice(&okm[32..]);
    Ok((server_write, client_write))
}

fn packet_nonce(packet_number: PacketNumber) -> Nonce {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&packet_number.to_le_bytes());
    Nonce::from(nonce)
}

fn null_tag(associated_data: &[u8], payload: &[u8]) -> [u8; NULL_PROTECTOR_TAG_SIZE] {
    let mut hasher = Blake2b512::new();
    hasher.update(associated_data);
    hasher.update(payload);
    let digest = hasher.finalize();
    let mut tag = [0u8; NULL_PROTECTOR_TAG_SIZE];
    tag.copy_from_slice(&digest[..NULL_PROTECTOR_TAG_SIZE]);
    tag
}

fn null_seal(associated_data: &[u8], plaintext: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(plaintext.len() + NULL_PROTECTOR_TAG_SIZE);
    out.extend_from_slice(plaintext);
    out.extend_from_slice(&null_tag(associated_data, plaintext));
    out
}

fn null_open(associated_data: &[u8], sealed: &[u8]) -> Result<Vec<u8>, QuicError> {
    if sealed.len() < NULL_PROTECTOR_TAG_SIZE {
        return Err(QuicError::new(
            ErrorCode::DecryptionFailure,
            "packet too short for integrity tag",
        ));
    }
    let (payload, tag) = sealed.split_at(sealed.len() - NULL_PROTECTOR_TAG_SIZE);
    if tag != null_tag(associated_data, payload) {
        return Err(QuicError::new(
            ErrorCode::DecryptionFailure,
            "packet integrity check failed",
        ));
    }
    Ok(payload.to_vec())
}

fn encode_hello(msg_ty: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(3 + payload.len());
    buf.put_u8(msg_ty);
    buf.put_u16_le(payload.len() as u16);
    buf.put_slice(payload);
    buf.freeze()
}

/// Encode a client hello message. Used by peers (and tests) talking to
/// this server.
pub fn encode_client_hello(client_nonce: &[u8; 32], idle_timeout: Duration) -> Bytes {
    let mut payload = Vec::with_capacity(CLIENT_HELLO_LEN);
    payload.extend_from_slice(client_nonce);
    payload.extend_from_slice(&(idle_timeout.as_secs().min(u32::MAX as u64) as u32).to_le_bytes());
    encode_hello(msg_type::CLIENT_HELLO, &payload)
}

async fn read_hello(stream: &Stream) -> Result<(u8, Bytes), QuicError> {
    let header = stream.read_exact(3).await?;
    let msg_ty = header[0];
    let len = u16::from_le_bytes([header[1], header[2]]) as usize;
    if len > MAX_HELLO_LEN {
        return Err(QuicError::new(
            ErrorCode::HandshakeFailed,
            "handshake message too large",
        ));
    }
    let payload = stream.read_exact(len).await?;
    Ok((msg_ty, payload))
}
