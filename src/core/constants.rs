//! Protocol constants.
//!
//! These values are fixed by the protocol or by the session's resource
//! model and are not negotiable at runtime except where noted.

use std::time::Duration;

use super::types::{ByteCount, StreamId};

// =============================================================================
// PACKETS
// =============================================================================

/// Maximum size of an assembled packet, including public header and
/// AEAD overhead. Chosen to stay below common path MTUs.
pub const MAX_PACKET_SIZE: usize = 1350;

/// Overhead reserved for the AEAD seal (the forward-secure tag is the
/// larger of the two protectors).
pub const SEAL_OVERHEAD: usize = 16;

/// Integrity tag size of the null protector used before the handshake
/// completes.
pub const NULL_PROTECTOR_TAG_SIZE: usize = 12;

/// Number of trailing bytes of the packet number carried on the wire by
/// outgoing packets.
pub const PACKET_NUMBER_LEN: u8 = 6;

// =============================================================================
// STREAMS
// =============================================================================

/// The reserved stream carrying handshake messages.
pub const CRYPTO_STREAM_ID: StreamId = 1;

/// Receive-side flow control window granted to every stream.
pub const RECEIVE_STREAM_FLOW_WINDOW: ByteCount = 1 << 20;

/// Send-side flow control window assumed until the peer raises it via
/// WINDOW_UPDATE.
pub const INITIAL_SEND_STREAM_FLOW_WINDOW: ByteCount = 16 * 1024;

// =============================================================================
// TIMING
// =============================================================================

/// Idle connection lifetime assumed before the handshake negotiates one.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on the idle lifetime a peer may request.
pub const MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

// =============================================================================
// RECOVERY & CONGESTION
// =============================================================================

/// Number of times a packet must be reported missing before it is
/// declared lost and queued for retransmission.
pub const RETRANSMISSION_THRESHOLD: u32 = 3;

/// Sender maximum segment size used by the congestion controller.
pub const DEFAULT_MSS: ByteCount = MAX_PACKET_SIZE as ByteCount;

/// Initial congestion window, in packets.
pub const INITIAL_CONGESTION_WINDOW_PACKETS: ByteCount = 10;

/// Hard ceiling on the congestion window, in packets.
pub const MAX_CONGESTION_WINDOW_PACKETS: ByteCount = 200;

/// Floor the congestion window collapses to after loss, in packets.
pub const MIN_CONGESTION_WINDOW_PACKETS: ByteCount = 2;

// =============================================================================
// QUEUES
// =============================================================================

/// Capacity of the per-session ingress queue fed by the demultiplexer.
pub const INGRESS_QUEUE_DEPTH: usize = 1000;

/// Largest number of missing packet numbers reported in a single ACK
/// frame.
pub const MAX_NACKS_PER_ACK: usize = 255;
