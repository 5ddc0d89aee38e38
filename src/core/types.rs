//! Fundamental protocol identifiers and the wire-level error type.

use std::fmt;

use thiserror::Error;

/// Opaque 64-bit connection identifier.
///
/// Assigned by the demultiplexer at accept time; immutable for the life
/// of the session. Also echoed in public reset packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Protocol version accepted at session construction.
///
/// Version negotiation happens before the session exists; the core only
/// carries the agreed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionNumber(pub u32);

/// Per-connection monotonically increasing packet number.
///
/// Transmitted truncated on the wire and reconstructed against the most
/// recently accepted packet number.
pub type PacketNumber = u64;

/// Stream identifier. Peer-initiated streams carry odd ids; stream 1 is
/// the handshake crypto stream.
pub type StreamId = u32;

/// Byte count used for flow control and congestion accounting.
pub type ByteCount = u64;

/// Wire error codes carried in CONNECTION_CLOSE frames and stream
/// terminal errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    /// Internal inconsistency in the endpoint.
    InternalError = 1,
    /// Data arrived for a stream that has already terminated.
    StreamDataAfterTermination = 2,
    /// A frame could not be parsed after decryption.
    InvalidFrameData = 4,
    /// A packet failed authenticated decryption.
    DecryptionFailure = 12,
    /// The peer is shutting the connection down without a specific error.
    PeerGoingAway = 16,
    /// A frame referenced a stream id the receiver will never accept.
    InvalidStreamId = 17,
    /// No network activity within the negotiated idle lifetime.
    NetworkIdleTimeout = 25,
    /// The cryptographic handshake failed.
    HandshakeFailed = 28,
    /// The peer sent more stream data than the advertised window allows.
    FlowControlReceivedTooMuchData = 59,
}

impl ErrorCode {
    /// The numeric value carried on the wire.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Parse a wire value. Unknown codes are preserved as
    /// [`ErrorCode::InternalError`] by callers that need a fallback.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::InternalError),
            2 => Some(Self::StreamDataAfterTermination),
            4 => Some(Self::InvalidFrameData),
            12 => Some(Self::DecryptionFailure),
            16 => Some(Self::PeerGoingAway),
            17 => Some(Self::InvalidStreamId),
            25 => Some(Self::NetworkIdleTimeout),
            28 => Some(Self::HandshakeFailed),
            59 => Some(Self::FlowControlReceivedTooMuchData),
            _ => None,
        }
    }
}

/// A QUIC-level error: a wire error code plus a human-readable reason
/// phrase.
///
/// This is what CONNECTION_CLOSE frames carry, what streams report to
/// blocked readers after termination, and what the close machine keys
/// its public-reset decision on.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{code:?}: {reason}")]
pub struct QuicError {
    /// Wire error code.
    pub code: ErrorCode,
    /// Reason phrase included in the CONNECTION_CLOSE frame.
    pub reason: String,
}

impl QuicError {
    /// Create an error with the given code and reason phrase.
    pub fn new(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}
