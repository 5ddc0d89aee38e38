//! Error taxonomy for the frame dispatcher and the event loop.
//!
//! Handlers return errors; the loop decides their disposition. Only two
//! variants are soft: duplicate/out-of-order acks are swallowed, and
//! RST_STREAM for an unknown stream is logged and ignored. Everything
//! else closes the session.

use std::io;

use thiserror::Error;

use super::types::{ErrorCode, PacketNumber, QuicError, StreamId};

/// Errors surfaced by loss recovery while processing an ACK frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecoveryError {
    /// The ack does not advance the largest observed packet. Happens
    /// when acks are reordered in the network; harmless.
    #[error("duplicate or out-of-order ack")]
    DuplicateOrOutOfOrderAck,

    /// The ack references a packet number that was never sent. The
    /// peer's view of the connection is inconsistent with ours.
    #[error("ack for packet {0} which was never sent")]
    UnknownPacket(PacketNumber),

    /// The entropy reported by the peer does not match the entropy of
    /// the acked packets.
    #[error("ack entropy mismatch")]
    InvalidAckEntropy,
}

/// Errors returned by frame handlers and the send path to the event
/// loop.
#[derive(Debug, Error)]
pub enum SessionError {
    /// STREAM frame with a stream id the peer is not allowed to open.
    #[error("stream frame with invalid stream id {0}")]
    InvalidStreamId(StreamId),

    /// STREAM frame for a stream that has been retired.
    #[error("reopening stream {0} not allowed")]
    ReopeningStreamsNotAllowed(StreamId),

    /// RST_STREAM for a stream we do not know. Soft: logged and ignored.
    #[error("rst_stream received for unknown stream {0}")]
    RstStreamOnInvalidStream(StreamId),

    /// WINDOW_UPDATE for a stream we do not know.
    #[error("window_update received for unknown stream {0}")]
    WindowUpdateOnInvalidStream(StreamId),

    /// `new_stream` was asked to create a stream that already exists.
    #[error("stream {0} already exists")]
    StreamAlreadyExists(StreamId),

    /// Loss recovery rejected an ACK frame.
    #[error("recovery: {0}")]
    Recovery(#[from] RecoveryError),

    /// A QUIC-level error, carried through to the CONNECTION_CLOSE frame.
    #[error(transparent)]
    Quic(#[from] QuicError),

    /// The connection writer failed.
    #[error("connection write failed: {0}")]
    Io(#[from] io::Error),
}

impl SessionError {
    /// Map this error to the wire error the close machine should send.
    pub fn to_quic_error(&self) -> QuicError {
        match self {
            SessionError::InvalidStreamId(id) => QuicError::new(
                ErrorCode::InvalidStreamId,
                format!("invalid stream id {}", id),
            ),
            SessionError::ReopeningStreamsNotAllowed(id) => QuicError::new(
                ErrorCode::StreamDataAfterTermination,
                format!("data for retired stream {}", id),
            ),
            SessionError::WindowUpdateOnInvalidStream(id) => QuicError::new(
                ErrorCode::InvalidStreamId,
                format!("window update on unknown stream {}", id),
            ),
            SessionError::Quic(err) => err.clone(),
            other => QuicError::new(ErrorCode::InternalError, other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_stream_id_maps_to_wire_code() {
        let err = SessionError::InvalidStreamId(4);
        assert_eq!(err.to_quic_error().code, ErrorCode::InvalidStreamId);
    }

    #[test]
    fn test_reopening_maps_to_stream_data_after_termination() {
        let err = SessionError::ReopeningStreamsNotAllowed(5);
        assert_eq!(
            err.to_quic_error().code,
            ErrorCode::StreamDataAfterTermination
        );
    }

    #[test]
    fn test_quic_error_passes_through() {
        let inner = QuicError::new(ErrorCode::DecryptionFailure, "bad tag");
        let err = SessionError::Quic(inner.clone());
        assert_eq!(err.to_quic_error(), inner);
    }

    #[test]
    fn test_recovery_error_is_internal() {
        let err = SessionError::Recovery(RecoveryError::InvalidAckEntropy);
        assert_eq!(err.to_quic_error().code, ErrorCode::InternalError);
    }
}
