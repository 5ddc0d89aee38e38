//! Typed frames and their byte-level codec.
//!
//! The session core works on these typed values; the codec is only
//! touched by the packer/unpacker. Stream frames use the high type bit
//! (0x80, with 0x40 as the FIN flag), ACK frames use 0x40, and the
//! remaining frames use small dedicated type bytes.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::core::types::{ByteCount, PacketNumber, StreamId};

/// Frame type identifiers for non-stream, non-ack frames.
pub mod type_byte {
    /// RST_STREAM frame.
    pub const RST_STREAM: u8 = 0x01;
    /// CONNECTION_CLOSE frame.
    pub const CONNECTION_CLOSE: u8 = 0x02;
    /// WINDOW_UPDATE frame.
    pub const WINDOW_UPDATE: u8 = 0x04;
    /// BLOCKED frame.
    pub const BLOCKED: u8 = 0x05;
    /// STOP_WAITING frame.
    pub const STOP_WAITING: u8 = 0x06;
    /// PING frame.
    pub const PING: u8 = 0x07;
    /// Bit marking a STREAM frame.
    pub const STREAM_BIT: u8 = 0x80;
    /// FIN flag within a STREAM type byte.
    pub const STREAM_FIN_BIT: u8 = 0x40;
    /// Bit marking an ACK frame (when the stream bit is clear).
    pub const ACK_BIT: u8 = 0x40;
}

/// Errors from frame decoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameDecodeError {
    /// The buffer ended in the middle of a frame.
    #[error("unexpected end of frame data")]
    UnexpectedEnd,

    /// The type byte matches no known frame.
    #[error("unknown frame type byte {0:#04x}")]
    UnknownType(u8),
}

/// Application or handshake data on one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    /// Target stream.
    pub stream_id: StreamId,
    /// Byte offset of `data` within the stream.
    pub offset: u64,
    /// Payload bytes.
    pub data: Bytes,
    /// Whether this frame ends the stream at `offset + data.len()`.
    pub fin: bool,
}

impl StreamFrame {
    /// Bytes of header this frame occupies on the wire, excluding data.
    pub const HEADER_LEN: usize = 1 + 4 + 8 + 2;

    /// Total encoded length.
    pub fn encoded_len(&self) -> usize {
        Self::HEADER_LEN + self.data.len()
    }
}

/// Acknowledgement of received packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    /// Highest packet number observed.
    pub largest_observed: PacketNumber,
    /// Cumulative entropy of all received packets up to
    /// `largest_observed`.
    pub entropy: u8,
    /// Time the largest observed packet waited before this ack was
    /// assembled.
    pub delay: Duration,
    /// Packet numbers below `largest_observed` that have not arrived.
    pub missing: Vec<PacketNumber>,
}

impl AckFrame {
    /// Total encoded length.
    pub fn encoded_len(&self) -> usize {
        1 + 8 + 1 + 8 + 1 + 8 * self.missing.len()
    }
}

/// Abrupt termination of one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RstStreamFrame {
    /// Target stream.
    pub stream_id: StreamId,
    /// Peer's application error code, passed through verbatim.
    pub error_code: u32,
    /// Final byte offset of the stream.
    pub byte_offset: u64,
}

/// Connection termination with an error code and reason phrase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCloseFrame {
    /// Wire error code.
    pub error_code: u32,
    /// Human-readable reason, truncated to 64 KiB on encode.
    pub reason_phrase: String,
}

/// Raise of a flow-control window. Stream id 0 addresses the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUpdateFrame {
    /// Target stream, or 0 for the connection.
    pub stream_id: StreamId,
    /// New absolute byte offset the sender may reach.
    pub byte_offset: ByteCount,
}

/// The peer is blocked on flow control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockedFrame {
    /// Blocked stream, or 0 for the connection.
    pub stream_id: StreamId,
}

/// Informs the peer of the earliest packet still awaiting
/// acknowledgement, letting it drop older ack state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopWaitingFrame {
    /// All packets below this number are either acked or abandoned.
    pub least_unacked: PacketNumber,
    /// Cumulative entropy of the abandoned range.
    pub entropy: u8,
}

impl StopWaitingFrame {
    /// Total encoded length.
    pub const ENCODED_LEN: usize = 1 + 8 + 1;
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Stream data.
    Stream(StreamFrame),
    /// Acknowledgement.
    Ack(AckFrame),
    /// Stream reset.
    RstStream(RstStreamFrame),
    /// Connection termination.
    ConnectionClose(ConnectionCloseFrame),
    /// Flow-control window raise.
    WindowUpdate(WindowUpdateFrame),
    /// Flow-control blocked notice.
    Blocked(BlockedFrame),
    /// Ack-state trim notice.
    StopWaiting(StopWaitingFrame),
    /// Liveness probe.
    Ping,
}

impl Frame {
    /// Encoded length of this frame.
    pub fn encoded_len(&self) -> usize {
        match self {
            Frame::Stream(f) => f.encoded_len(),
            Frame::Ack(f) => f.encoded_len(),
            Frame::RstStream(_) => 1 + 4 + 4 + 8,
            Frame::ConnectionClose(f) => 1 + 4 + 2 + f.reason_phrase.len().min(u16::MAX as usize),
            Frame::WindowUpdate(_) => 1 + 4 + 8,
            Frame::Blocked(_) => 1 + 4,
            Frame::StopWaiting(_) => StopWaitingFrame::ENCODED_LEN,
            Frame::Ping => 1,
        }
    }

    /// Append the wire encoding of this frame to `buf`.
    pub fn write(&self, buf: &mut BytesMut) {
        match self {
            Frame::Stream(f) => {
                let mut ty = type_byte::STREAM_BIT;
                if f.fin {
                    ty |= type_byte::STREAM_FIN_BIT;
                }
                buf.put_u8(ty);
                buf.put_u32_le(f.stream_id);
                buf.put_u64_le(f.offset);
                buf.put_u16_le(f.data.len() as u16);
                buf.put_slice(&f.data);
            }
            Frame::Ack(f) => {
                buf.put_u8(type_byte::ACK_BIT);
                buf.put_u64_le(f.largest_observed);
                buf.put_u8(f.entropy);
                buf.put_u64_le(f.delay.as_micros() as u64);
                buf.put_u8(f.missing.len() as u8);
                for pn in &f.missing {
                    buf.put_u64_le(*pn);
                }
            }
            Frame::RstStream(f) => {
                buf.put_u8(type_byte::RST_STREAM);
                buf.put_u32_le(f.stream_id);
                buf.put_u32_le(f.error_code);
                buf.put_u64_le(f.byte_offset);
            }
            Frame::ConnectionClose(f) => {
                buf.put_u8(type_byte::CONNECTION_CLOSE);
                buf.put_u32_le(f.error_code);
                let reason = f.reason_phrase.as_bytes();
                let len = reason.len().min(u16::MAX as usize);
                buf.put_u16_le(len as u16);
                buf.put_slice(&reason[..len]);
            }
            Frame::WindowUpdate(f) => {
                buf.put_u8(type_byte::WINDOW_UPDATE);
                buf.put_u32_le(f.stream_id);
                buf.put_u64_le(f.byte_offset);
            }
            Frame::Blocked(f) => {
                buf.put_u8(type_byte::BLOCKED);
                buf.put_u32_le(f.stream_id);
            }
            Frame::StopWaiting(f) => {
                buf.put_u8(type_byte::STOP_WAITING);
                buf.put_u64_le(f.least_unacked);
                buf.put_u8(f.entropy);
            }
            Frame::Ping => buf.put_u8(type_byte::PING),
        }
    }

    /// Decode one frame from the front of `buf`.
    pub fn parse(buf: &mut impl Buf) -> Result<Frame, FrameDecodeError> {
        if !buf.has_remaining() {
            return Err(FrameDecodeError::UnexpectedEnd);
        }
        let ty = buf.get_u8();

        if ty & type_byte::STREAM_BIT != 0 {
            let fin = ty & type_byte::STREAM_FIN_BIT != 0;
            check_remaining(buf, 4 + 8 + 2)?;
            let stream_id = buf.get_u32_le();
            let offset = buf.get_u64_le();
            let len = buf.get_u16_le() as usize;
            check_remaining(buf, len)?;
            let data = buf.copy_to_bytes(len);
            return Ok(Frame::Stream(StreamFrame {
                stream_id,
                offset,
                data,
                fin,
            }));
        }

        if ty & type_byte::ACK_BIT != 0 {
            check_remaining(buf, 8 + 1 + 8 + 1)?;
            let largest_observed = buf.get_u64_le();
            let entropy = buf.get_u8();
            let delay = Duration::from_micros(buf.get_u64_le());
            let count = buf.get_u8() as usize;
            check_remaining(buf, count * 8)?;
            let mut missing = Vec::with_capacity(count);
            for _ in 0..count {
                missing.push(buf.get_u64_le());
            }
            return Ok(Frame::Ack(AckFrame {
                largest_observed,
                entropy,
                delay,
                missing,
            }));
        }

        match ty {
            type_byte::RST_STREAM => {
                check_remaining(buf, 4 + 4 + 8)?;
                Ok(Frame::RstStream(RstStreamFrame {
                    stream_id: buf.get_u32_le(),
                    error_code: buf.get_u32_le(),
                    byte_offset: buf.get_u64_le(),
                }))
            }
            type_byte::CONNECTION_CLOSE => {
                check_remaining(buf, 4 + 2)?;
                let error_code = buf.get_u32_le();
                let len = buf.get_u16_le() as usize;
                check_remaining(buf, len)?;
                let reason = buf.copy_to_bytes(len);
                Ok(Frame::ConnectionClose(ConnectionCloseFrame {
                    error_code,
                    reason_phrase: String::from_utf8_lossy(&reason).into_owned(),
                }))
            }
            type_byte::WINDOW_UPDATE => {
                check_remaining(buf, 4 + 8)?;
                Ok(Frame::WindowUpdate(WindowUpdateFrame {
                    stream_id: buf.get_u32_le(),
                    byte_offset: buf.get_u64_le(),
                }))
            }
            type_byte::BLOCKED => {
                check_remaining(buf, 4)?;
                Ok(Frame::Blocked(BlockedFrame {
                    stream_id: buf.get_u32_le(),
                }))
            }
            type_byte::STOP_WAITING => {
                check_remaining(buf, 8 + 1)?;
                Ok(Frame::StopWaiting(StopWaitingFrame {
                    least_unacked: buf.get_u64_le(),
                    entropy: buf.get_u8(),
                }))
            }
            type_byte::PING => Ok(Frame::Ping),
            other => Err(FrameDecodeError::UnknownType(other)),
        }
    }
}

fn check_remaining(buf: &impl Buf, needed: usize) -> Result<(), FrameDecodeError> {
    if buf.remaining() < needed {
        return Err(FrameDecodeError::UnexpectedEnd);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) -> Frame {
        let mut buf = BytesMut::new();
        frame.write(&mut buf);
        assert_eq!(buf.len(), frame.encoded_len());
        let mut cursor = buf.freeze();
        let decoded = Frame::parse(&mut cursor).unwrap();
        assert_eq!(cursor.remaining(), 0);
        decoded
    }

    #[test]
    fn test_stream_frame_roundtrip() {
        let frame = Frame::Stream(StreamFrame {
            stream_id: 3,
            offset: 100,
            data: Bytes::from_static(b"abc"),
            fin: true,
        });
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_ack_frame_roundtrip() {
        let frame = Frame::Ack(AckFrame {
            largest_observed: 42,
            entropy: 0x5a,
            delay: Duration::from_micros(1500),
            missing: vec![7, 9],
        });
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_control_frames_roundtrip() {
        let frames = vec![
            Frame::RstStream(RstStreamFrame {
                stream_id: 5,
                error_code: 17,
                byte_offset: 2048,
            }),
            Frame::ConnectionClose(ConnectionCloseFrame {
                error_code: 16,
                reason_phrase: "peer going away".to_string(),
            }),
            Frame::WindowUpdate(WindowUpdateFrame {
                stream_id: 3,
                byte_offset: 1 << 20,
            }),
            Frame::Blocked(BlockedFrame { stream_id: 0 }),
            Frame::StopWaiting(StopWaitingFrame {
                least_unacked: 11,
                entropy: 0xff,
            }),
            Frame::Ping,
        ];
        for frame in frames {
            assert_eq!(roundtrip(frame.clone()), frame);
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut buf = Bytes::from_static(&[0x3f]);
        assert_eq!(
            Frame::parse(&mut buf),
            Err(FrameDecodeError::UnknownType(0x3f))
        );
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let frame = Frame::WindowUpdate(WindowUpdateFrame {
            stream_id: 3,
            byte_offset: 64,
        });
        let mut buf = BytesMut::new();
        frame.write(&mut buf);
        let mut truncated = buf.freeze().slice(..5);
        assert_eq!(
            Frame::parse(&mut truncated),
            Err(FrameDecodeError::UnexpectedEnd)
        );
    }

    #[test]
    fn test_empty_fin_stream_frame() {
        let frame = Frame::Stream(StreamFrame {
            stream_id: 7,
            offset: 300,
            data: Bytes::new(),
            fin: true,
        });
        assert_eq!(roundtrip(frame.clone()), frame);
    }
}
