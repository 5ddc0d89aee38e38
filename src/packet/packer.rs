//! Outgoing packet assembly.
//!
//! The packer owns the outbound packet-number counter and the queue of
//! stream frames waiting for transmission. Each call builds at most one
//! packet: the stop-waiting frame and control frames are placed first,
//! then stream data is fitted into the remaining space, splitting the
//! frame at the front of the queue if necessary.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::core::constants::{MAX_PACKET_SIZE, PACKET_NUMBER_LEN, SEAL_OVERHEAD};
use crate::core::types::{ConnectionId, PacketNumber, QuicError, VersionNumber};
use crate::frame::{ConnectionCloseFrame, Frame, StopWaitingFrame, StreamFrame};
use crate::handshake::CryptoSetup;
use crate::packet::header::PublicHeader;
use crate::packet::PRIVATE_FLAG_ENTROPY;

/// A fully assembled, sealed packet ready for the wire.
#[derive(Debug, Clone)]
pub struct PackedPacket {
    /// Packet number assigned by the packer.
    pub number: PacketNumber,
    /// Complete datagram payload (public header plus sealed body).
    pub raw: Bytes,
    /// The frames the packet carries, kept for loss-recovery
    /// registration.
    pub frames: Vec<Frame>,
    /// Entropy bit written into the private flags.
    pub entropy_bit: bool,
}

/// Assembles outgoing packets.
pub struct PacketPacker {
    connection_id: ConnectionId,
    #[allow(dead_code)]
    version: VersionNumber,
    crypto: Arc<CryptoSetup>,
    last_packet_number: PacketNumber,
    stream_frames: VecDeque<StreamFrame>,
}

impl PacketPacker {
    /// Create a packer for one connection.
    pub fn new(
        connection_id: ConnectionId,
        version: VersionNumber,
        crypto: Arc<CryptoSetup>,
    ) -> Self {
        Self {
            connection_id,
            version,
            crypto,
            last_packet_number: 0,
            stream_frames: VecDeque::new(),
        }
    }

    /// Queue a stream frame for transmission.
    pub fn add_stream_frame(&mut self, frame: StreamFrame) {
        self.stream_frames.push_back(frame);
    }

    /// Queue a stream frame ahead of everything else (retransmissions).
    pub fn add_high_prio_stream_frame(&mut self, frame: StreamFrame) {
        self.stream_frames.push_front(frame);
    }

    /// Whether the stream-frame queue is drained.
    pub fn is_empty(&self) -> bool {
        self.stream_frames.is_empty()
    }

    /// Pin the packet-number counter, so tests can line the packer up
    /// with externally registered packets.
    #[cfg(test)]
    pub(crate) fn set_last_packet_number(&mut self, number: PacketNumber) {
        self.last_packet_number = number;
    }

    /// Build at most one packet from the given control frames and, if
    /// requested, queued stream data. Returns `None` when there is
    /// nothing to send.
    pub fn pack_packet(
        &mut self,
        stop_waiting: Option<StopWaitingFrame>,
        control_frames: Vec<Frame>,
        include_stream_data: bool,
    ) -> Result<Option<PackedPacket>, QuicError> {
        let mut frames: Vec<Frame> = Vec::new();
        if let Some(frame) = stop_waiting {
            frames.push(Frame::StopWaiting(frame));
        }
        frames.extend(control_frames);

        let budget = payload_budget();
        let mut used: usize = frames.iter().map(Frame::encoded_len).sum();

        if include_stream_data {
            while let Some(front) = self.stream_frames.front_mut() {
                let avail = budget.saturating_sub(used);
                let min_need = if front.data.is_empty() {
                    StreamFrame::HEADER_LEN
                } else {
                    StreamFrame::HEADER_LEN + 1
                };
                if avail < min_need {
                    break;
                }

                if front.encoded_len() <= avail {
                    used += front.encoded_len();
                    if let Some(frame) = self.stream_frames.pop_front() {
                        frames.push(Frame::Stream(frame));
                    }
                    continue;
                }

                // Split the frame: the head fills this packet, the
                // remainder stays queued at its advanced offset.
                let take = avail - StreamFrame::HEADER_LEN;
                let head = StreamFrame {
                    stream_id: front.stream_id,
                    offset: front.offset,
                    data: front.data.split_to(take),
                    fin: false,
                };
                front.offset += take as u64;
                frames.push(Frame::Stream(head));
                break;
            }
        }

        if frames.is_empty() {
            return Ok(None);
        }
        self.assemble(frames).map(Some)
    }

    /// Build a packet carrying a single CONNECTION_CLOSE frame.
    pub fn pack_connection_close(
        &mut self,
        frame: ConnectionCloseFrame,
    ) -> Result<PackedPacket, QuicError> {
        self.assemble(vec![Frame::ConnectionClose(frame)])
    }

    fn assemble(&mut self, frames: Vec<Frame>) -> Result<PackedPacket, QuicError> {
        let number = self.last_packet_number + 1;
        let header = PublicHeader {
            connection_id: self.connection_id,
            version: None,
            packet_number: number,
            packet_number_len: PACKET_NUMBER_LEN,
        };
        let mut header_buf = BytesMut::with_capacity(header.encoded_len());
        header.write(&mut header_buf);

        let entropy_bit = rand::random::<bool>();
        let mut plaintext = BytesMut::with_capacity(MAX_PACKET_SIZE);
        plaintext.put_u8(if entropy_bit { PRIVATE_FLAG_ENTROPY } else { 0 });
        for frame in &frames {
            frame.write(&mut plaintext);
        }

        let sealed = self.crypto.seal(number, &header_buf, &plaintext)?;
        let mut raw = BytesMut::with_capacity(header_buf.len() + sealed.len());
        raw.put_slice(&header_buf);
        raw.put_slice(&sealed);

        self.last_packet_number = number;
        Ok(PackedPacket {
            number,
            raw: raw.freeze(),
            frames,
            entropy_bit,
        })
    }
}

/// Space available for frames after the public header, the private
/// flags byte, and the seal overhead.
fn payload_budget() -> usize {
    // Server-sent headers carry no version field.
    let header_len = 1 + 8 + PACKET_NUMBER_LEN as usize;
    MAX_PACKET_SIZE - header_len - 1 - SEAL_OVERHEAD
}
