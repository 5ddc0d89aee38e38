//! Public packet header: the unencrypted prefix of every packet.
//!
//! The header carries the connection id, optionally the version (only
//! client-sent packets include it), and a truncated packet number whose
//! full value is reconstructed against the last accepted packet number.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

use crate::core::types::{ConnectionId, PacketNumber, VersionNumber};

/// Flag bit: the header includes a version field.
const FLAG_VERSION: u8 = 0x01;
/// Mask over the two bits encoding the packet-number length.
const FLAG_PACKET_NUMBER_LEN_MASK: u8 = 0x30;
const FLAG_PACKET_NUMBER_LEN_SHIFT: u8 = 4;

/// Errors from public-header decoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeaderDecodeError {
    /// The datagram ended inside the header.
    #[error("unexpected end of header data")]
    UnexpectedEnd,

    /// The flags byte does not describe a regular packet.
    #[error("invalid public flags {0:#04x}")]
    InvalidFlags(u8),
}

/// Parsed public header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicHeader {
    /// Connection the packet belongs to.
    pub connection_id: ConnectionId,
    /// Version, present only on client-sent packets.
    pub version: Option<VersionNumber>,
    /// Packet number. Truncated as parsed off the wire; the session
    /// replaces it with the reconstructed full value.
    pub packet_number: PacketNumber,
    /// How many trailing bytes of the packet number were on the wire
    /// (1, 2, 4 or 6).
    pub packet_number_len: u8,
}

impl PublicHeader {
    /// Encoded size of this header.
    pub fn encoded_len(&self) -> usize {
        1 + 8 + if self.version.is_some() { 4 } else { 0 } + self.packet_number_len as usize
    }

    /// Append the wire encoding to `buf`.
    pub fn write(&self, buf: &mut BytesMut) {
        let mut flags = 0u8;
        if self.version.is_some() {
            flags |= FLAG_VERSION;
        }
        flags |= (len_code(self.packet_number_len) << FLAG_PACKET_NUMBER_LEN_SHIFT)
            & FLAG_PACKET_NUMBER_LEN_MASK;
        buf.put_u8(flags);
        buf.put_u64_le(self.connection_id.0);
        if let Some(version) = self.version {
            buf.put_u32_le(version.0);
        }
        let number = self.packet_number.to_le_bytes();
        buf.put_slice(&number[..self.packet_number_len as usize]);
    }

    /// Decode a header from the front of a datagram.
    pub fn parse(buf: &mut impl Buf) -> Result<Self, HeaderDecodeError> {
        if buf.remaining() < 1 + 8 {
            return Err(HeaderDecodeError::UnexpectedEnd);
        }
        let flags = buf.get_u8();
        let connection_id = ConnectionId(buf.get_u64_le());

        let version = if flags & FLAG_VERSION != 0 {
            if buf.remaining() < 4 {
                return Err(HeaderDecodeError::UnexpectedEnd);
            }
            Some(VersionNumber(buf.get_u32_le()))
        } else {
            None
        };

        let packet_number_len =
            code_len((flags & FLAG_PACKET_NUMBER_LEN_MASK) >> FLAG_PACKET_NUMBER_LEN_SHIFT);
        if buf.remaining() < packet_number_len as usize {
            return Err(HeaderDecodeError::UnexpectedEnd);
        }
        let mut number = [0u8; 8];
        buf.copy_to_slice(&mut number[..packet_number_len as usize]);

        Ok(Self {
            connection_id,
            version,
            packet_number: u64::from_le_bytes(number),
            packet_number_len,
        })
    }
}

fn len_code(len: u8) -> u8 {
    match len {
        1 => 0,
        2 => 1,
        4 => 2,
        _ => 3,
    }
}

fn code_len(code: u8) -> u8 {
    match code {
        0 => 1,
        1 => 2,
        2 => 4,
        _ => 6,
    }
}

/// Reconstruct a full packet number from its truncated wire form.
///
/// Picks the value closest to `last_rcvd + 1` whose low bytes match the
/// wire value. Used with the most recently accepted packet number as
/// anchor, this keeps the reconstructed sequence monotone for in-order
/// delivery.
pub fn infer_packet_number(
    packet_number_len: u8,
    last_rcvd: PacketNumber,
    truncated: PacketNumber,
) -> PacketNumber {
    let bits = 8 * u32::from(packet_number_len);
    if bits >= 64 {
        return truncated;
    }
    let epoch = 1u64 << bits;
    let mask = epoch - 1;
    let expected = last_rcvd.wrapping_add(1);
    let candidate = (expected & !mask) | (truncated & mask);

    let distance = |value: u64| value.abs_diff(expected);
    let mut best = candidate;
    if candidate >= epoch && distance(candidate - epoch) < distance(best) {
        best = candidate - epoch;
    }
    if let Some(upper) = candidate.checked_add(epoch) {
        if distance(upper) < distance(best) {
            best = upper;
        }
    }
    best
}
