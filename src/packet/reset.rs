//! The public reset packet.
//!
//! An unauthenticated out-of-band packet that aborts a session whose
//! peer traffic can no longer be decrypted. It is the only wire format
//! the session core constructs itself.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::core::types::{ConnectionId, PacketNumber};
use crate::packet::header::HeaderDecodeError;

/// Public flags of a reset packet: reset bit plus full-length
/// connection id.
pub const PUBLIC_RESET_FLAGS: u8 = 0x0e;

/// A public reset packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicResetPacket {
    /// Connection being reset.
    pub connection_id: ConnectionId,
    /// The last packet number accepted from the peer.
    pub rejected_packet_number: PacketNumber,
    /// Proof-of-ownership nonce. Currently always zero.
    pub nonce_proof: u64,
}

impl PublicResetPacket {
    /// Encode the packet for the wire.
    pub fn write(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + 8 + 8 + 8);
        buf.put_u8(PUBLIC_RESET_FLAGS);
        buf.put_u64_le(self.connection_id.0);
        buf.put_u64_le(self.nonce_proof);
        buf.put_u64_le(self.rejected_packet_number);
        buf.freeze()
    }

    /// Decode a reset packet.
    pub fn parse(buf: &mut impl Buf) -> Result<Self, HeaderDecodeError> {
        if buf.remaining() < 1 + 8 + 8 + 8 {
            return Err(HeaderDecodeError::UnexpectedEnd);
        }
        let flags = buf.get_u8();
        if flags != PUBLIC_RESET_FLAGS {
            return Err(HeaderDecodeError::InvalidFlags(flags));
        }
        Ok(Self {
            connection_id: ConnectionId(buf.get_u64_le()),
            nonce_proof: buf.get_u64_le(),
            rejected_packet_number: buf.get_u64_le(),
        })
    }
}
