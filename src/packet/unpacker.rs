//! Incoming packet opening: AEAD open plus frame parsing.

use std::sync::Arc;

use bytes::{Buf, Bytes};

use crate::core::error::SessionError;
use crate::core::types::{ErrorCode, QuicError};
use crate::frame::Frame;
use crate::handshake::CryptoSetup;
use crate::packet::header::PublicHeader;
use crate::packet::PRIVATE_FLAG_ENTROPY;

/// The decrypted contents of one packet.
#[derive(Debug, Clone)]
pub struct UnpackedPacket {
    /// Entropy bit from the private flags.
    pub entropy_bit: bool,
    /// Frames in wire order.
    pub frames: Vec<Frame>,
}

/// Opens and parses incoming packets.
pub struct PacketUnpacker {
    crypto: Arc<CryptoSetup>,
}

impl PacketUnpacker {
    /// Create an unpacker sharing the session's AEAD provider.
    pub fn new(crypto: Arc<CryptoSetup>) -> Self {
        Self { crypto }
    }

    /// Open the sealed payload of a packet and parse its frames.
    ///
    /// `associated_data` is the raw public header as received;
    /// `header.packet_number` must already hold the reconstructed full
    /// packet number.
    pub fn unpack(
        &self,
        associated_data: &[u8],
        header: &PublicHeader,
        payload: &[u8],
    ) -> Result<UnpackedPacket, SessionError> {
        let plaintext = self
            .crypto
            .open(header.packet_number, associated_data, payload)?;

        let mut cursor = Bytes::from(plaintext);
        if !cursor.has_remaining() {
            return Err(SessionError::Quic(QuicError::new(
                ErrorCode::InvalidFrameData,
                "packet payload is empty",
            )));
        }
        let private_flags = cursor.get_u8();
        let entropy_bit = private_flags & PRIVATE_FLAG_ENTROPY != 0;

        let mut frames = Vec::new();
        while cursor.has_remaining() {
            let frame = Frame::parse(&mut cursor).map_err(|err| {
                SessionError::Quic(QuicError::new(ErrorCode::InvalidFrameData, err.to_string()))
            })?;
            frames.push(frame);
        }

        Ok(UnpackedPacket {
            entropy_bit,
            frames,
        })
    }
}
