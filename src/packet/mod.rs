//! Packet-level glue: the public header, the packer assembling outgoing
//! packets, the unpacker opening incoming ones, and the public reset
//! packet.

pub mod header;
pub mod packer;
pub mod reset;
pub mod unpacker;

pub use header::{infer_packet_number, HeaderDecodeError, PublicHeader};
pub use packer::{PackedPacket, PacketPacker};
pub use reset::PublicResetPacket;
pub use unpacker::{PacketUnpacker, UnpackedPacket};

/// Bit in the private flags byte (the first decrypted byte of every
/// packet) carrying the packet's entropy contribution.
pub const PRIVATE_FLAG_ENTROPY: u8 = 0x01;
