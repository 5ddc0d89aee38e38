//! Core identifiers, protocol constants, and the error taxonomy shared by
//! every other module.

pub mod constants;
pub mod error;
pub mod types;

pub use error::{RecoveryError, SessionError};
pub use types::{ByteCount, ConnectionId, ErrorCode, PacketNumber, QuicError, StreamId, VersionNumber};
