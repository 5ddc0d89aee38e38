//! # quic-session
//!
//! Server-side session core for a QUIC endpoint.
//!
//! A [`Session`](session::Session) owns everything that happens between
//! the UDP demultiplexer and the application for one connection:
//!
//! - **Ingress**: datagrams handed in by the demultiplexer are decrypted,
//!   split into frames, and dispatched to streams and the ack engines.
//! - **Egress**: retransmissions, acknowledgements, stop-waiting and
//!   stream data are merged into at most one outgoing packet per egress
//!   signal, gated by the congestion window.
//! - **Lifecycle**: idle timeout, graceful CONNECTION_CLOSE, public reset
//!   on undecryptable peers, and cascaded stream error delivery.
//!
//! The session is driven by a single event loop ([`Session::run`](session::Session::run));
//! all other entry points (`handle_packet`, `new_stream`,
//! `queue_stream_frame`, `close`) are safe to call from any task.
//!
//! ## Collaborators
//!
//! The crate deliberately stops at well-defined seams: UDP socket
//! handling and connection-id fan-out belong to the caller (which
//! implements [`session::Connection`]), and application code consumes
//! streams through the stream callback.
//!
//! ## Modules
//!
//! - [`core`]: identifiers, wire error codes, constants, error taxonomy
//! - [`frame`]: typed frames and their byte-level codec
//! - [`packet`]: public header, packer/unpacker, public reset
//! - [`ack`]: loss recovery, receive-side ack scheduling, stop-waiting
//! - [`congestion`]: RTT estimation and the send algorithm seam
//! - [`handshake`]: server config, negotiated parameters, AEAD provider
//! - [`stream`]: per-stream reassembly, flow control, read/write API
//! - [`session`]: the event loop tying everything together

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod ack;
pub mod congestion;
pub mod core;
pub mod frame;
pub mod handshake;
pub mod packet;
pub mod session;
pub mod stream;

pub use crate::core::{ConnectionId, ErrorCode, QuicError, SessionError, VersionNumber};
pub use handshake::ServerConfig;
pub use session::{CloseCallback, Connection, ReceivedPacket, Session, StreamCallback};
pub use stream::Stream;
