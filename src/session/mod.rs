//! The per-connection session core.
//!
//! A [`Session`] is driven by exactly one event loop ([`Session::run`])
//! which is the sole mutator of the ack engines, the congestion
//! controller, and the RTT estimator. Everything else talks to the
//! session through channels and a handful of locked structures:
//!
//! - the demultiplexer enqueues datagrams with [`Session::handle_packet`],
//! - the application opens streams and queues data from any task,
//! - the handshake task runs concurrently on the crypto stream and
//!   closes the session if it fails.
//!
//! The egress signal is a coalescing latch (capacity-1 channel fed with
//! `try_send`): any number of producers collapse into one loop wakeup
//! per burst. The close signal is a one-shot latch with the same shape.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, trace, warn};

use crate::ack::{ReceivedPacketHandler, SentPacket, SentPacketHandler, StopWaitingManager};
use crate::congestion::{PacketInfo, RenoSender, RttEstimator, SendAlgorithm};
use crate::core::constants::{CRYPTO_STREAM_ID, INGRESS_QUEUE_DEPTH};
use crate::core::error::{RecoveryError, SessionError};
use crate::core::types::{ByteCount, ConnectionId, ErrorCode, PacketNumber, QuicError, StreamId, VersionNumber};
use crate::frame::{AckFrame, ConnectionCloseFrame, Frame, RstStreamFrame, StreamFrame, WindowUpdateFrame};
use crate::handshake::{ConnectionParams, CryptoSetup, ServerConfig};
use crate::packet::{infer_packet_number, PacketPacker, PacketUnpacker, PublicHeader, PublicResetPacket};
use crate::stream::Stream;

/// The borrowed UDP-level writer the session emits packets through.
///
/// Implemented by the listener that owns the socket; `write` is a
/// synchronous best-effort datagram send.
pub trait Connection: Send + Sync {
    /// Send one datagram to the current remote address.
    fn write(&self, packet: &[u8]) -> io::Result<()>;

    /// Record the peer's most recently observed address.
    fn set_current_remote_addr(&self, addr: SocketAddr);
}

/// Invoked exactly once per newly accepted peer-initiated stream, after
/// the first frame has been appended.
pub type StreamCallback = Box<dyn Fn(&Arc<Session>, Arc<Stream>) + Send + Sync>;

/// Invoked exactly once with the connection id when the session
/// terminates; the demultiplexer uses it to drop its table entry.
pub type CloseCallback = Box<dyn Fn(ConnectionId) + Send + Sync>;

/// One datagram as handed over by the demultiplexer.
#[derive(Debug)]
pub struct ReceivedPacket {
    /// Source address of the datagram.
    pub remote_addr: SocketAddr,
    /// Parsed public header; the packet number is still truncated.
    pub header: PublicHeader,
    /// The raw header bytes, needed as AEAD associated data.
    pub raw_header: Bytes,
    /// The sealed remainder of the datagram.
    pub payload: Bytes,
}

/// State owned by the event loop: the sub-engines only `run` (and the
/// frame handlers it calls) may touch.
struct Engines {
    sent: SentPacketHandler,
    received: ReceivedPacketHandler,
    stop_waiting: StopWaitingManager,
    rtt: RttEstimator,
    congestion: Box<dyn SendAlgorithm>,
    unpacker: PacketUnpacker,
}

/// A QUIC session: the per-connection protocol engine.
pub struct Session {
    connection_id: ConnectionId,
    #[allow(dead_code)]
    version: VersionNumber,
    conn: Arc<dyn Connection>,

    stream_callback: StreamCallback,
    close_callback: CloseCallback,

    params: Arc<ConnectionParams>,
    crypto: Arc<CryptoSetup>,

    /// Stream table. `None` is a tombstone: the id was used and retired,
    /// and may never be reopened.
    streams: RwLock<HashMap<StreamId, Option<Arc<Stream>>>>,

    engines: Mutex<Engines>,
    packer: Mutex<PacketPacker>,

    ingress_tx: mpsc::Sender<ReceivedPacket>,
    ingress_rx: Mutex<Option<mpsc::Receiver<ReceivedPacket>>>,
    egress_tx: mpsc::Sender<()>,
    egress_rx: Mutex<Option<mpsc::Receiver<()>>>,
    close_tx: mpsc::Sender<()>,
    close_rx: Mutex<Option<mpsc::Receiver<()>>>,

    closed: AtomicBool,
    /// Anchor for packet-number reconstruction; also echoed in public
    /// reset packets.
    last_rcvd_packet_number: AtomicU64,
}

impl Session {
    /// Create a session for one accepted connection.
    ///
    /// Pre-creates the crypto stream and spawns the handshake task; the
    /// caller must drive [`Session::run`] on exactly one task.
    pub fn new(
        conn: Arc<dyn Connection>,
        version: VersionNumber,
        connection_id: ConnectionId,
        config: ServerConfig,
        stream_callback: StreamCallback,
        close_callback: CloseCallback,
    ) -> Arc<Self> {
        let params = Arc::new(ConnectionParams::new());
        let crypto = Arc::new(CryptoSetup::new(config, Arc::clone(&params)));

        let (ingress_tx, ingress_rx) = mpsc::channel(INGRESS_QUEUE_DEPTH);
        let (egress_tx, egress_rx) = mpsc::channel(1);
        let (close_tx, close_rx) = mpsc::channel(1);

        let session = Arc::new_cyclic(|weak| {
            let crypto_stream = Arc::new(Stream::new(CRYPTO_STREAM_ID, weak.clone()));
            let mut streams = HashMap::new();
            streams.insert(CRYPTO_STREAM_ID, Some(crypto_stream));

            Session {
                connection_id,
                version,
                conn,
                stream_callback,
                close_callback,
                params: Arc::clone(&params),
                crypto: Arc::clone(&crypto),
                streams: RwLock::new(streams),
                engines: Mutex::new(Engines {
                    sent: SentPacketHandler::new(),
                    received: ReceivedPacketHandler::new(),
                    stop_waiting: StopWaitingManager::new(),
                    rtt: RttEstimator::new(),
                    congestion: Box::new(RenoSender::new()),
                    unpacker: PacketUnpacker::new(Arc::clone(&crypto)),
                }),
                packer: Mutex::new(PacketPacker::new(connection_id, version, crypto)),
                ingress_tx,
                ingress_rx: Mutex::new(Some(ingress_rx)),
                egress_tx,
                egress_rx: Mutex::new(Some(egress_rx)),
                close_tx,
                close_rx: Mutex::new(Some(close_rx)),
                closed: AtomicBool::new(false),
                last_rcvd_packet_number: AtomicU64::new(0),
            }
        });

        if let Some(Some(crypto_stream)) = session.streams().get(&CRYPTO_STREAM_ID).cloned() {
            let session_for_handshake = Arc::clone(&session);
            tokio::spawn(async move {
                let crypto = Arc::clone(&session_for_handshake.crypto);
                if let Err(err) = crypto.handle_crypto_stream(&crypto_stream).await {
                    session_for_handshake.close(Some(err), true);
                }
            });
        }

        session
    }

    /// The connection id this session serves.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Whether the session has terminated.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The negotiated connection parameters.
    pub fn connection_params(&self) -> &Arc<ConnectionParams> {
        &self.params
    }

    /// Enqueue one datagram from the demultiplexer. Never blocks; when
    /// the ingress queue is full the datagram is dropped, which is
    /// indistinguishable from network loss.
    pub fn handle_packet(
        &self,
        remote_addr: SocketAddr,
        header: PublicHeader,
        raw_header: Bytes,
        payload: Bytes,
    ) {
        let packet = ReceivedPacket {
            remote_addr,
            header,
            raw_header,
            payload,
        };
        match self.ingress_tx.try_send(packet) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(connection = %self.connection_id, "ingress queue full, dropping packet");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(connection = %self.connection_id, "packet for terminated session dropped");
            }
        }
    }

    /// Run the session event loop until the session closes.
    ///
    /// Waits for the first of: close signal, an ingress datagram, the
    /// egress signal, or the idle timeout. Handler errors are
    /// dispositioned here; no handler closes the session itself except
    /// CONNECTION_CLOSE handling and the idle-timeout branch.
    pub async fn run(self: Arc<Self>) {
        let receivers = (
            self.take_receiver(&self.ingress_rx),
            self.take_receiver(&self.egress_rx),
            self.take_receiver(&self.close_rx),
        );
        let (Some(mut ingress), Some(mut egress), Some(mut close)) = receivers else {
            error!(connection = %self.connection_id, "session event loop started twice");
            return;
        };

        loop {
            // A close signaled while another branch was ready must still
            // be honored promptly.
            if close.try_recv().is_ok() {
                return;
            }

            let idle = self.params.idle_connection_state_lifetime();
            let result = tokio::select! {
                biased;
                _ = close.recv() => return,
                maybe_packet = ingress.recv() => {
                    let Some(packet) = maybe_packet else { return };
                    let result = self.handle_received_packet(packet);
                    self.schedule_sending();
                    result
                }
                _ = egress.recv() => self.send_packet(),
                _ = tokio::time::sleep(idle) => {
                    self.close(
                        Some(QuicError::new(
                            ErrorCode::NetworkIdleTimeout,
                            "No recent network activity.",
                        )),
                        true,
                    );
                    Ok(())
                }
            };

            if let Err(err) = result {
                match err {
                    // Acks for packets declared missing can arrive late.
                    SessionError::Recovery(RecoveryError::DuplicateOrOutOfOrderAck) => {}
                    SessionError::RstStreamOnInvalidStream(stream_id) => {
                        warn!(stream = stream_id, "ignoring RST_STREAM for unknown stream");
                    }
                    err => self.close(Some(err.to_quic_error()), true),
                }
            }

            self.garbage_collect_streams();
        }
    }

    fn take_receiver<T>(&self, slot: &Mutex<Option<mpsc::Receiver<T>>>) -> Option<mpsc::Receiver<T>> {
        slot.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Decrypt one datagram and dispatch its frames.
    fn handle_received_packet(self: &Arc<Self>, packet: ReceivedPacket) -> Result<(), SessionError> {
        let ReceivedPacket {
            remote_addr,
            mut header,
            raw_header,
            payload,
        } = packet;

        let last = self.last_rcvd_packet_number.load(Ordering::Relaxed);
        header.packet_number =
            infer_packet_number(header.packet_number_len, last, header.packet_number);
        self.last_rcvd_packet_number
            .store(header.packet_number, Ordering::Relaxed);
        trace!(
            connection = %self.connection_id,
            packet = header.packet_number,
            bytes = payload.len(),
            "reading packet"
        );

        self.conn.set_current_remote_addr(remote_addr);

        let mut engines = self.engines();
        let unpacked = match engines.unpacker.unpack(&raw_header, &header, &payload) {
            Ok(unpacked) => unpacked,
            Err(SessionError::Quic(err)) if err.code == ErrorCode::DecryptionFailure => {
                info!("discarding packet due to decryption failure");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        engines
            .received
            .received_packet(header.packet_number, unpacked.entropy_bit);

        for frame in &unpacked.frames {
            match frame {
                Frame::Stream(frame) => {
                    trace!(
                        stream = frame.stream_id,
                        offset = frame.offset,
                        fin = frame.fin,
                        "stream frame"
                    );
                    self.handle_stream_frame(frame)?;
                }
                Frame::Ack(frame) => self.handle_ack_frame(&mut engines, frame)?,
                Frame::ConnectionClose(frame) => {
                    debug!(
                        code = frame.error_code,
                        reason = %frame.reason_phrase,
                        "peer closed the connection"
                    );
                    self.close(None, false);
                }
                Frame::StopWaiting(frame) => engines.received.received_stop_waiting(frame),
                Frame::RstStream(frame) => self.handle_rst_stream_frame(frame)?,
                Frame::WindowUpdate(frame) => self.handle_window_update_frame(frame)?,
                Frame::Blocked(frame) => {
                    info!(
                        connection = %self.connection_id,
                        stream = frame.stream_id,
                        "peer reported blocked"
                    );
                }
                Frame::Ping => trace!("ping"),
            }
        }
        Ok(())
    }

    fn handle_stream_frame(self: &Arc<Self>, frame: &StreamFrame) -> Result<(), SessionError> {
        let existing = self.streams().get(&frame.stream_id).cloned();
        match existing {
            Some(Some(stream)) => {
                stream.add_stream_frame(frame)?;
                Ok(())
            }
            Some(None) => Err(SessionError::ReopeningStreamsNotAllowed(frame.stream_id)),
            None => {
                if !is_valid_peer_stream_id(frame.stream_id) {
                    return Err(SessionError::InvalidStreamId(frame.stream_id));
                }
                let stream = self.new_stream(frame.stream_id)?;
                stream.add_stream_frame(frame)?;
                // The application sees the stream with its first frame
                // already buffered.
                (self.stream_callback)(self, Arc::clone(&stream));
                Ok(())
            }
        }
    }

    fn handle_rst_stream_frame(&self, frame: &RstStreamFrame) -> Result<(), SessionError> {
        match self.streams().get(&frame.stream_id).cloned() {
            Some(Some(stream)) => {
                stream.register_error(QuicError::new(
                    ErrorCode::from_u32(frame.error_code).unwrap_or(ErrorCode::InternalError),
                    format!("stream reset by peer with code {}", frame.error_code),
                ));
                Ok(())
            }
            _ => Err(SessionError::RstStreamOnInvalidStream(frame.stream_id)),
        }
    }

    fn handle_window_update_frame(&self, frame: &WindowUpdateFrame) -> Result<(), SessionError> {
        if frame.stream_id == 0 {
            // Connection-level flow control is accepted but not
            // enforced.
            debug!(offset = frame.byte_offset, "connection-level window update");
            return Ok(());
        }
        match self.streams().get(&frame.stream_id).cloned() {
            Some(Some(stream)) => {
                stream.update_send_window(frame.byte_offset);
                Ok(())
            }
            _ => Err(SessionError::WindowUpdateOnInvalidStream(frame.stream_id)),
        }
    }

    fn handle_ack_frame(&self, engines: &mut Engines, frame: &AckFrame) -> Result<(), SessionError> {
        let result = engines.sent.received_ack(frame)?;

        if let Some(sample) = result.rtt {
            engines.rtt.update(sample, frame.delay);
        }
        for packet in &result.acked {
            engines.stop_waiting.received_ack_for(packet.number);
        }

        let acked: Vec<PacketInfo> = result
            .acked
            .iter()
            .map(|p| PacketInfo {
                number: p.number,
                length: p.length,
            })
            .collect();
        let lost: Vec<PacketInfo> = result
            .lost
            .iter()
            .map(|p| PacketInfo {
                number: p.number,
                length: p.length,
            })
            .collect();
        let bytes_in_flight = engines.sent.bytes_in_flight();
        engines
            .congestion
            .on_congestion_event(true, bytes_in_flight, &acked, &lost);

        debug!(
            smoothed_rtt = ?engines.rtt.smoothed_rtt(),
            acked = acked.len(),
            lost = lost.len(),
            "processed ack"
        );
        Ok(())
    }

    /// Build and send at most one packet, merging a pending
    /// retransmission, the current stop-waiting frame, one ack, and
    /// whatever stream data fits.
    fn send_packet(&self) -> Result<(), SessionError> {
        let mut engines = self.engines();
        if engines.sent.bytes_in_flight() > engines.congestion.congestion_window() {
            return Ok(());
        }

        let mut control_frames: Vec<Frame> = Vec::new();
        if let Some(retransmission) = engines.sent.dequeue_packet_for_retransmission() {
            debug!(packet = retransmission.number, "dequeueing retransmission");
            let entropy_below = engines.sent.entropy_up_to(retransmission.number);
            engines
                .stop_waiting
                .register_retransmission(&retransmission, entropy_below);
            control_frames.extend(retransmission.control_frames_for_retransmission());
            let mut packer = self.packer();
            for frame in retransmission.stream_frames_for_retransmission() {
                packer.add_high_prio_stream_frame(frame);
            }
        }

        let stop_waiting = engines.stop_waiting.current_frame();
        if let Some(ack) = engines.received.dequeue_ack_frame() {
            control_frames.push(Frame::Ack(ack));
        }

        let packet = self
            .packer()
            .pack_packet(stop_waiting, control_frames, true)?;
        let Some(packet) = packet else {
            return Ok(());
        };

        engines.sent.sent_packet(SentPacket {
            number: packet.number,
            frames: packet.frames.clone(),
            entropy_bit: packet.entropy_bit,
            length: packet.raw.len() as ByteCount,
        });

        let bytes_in_flight = engines.sent.bytes_in_flight();
        engines.congestion.on_packet_sent(
            Instant::now(),
            bytes_in_flight,
            packet.number,
            packet.raw.len() as ByteCount,
            true,
        );

        if stop_waiting.is_some() {
            engines.stop_waiting.sent_with_packet(packet.number);
        }
        drop(engines);

        trace!(
            connection = %self.connection_id,
            packet = packet.number,
            bytes = packet.raw.len(),
            "sending packet"
        );
        self.conn.write(&packet.raw)?;

        if !self.packer().is_empty() {
            self.schedule_sending();
        }
        Ok(())
    }

    /// Queue a stream frame for transmission and signal the loop.
    pub fn queue_stream_frame(&self, frame: StreamFrame) {
        self.packer().add_stream_frame(frame);
        self.schedule_sending();
    }

    /// Signal that there is data to send. Coalescing: while one signal
    /// is pending, further calls are no-ops.
    pub fn schedule_sending(&self) {
        let _ = self.egress_tx.try_send(());
    }

    /// Create a locally-initiated stream.
    pub fn new_stream(self: &Arc<Self>, id: StreamId) -> Result<Arc<Stream>, SessionError> {
        let mut streams = self.streams_mut();
        match streams.get(&id) {
            Some(Some(_)) => Err(SessionError::StreamAlreadyExists(id)),
            Some(None) => Err(SessionError::ReopeningStreamsNotAllowed(id)),
            None => {
                let stream = Arc::new(Stream::new(id, Arc::downgrade(self)));
                streams.insert(id, Some(Arc::clone(&stream)));
                Ok(stream)
            }
        }
    }

    /// Terminate the session. Idempotent: only the first call has side
    /// effects.
    ///
    /// With `send_connection_close`, live streams are failed with the
    /// error and a CONNECTION_CLOSE packet is emitted. If the error is a
    /// decryption failure, a public reset is sent instead: the peer
    /// could not read a sealed close anyway.
    pub fn close(&self, err: Option<QuicError>, send_connection_close: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.close_tx.try_send(());
        (self.close_callback)(self.connection_id);

        if !send_connection_close {
            return;
        }

        let err =
            err.unwrap_or_else(|| QuicError::new(ErrorCode::PeerGoingAway, "peer going away"));
        error!(connection = %self.connection_id, error = %err, "closing session");
        self.close_streams_with_error(&err);

        if err.code == ErrorCode::DecryptionFailure {
            self.send_public_reset(self.last_rcvd_packet_number.load(Ordering::Relaxed));
            return;
        }

        let frame = ConnectionCloseFrame {
            error_code: err.code.as_u32(),
            reason_phrase: err.reason.clone(),
        };
        match self.packer().pack_connection_close(frame) {
            Ok(packet) => {
                if let Err(write_err) = self.conn.write(&packet.raw) {
                    warn!(error = %write_err, "failed to write CONNECTION_CLOSE");
                }
            }
            Err(pack_err) => warn!(error = %pack_err, "failed to pack CONNECTION_CLOSE"),
        }
    }

    fn close_streams_with_error(&self, err: &QuicError) {
        for stream in self.streams().values().flatten() {
            stream.register_error(err.clone());
        }
    }

    fn send_public_reset(&self, rejected_packet_number: PacketNumber) {
        info!(
            connection = %self.connection_id,
            packet = rejected_packet_number,
            "sending public reset"
        );
        let packet = PublicResetPacket {
            connection_id: self.connection_id,
            rejected_packet_number,
            nonce_proof: 0,
        };
        if let Err(err) = self.conn.write(&packet.write()) {
            warn!(error = %err, "failed to write public reset");
        }
    }

    /// Tombstone every stream whose receive side has been fully drained.
    fn garbage_collect_streams(&self) {
        let mut streams = self.streams_mut();
        for (id, slot) in streams.iter_mut() {
            if let Some(stream) = slot {
                if stream.finished_reading() {
                    trace!(stream = *id, "garbage collecting stream");
                    *slot = None;
                }
            }
        }
    }

    fn engines(&self) -> MutexGuard<'_, Engines> {
        self.engines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn packer(&self) -> MutexGuard<'_, PacketPacker> {
        self.packer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn streams(&self) -> RwLockReadGuard<'_, HashMap<StreamId, Option<Arc<Stream>>>> {
        self.streams.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn streams_mut(&self) -> RwLockWriteGuard<'_, HashMap<StreamId, Option<Arc<Stream>>>> {
        self.streams.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Peer-initiated stream ids must be odd.
fn is_valid_peer_stream_id(id: StreamId) -> bool {
    id % 2 == 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use bytes::{Buf, BufMut, BytesMut};

    use crate::frame::StopWaitingFrame;
    use crate::handshake::encode_client_hello;

    #[derive(Default)]
    struct MockConnection {
        written: Mutex<Vec<Bytes>>,
        remote_addrs: Mutex<Vec<SocketAddr>>,
    }

    impl Connection for MockConnection {
        fn write(&self, packet: &[u8]) -> io::Result<()> {
            self.written
                .lock()
                .unwrap()
                .push(Bytes::copy_from_slice(packet));
            Ok(())
        }

        fn set_current_remote_addr(&self, addr: SocketAddr) {
            self.remote_addrs.lock().unwrap().push(addr);
        }
    }

    impl MockConnection {
        fn written(&self) -> Vec<Bytes> {
            self.written.lock().unwrap().clone()
        }
    }

    #[derive(Default)]
    struct Recorded {
        congestion_events: Vec<(Vec<PacketInfo>, Vec<PacketInfo>)>,
        sent: Vec<PacketNumber>,
    }

    struct RecordingSender {
        window: ByteCount,
        state: Arc<Mutex<Recorded>>,
    }

    impl SendAlgorithm for RecordingSender {
        fn on_packet_sent(
            &mut self,
            _sent_time: Instant,
            _bytes_in_flight: ByteCount,
            packet_number: PacketNumber,
            _length: ByteCount,
            _retransmittable: bool,
        ) {
            self.state.lock().unwrap().sent.push(packet_number);
        }

        fn on_congestion_event(
            &mut self,
            _rtt_updated: bool,
            _bytes_in_flight: ByteCount,
            acked: &[PacketInfo],
            lost: &[PacketInfo],
        ) {
            self.state
                .lock()
                .unwrap()
                .congestion_events
                .push((acked.to_vec(), lost.to_vec()));
        }

        fn congestion_window(&self) -> ByteCount {
            self.window
        }
    }

    struct TestEnv {
        session: Arc<Session>,
        conn: Arc<MockConnection>,
        accepted: Arc<Mutex<Vec<Arc<Stream>>>>,
        closed_ids: Arc<Mutex<Vec<ConnectionId>>>,
    }

    fn test_connection_id() -> ConnectionId {
        ConnectionId(0x42)
    }

    fn test_addr() -> SocketAddr {
        "127.0.0.1:4433".parse().unwrap()
    }

    fn build_session() -> TestEnv {
        let conn = Arc::new(MockConnection::default());
        let accepted = Arc::new(Mutex::new(Vec::new()));
        let closed_ids = Arc::new(Mutex::new(Vec::new()));
        let accepted_cb = Arc::clone(&accepted);
        let closed_cb = Arc::clone(&closed_ids);
        let session = Session::new(
            Arc::clone(&conn) as Arc<dyn Connection>,
            VersionNumber(1),
            test_connection_id(),
            ServerConfig::new([9u8; 32]),
            Box::new(move |_, stream| accepted_cb.lock().unwrap().push(stream)),
            Box::new(move |id| closed_cb.lock().unwrap().push(id)),
        );
        TestEnv {
            session,
            conn,
            accepted,
            closed_ids,
        }
    }

    fn null_crypto() -> CryptoSetup {
        CryptoSetup::new(ServerConfig::new([0u8; 32]), Arc::new(ConnectionParams::new()))
    }

    fn truncate(packet_number: PacketNumber, len: u8) -> PacketNumber {
        if len >= 8 {
            packet_number
        } else {
            packet_number & ((1u64 << (8 * u32::from(len))) - 1)
        }
    }

    // The null protector is keyless, so any CryptoSetup can craft
    // packets this session will accept during the handshake phase.
    fn craft_packet_with_len(
        packet_number: PacketNumber,
        packet_number_len: u8,
        frames: &[Frame],
    ) -> ReceivedPacket {
        let header = PublicHeader {
            connection_id: test_connection_id(),
            version: None,
            packet_number: truncate(packet_number, packet_number_len),
            packet_number_len,
        };
        let mut raw_header = BytesMut::new();
        header.write(&mut raw_header);
        let raw_header = raw_header.freeze();

        let mut plaintext = BytesMut::new();
        plaintext.put_u8(0);
        for frame in frames {
            frame.write(&mut plaintext);
        }
        let sealed = null_crypto()
            .seal(packet_number, &raw_header, &plaintext)
            .unwrap();
        ReceivedPacket {
            remote_addr: test_addr(),
            header,
            raw_header,
            payload: Bytes::from(sealed),
        }
    }

    fn craft_packet(packet_number: PacketNumber, frames: &[Frame]) -> ReceivedPacket {
        craft_packet_with_len(packet_number, 6, frames)
    }

    fn send_to_session(env: &TestEnv, packet: ReceivedPacket) {
        env.session
            .handle_packet(packet.remote_addr, packet.header, packet.raw_header, packet.payload);
    }

    fn decode_packet(raw: &Bytes) -> (PublicHeader, Vec<Frame>) {
        let mut cursor = raw.clone();
        let header = PublicHeader::parse(&mut cursor).unwrap();
        let header_bytes = raw.slice(..raw.len() - cursor.len());
        let plaintext = null_crypto()
            .open(header.packet_number, &header_bytes, &cursor)
            .unwrap();
        let mut body = Bytes::from(plaintext);
        let _private_flags = body.get_u8();
        let mut frames = Vec::new();
        while body.has_remaining() {
            frames.push(Frame::parse(&mut body).unwrap());
        }
        (header, frames)
    }

    fn stream_frame(stream_id: StreamId, offset: u64, data: &'static [u8], fin: bool) -> Frame {
        Frame::Stream(StreamFrame {
            stream_id,
            offset,
            data: Bytes::from_static(data),
            fin,
        })
    }

    #[tokio::test]
    async fn test_ping_only_packet_schedules_ack() {
        let env = build_session();
        env.session
            .handle_received_packet(craft_packet(1, &[Frame::Ping]))
            .unwrap();

        assert_eq!(
            env.session.last_rcvd_packet_number.load(Ordering::Relaxed),
            1
        );
        let ack = env.session.engines().received.dequeue_ack_frame().unwrap();
        assert_eq!(ack.largest_observed, 1);

        // No stream was created and no callback fired.
        assert_eq!(env.session.streams().len(), 1);
        assert!(env.accepted.lock().unwrap().is_empty());

        // The remote address was recorded.
        assert_eq!(
            env.conn.remote_addrs.lock().unwrap().last().copied(),
            Some(test_addr())
        );
    }

    #[tokio::test]
    async fn test_even_stream_id_rejected() {
        let env = build_session();
        let err = env
            .session
            .handle_received_packet(craft_packet(1, &[stream_frame(4, 0, b"x", false)]))
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidStreamId(4)));
        assert_eq!(env.session.streams().len(), 1);
    }

    #[tokio::test]
    async fn test_stream_callback_fires_after_frame_is_buffered() {
        let env = build_session();
        env.session
            .handle_received_packet(craft_packet(1, &[stream_frame(3, 0, b"hello", false)]))
            .unwrap();

        let accepted = env.accepted.lock().unwrap().clone();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].id(), 3);

        // The first frame is already readable from the callback's point
        // of view.
        let mut buf = [0u8; 8];
        let n = accepted[0].read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn test_reopening_tombstoned_stream_rejected() {
        let env = build_session();
        env.session
            .handle_received_packet(craft_packet(1, &[stream_frame(5, 0, b"abc", true)]))
            .unwrap();

        let stream = env.accepted.lock().unwrap()[0].clone();
        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 3);
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);

        env.session.garbage_collect_streams();
        assert!(matches!(env.session.streams().get(&5), Some(None)));

        let err = env
            .session
            .handle_received_packet(craft_packet(2, &[stream_frame(5, 0, b"again", false)]))
            .unwrap_err();
        assert!(matches!(err, SessionError::ReopeningStreamsNotAllowed(5)));

        // Local creation of a retired id is rejected too.
        assert!(env.session.new_stream(5).is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let env = build_session();
        env.session
            .close(Some(QuicError::new(ErrorCode::InternalError, "boom")), true);
        env.session
            .close(Some(QuicError::new(ErrorCode::InternalError, "again")), true);

        assert!(env.session.is_closed());
        assert_eq!(env.closed_ids.lock().unwrap().as_slice(), &[test_connection_id()]);
        assert_eq!(env.conn.written().len(), 1);

        let (_, frames) = decode_packet(&env.conn.written()[0]);
        assert!(matches!(
            &frames[0],
            Frame::ConnectionClose(f) if f.error_code == ErrorCode::InternalError.as_u32()
        ));
    }

    #[tokio::test]
    async fn test_close_without_error_sends_peer_going_away() {
        let env = build_session();
        let stream = env.session.new_stream(2).unwrap();

        env.session.close(None, true);

        let (_, frames) = decode_packet(&env.conn.written()[0]);
        assert!(matches!(
            &frames[0],
            Frame::ConnectionClose(f) if f.error_code == ErrorCode::PeerGoingAway.as_u32()
        ));

        // Live streams observe the terminal error.
        assert_eq!(stream.error().unwrap().code, ErrorCode::PeerGoingAway);
    }

    #[tokio::test]
    async fn test_decryption_failure_close_sends_public_reset() {
        let env = build_session();
        env.session
            .handle_received_packet(craft_packet(7, &[Frame::Ping]))
            .unwrap();

        env.session.close(
            Some(QuicError::new(ErrorCode::DecryptionFailure, "cannot decrypt")),
            true,
        );

        let written = env.conn.written();
        assert_eq!(written.len(), 1);
        let reset = PublicResetPacket::parse(&mut written[0].clone()).unwrap();
        assert_eq!(reset.connection_id, test_connection_id());
        assert_eq!(reset.rejected_packet_number, 7);
        assert_eq!(reset.nonce_proof, 0);
    }

    #[tokio::test]
    async fn test_peer_connection_close_terminates_without_reply() {
        let env = build_session();
        env.session
            .handle_received_packet(craft_packet(
                1,
                &[Frame::ConnectionClose(ConnectionCloseFrame {
                    error_code: ErrorCode::PeerGoingAway.as_u32(),
                    reason_phrase: "done".to_string(),
                })],
            ))
            .unwrap();

        assert!(env.session.is_closed());
        assert_eq!(env.closed_ids.lock().unwrap().len(), 1);
        assert!(env.conn.written().is_empty());
    }

    #[tokio::test]
    async fn test_ack_updates_rtt_and_congestion() {
        let env = build_session();
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        env.session.engines().congestion = Box::new(RecordingSender {
            window: u64::MAX,
            state: Arc::clone(&recorded),
        });

        env.session.engines().sent.sent_packet(SentPacket {
            number: 10,
            frames: vec![Frame::Ping],
            entropy_bit: false,
            length: 100,
        });

        let entropy = env.session.engines().sent.entropy_up_to(10);
        let ack = AckFrame {
            largest_observed: 10,
            entropy,
            delay: Duration::from_millis(5),
            missing: Vec::new(),
        };
        env.session
            .handle_received_packet(craft_packet(1, &[Frame::Ack(ack)]))
            .unwrap();

        assert!(env.session.engines().rtt.smoothed_rtt().is_some());
        let recorded = recorded.lock().unwrap();
        assert_eq!(recorded.congestion_events.len(), 1);
        let (acked, lost) = &recorded.congestion_events[0];
        assert_eq!(acked.as_slice(), &[PacketInfo { number: 10, length: 100 }]);
        assert!(lost.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_ack_is_swallowed_by_disposition() {
        let env = build_session();
        env.session.engines().sent.sent_packet(SentPacket {
            number: 1,
            frames: vec![Frame::Ping],
            entropy_bit: false,
            length: 100,
        });
        let entropy = env.session.engines().sent.entropy_up_to(1);
        let ack = AckFrame {
            largest_observed: 1,
            entropy,
            delay: Duration::ZERO,
            missing: Vec::new(),
        };
        env.session
            .handle_received_packet(craft_packet(1, &[Frame::Ack(ack.clone())]))
            .unwrap();

        // The same ack again surfaces the soft recovery error.
        let err = env
            .session
            .handle_received_packet(craft_packet(2, &[Frame::Ack(ack)]))
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Recovery(RecoveryError::DuplicateOrOutOfOrderAck)
        ));
    }

    #[tokio::test]
    async fn test_send_packet_respects_congestion_window() {
        let env = build_session();
        env.session.engines().congestion = Box::new(RecordingSender {
            window: 0,
            state: Arc::new(Mutex::new(Recorded::default())),
        });
        env.session.engines().sent.sent_packet(SentPacket {
            number: 1,
            frames: vec![Frame::Ping],
            entropy_bit: false,
            length: 100,
        });

        env.session.queue_stream_frame(StreamFrame {
            stream_id: 3,
            offset: 0,
            data: Bytes::from_static(b"blocked"),
            fin: false,
        });
        env.session.send_packet().unwrap();

        // Congestion blocks the send; the data stays queued.
        assert!(env.conn.written().is_empty());
        assert!(!env.session.packer().is_empty());
    }

    #[tokio::test]
    async fn test_retransmission_path() {
        let env = build_session();
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        env.session.engines().congestion = Box::new(RecordingSender {
            window: u64::MAX,
            state: Arc::clone(&recorded),
        });

        // Five packets in flight; packet 1 carries a stream frame and a
        // window update.
        {
            let mut engines = env.session.engines();
            engines.sent.sent_packet(SentPacket {
                number: 1,
                frames: vec![
                    stream_frame(3, 100, b"abc", false),
                    Frame::WindowUpdate(WindowUpdateFrame {
                        stream_id: 3,
                        byte_offset: 4096,
                    }),
                ],
                entropy_bit: false,
                length: 100,
            });
            for number in 2..=5u64 {
                engines.sent.sent_packet(SentPacket {
                    number,
                    frames: vec![Frame::Ping],
                    entropy_bit: false,
                    length: 100,
                });
            }
        }
        env.session.packer().set_last_packet_number(5);

        // Three acks reporting packet 1 missing declare it lost.
        for (inbound, largest) in [(1u64, 2u64), (2, 3), (3, 4)] {
            let entropy = env.session.engines().sent.entropy_up_to(largest);
            env.session
                .handle_received_packet(craft_packet(
                    inbound,
                    &[Frame::Ack(AckFrame {
                        largest_observed: largest,
                        entropy,
                        delay: Duration::ZERO,
                        missing: vec![1],
                    })],
                ))
                .unwrap();
        }

        // New application data is queued behind the retransmission.
        env.session.queue_stream_frame(StreamFrame {
            stream_id: 7,
            offset: 0,
            data: Bytes::from_static(b"new data"),
            fin: false,
        });

        env.session.send_packet().unwrap();

        let written = env.conn.written();
        assert_eq!(written.len(), 1);
        let (_, frames) = decode_packet(&written[0]);

        assert!(matches!(
            frames[0],
            Frame::StopWaiting(StopWaitingFrame { least_unacked: 2, .. })
        ));
        assert!(frames
            .iter()
            .any(|f| matches!(f, Frame::WindowUpdate(w) if w.stream_id == 3)));

        // The retransmitted stream frame precedes the new data.
        let stream_frames: Vec<&StreamFrame> = frames
            .iter()
            .filter_map(|f| match f {
                Frame::Stream(f) => Some(f),
                _ => None,
            })
            .collect();
        assert_eq!(stream_frames[0].stream_id, 3);
        assert_eq!(stream_frames[0].offset, 100);
        assert_eq!(stream_frames[0].data.as_ref(), b"abc");
        assert_eq!(stream_frames[1].stream_id, 7);

        // The new packet is registered with loss recovery and reported
        // to the congestion controller.
        assert!(env.session.engines().sent.bytes_in_flight() > 0);
        assert_eq!(recorded.lock().unwrap().sent.as_slice(), &[6]);
    }

    #[tokio::test]
    async fn test_egress_signal_coalesces() {
        let env = build_session();
        env.session.queue_stream_frame(StreamFrame {
            stream_id: 3,
            offset: 0,
            data: Bytes::from_static(b"one"),
            fin: false,
        });
        env.session.queue_stream_frame(StreamFrame {
            stream_id: 3,
            offset: 3,
            data: Bytes::from_static(b"two"),
            fin: false,
        });

        let mut egress = env.session.take_receiver(&env.session.egress_rx).unwrap();
        assert!(egress.try_recv().is_ok());
        assert!(egress.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rst_stream_on_unknown_stream_is_soft() {
        let env = build_session();
        let err = env
            .session
            .handle_received_packet(craft_packet(
                1,
                &[Frame::RstStream(RstStreamFrame {
                    stream_id: 99,
                    error_code: 1,
                    byte_offset: 0,
                })],
            ))
            .unwrap_err();
        assert!(matches!(err, SessionError::RstStreamOnInvalidStream(99)));
    }

    #[tokio::test]
    async fn test_rst_stream_registers_error_on_live_stream() {
        let env = build_session();
        env.session
            .handle_received_packet(craft_packet(1, &[stream_frame(3, 0, b"x", false)]))
            .unwrap();
        env.session
            .handle_received_packet(craft_packet(
                2,
                &[Frame::RstStream(RstStreamFrame {
                    stream_id: 3,
                    error_code: 99,
                    byte_offset: 1,
                })],
            ))
            .unwrap();

        let stream = env.accepted.lock().unwrap()[0].clone();
        let err = stream.error().unwrap();
        assert!(err.reason.contains("99"));
    }

    #[tokio::test]
    async fn test_window_update_dispatch() {
        let env = build_session();
        env.session
            .handle_received_packet(craft_packet(1, &[stream_frame(3, 0, b"x", false)]))
            .unwrap();
        let stream = env.accepted.lock().unwrap()[0].clone();
        let initial = stream.send_window();

        // Stream-level update raises the stream's send window.
        env.session
            .handle_received_packet(craft_packet(
                2,
                &[Frame::WindowUpdate(WindowUpdateFrame {
                    stream_id: 3,
                    byte_offset: initial + 5000,
                })],
            ))
            .unwrap();
        assert_eq!(stream.send_window(), initial + 5000);

        // Connection-level updates are accepted and ignored.
        env.session
            .handle_received_packet(craft_packet(
                3,
                &[Frame::WindowUpdate(WindowUpdateFrame {
                    stream_id: 0,
                    byte_offset: 1 << 30,
                })],
            ))
            .unwrap();

        // Updates for unknown streams are an error.
        let err = env
            .session
            .handle_received_packet(craft_packet(
                4,
                &[Frame::WindowUpdate(WindowUpdateFrame {
                    stream_id: 11,
                    byte_offset: 1,
                })],
            ))
            .unwrap_err();
        assert!(matches!(err, SessionError::WindowUpdateOnInvalidStream(11)));
    }

    #[tokio::test]
    async fn test_packet_number_reconstruction_is_monotone() {
        let env = build_session();
        for expected in 1..300u64 {
            env.session
                .handle_received_packet(craft_packet_with_len(expected, 1, &[Frame::Ping]))
                .unwrap();
            assert_eq!(
                env.session.last_rcvd_packet_number.load(Ordering::Relaxed),
                expected
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_closes_session() {
        let env = build_session();
        let loop_handle = tokio::spawn(Arc::clone(&env.session).run());

        // With no traffic the idle timer is the only pending event; the
        // loop closes the session and exits.
        loop_handle.await.unwrap();

        assert!(env.session.is_closed());
        let written = env.conn.written();
        assert_eq!(written.len(), 1);
        let (_, frames) = decode_packet(&written[0]);
        assert!(matches!(
            &frames[0],
            Frame::ConnectionClose(f)
                if f.error_code == ErrorCode::NetworkIdleTimeout.as_u32()
        ));
    }

    #[tokio::test]
    async fn test_loop_closes_on_fatal_dispatch_error() {
        let env = build_session();
        tokio::spawn(Arc::clone(&env.session).run());

        // An even peer stream id is a fatal protocol violation.
        send_to_session(&env, craft_packet(1, &[stream_frame(4, 0, b"x", false)]));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(env.session.is_closed());
        let has_close = env.conn.written().iter().any(|raw| {
            let (_, frames) = decode_packet(raw);
            frames.iter().any(|f| matches!(
                f,
                Frame::ConnectionClose(c) if c.error_code == ErrorCode::InvalidStreamId.as_u32()
            ))
        });
        assert!(has_close);
    }

    #[tokio::test]
    async fn test_loop_survives_soft_errors() {
        let env = build_session();
        tokio::spawn(Arc::clone(&env.session).run());

        send_to_session(
            &env,
            craft_packet(
                1,
                &[Frame::RstStream(RstStreamFrame {
                    stream_id: 99,
                    error_code: 1,
                    byte_offset: 0,
                })],
            ),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!env.session.is_closed());
    }

    #[tokio::test]
    async fn test_happy_path_open_read_close() {
        let env = build_session();
        tokio::spawn(Arc::clone(&env.session).run());

        // Peer opens stream 3 with FIN.
        send_to_session(&env, craft_packet(1, &[stream_frame(3, 0, b"hi", true)]));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stream = env.accepted.lock().unwrap()[0].clone();
        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 2);
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);

        // Any loop iteration garbage-collects the drained stream.
        send_to_session(&env, craft_packet(2, &[Frame::Ping]));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(env.session.streams().get(&3), Some(None)));

        // Peer closes; the session terminates without sending its own
        // CONNECTION_CLOSE.
        send_to_session(
            &env,
            craft_packet(
                3,
                &[Frame::ConnectionClose(ConnectionCloseFrame {
                    error_code: ErrorCode::PeerGoingAway.as_u32(),
                    reason_phrase: "bye".to_string(),
                })],
            ),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(env.session.is_closed());
        assert_eq!(env.closed_ids.lock().unwrap().as_slice(), &[test_connection_id()]);
        for raw in env.conn.written() {
            let (_, frames) = decode_packet(&raw);
            assert!(!frames.iter().any(|f| matches!(f, Frame::ConnectionClose(_))));
        }
    }

    #[tokio::test]
    async fn test_handshake_completes_and_answers() {
        let env = build_session();
        tokio::spawn(Arc::clone(&env.session).run());

        let hello = encode_client_hello(&[0x11u8; 32], Duration::from_secs(45));
        let frame = Frame::Stream(StreamFrame {
            stream_id: CRYPTO_STREAM_ID,
            offset: 0,
            data: hello,
            fin: false,
        });
        send_to_session(&env, craft_packet(1, &[frame]));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(
            env.session.connection_params().idle_connection_state_lifetime(),
            Duration::from_secs(45)
        );
        assert!(env.session.crypto.is_forward_secure());

        // The server hello went out on the crypto stream, still sealed
        // with the null protector.
        let mut found_server_hello = false;
        for raw in env.conn.written() {
            let (_, frames) = decode_packet(&raw);
            for frame in frames {
                if let Frame::Stream(f) = frame {
                    if f.stream_id == CRYPTO_STREAM_ID && f.data.first() == Some(&0x02) {
                        found_server_hello = true;
                    }
                }
            }
        }
        assert!(found_server_hello);
    }
}
