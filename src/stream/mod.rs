//! Per-stream state: receive-side reassembly and flow control, the
//! send-side write path, and the terminal error register.
//!
//! A stream holds a non-owning back-reference to its session so writes
//! can schedule sending; the session outlives its streams by
//! construction.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError, Weak};

use bytes::{Buf, Bytes, BytesMut};
use tokio::sync::Notify;

use crate::core::constants::{INITIAL_SEND_STREAM_FLOW_WINDOW, RECEIVE_STREAM_FLOW_WINDOW};
use crate::core::types::{ByteCount, ErrorCode, QuicError, StreamId};
use crate::frame::StreamFrame;
use crate::session::Session;

/// One QUIC stream.
pub struct Stream {
    id: StreamId,
    session: Weak<Session>,
    inner: Mutex<StreamInner>,
    readable: Notify,
}

struct StreamInner {
    /// Received segments keyed by stream offset.
    segments: BTreeMap<u64, Bytes>,
    /// Everything below this offset has been handed to the reader.
    read_offset: u64,
    /// Total stream length, once a FIN has arrived.
    fin_offset: Option<u64>,
    /// Highest received byte, for FIN validation.
    highest_received: u64,
    recv_window: ByteCount,
    send_window: ByteCount,
    write_offset: u64,
    fin_sent: bool,
    /// Terminal error; set once, wins over buffered data for readers.
    error: Option<QuicError>,
}

impl Stream {
    pub(crate) fn new(id: StreamId, session: Weak<Session>) -> Self {
        Self {
            id,
            session,
            inner: Mutex::new(StreamInner {
                segments: BTreeMap::new(),
                read_offset: 0,
                fin_offset: None,
                highest_received: 0,
                recv_window: RECEIVE_STREAM_FLOW_WINDOW,
                send_window: INITIAL_SEND_STREAM_FLOW_WINDOW,
                write_offset: 0,
                fin_sent: false,
                error: None,
            }),
            readable: Notify::new(),
        }
    }

    /// The stream's id.
    pub fn id(&self) -> StreamId {
        self.id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StreamInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a received frame to the reassembly buffer.
    ///
    /// Enforces the receive flow-control window and FIN consistency;
    /// duplicate and overlapping data is tolerated.
    pub(crate) fn add_stream_frame(&self, frame: &StreamFrame) -> Result<(), QuicError> {
        let mut inner = self.lock();
        let end = frame.offset + frame.data.len() as u64;

        if let Some(fin_offset) = inner.fin_offset {
            if end > fin_offset || (frame.fin && end != fin_offset) {
                return Err(QuicError::new(
                    ErrorCode::StreamDataAfterTermination,
                    format!("data past the end of stream {}", self.id),
                ));
            }
        }
        if frame.fin {
            if end < inner.highest_received {
                return Err(QuicError::new(
                    ErrorCode::StreamDataAfterTermination,
                    format!("fin before already-received data on stream {}", self.id),
                ));
            }
            inner.fin_offset = Some(end);
        }
        if end > inner.recv_window {
            return Err(QuicError::new(
                ErrorCode::FlowControlReceivedTooMuchData,
                format!("stream {} exceeded its flow control window", self.id),
            ));
        }

        inner.highest_received = inner.highest_received.max(end);
        if !frame.data.is_empty() && end > inner.read_offset {
            // Keep the longer segment when the same offset arrives twice.
            let replace = match inner.segments.get(&frame.offset) {
                Some(existing) => existing.len() < frame.data.len(),
                None => true,
            };
            if replace {
                inner.segments.insert(frame.offset, frame.data.clone());
            }
        }
        drop(inner);

        self.readable.notify_one();
        Ok(())
    }

    /// Read available data into `buf`.
    ///
    /// Waits until data is available, the stream ends (returns
    /// `Ok(0)`), or a terminal error is registered.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, QuicError> {
        loop {
            let notified = self.readable.notified();
            {
                let mut inner = self.lock();
                if let Some(err) = &inner.error {
                    return Err(err.clone());
                }
                if let Some(n) = inner.pop_available(buf) {
                    return Ok(n);
                }
                if inner.fin_offset == Some(inner.read_offset) {
                    return Ok(0);
                }
            }
            notified.await;
        }
    }

    /// Read exactly `len` bytes, failing if the stream ends first.
    pub async fn read_exact(&self, len: usize) -> Result<Bytes, QuicError> {
        let mut out = BytesMut::with_capacity(len);
        let mut buf = vec![0u8; len];
        while out.len() < len {
            let n = self.read(&mut buf[..len - out.len()]).await?;
            if n == 0 {
                return Err(QuicError::new(
                    ErrorCode::InternalError,
                    format!("stream {} ended mid-message", self.id),
                ));
            }
            out.extend_from_slice(&buf[..n]);
        }
        Ok(out.freeze())
    }

    /// Queue data for transmission on this stream.
    pub fn write(&self, data: Bytes) -> Result<(), QuicError> {
        let frame = {
            let mut inner = self.lock();
            if let Some(err) = &inner.error {
                return Err(err.clone());
            }
            if inner.fin_sent {
                return Err(QuicError::new(
                    ErrorCode::StreamDataAfterTermination,
                    format!("write on finished stream {}", self.id),
                ));
            }
            let frame = StreamFrame {
                stream_id: self.id,
                offset: inner.write_offset,
                data,
                fin: false,
            };
            inner.write_offset += frame.data.len() as u64;
            frame
        };
        self.queue(frame)
    }

    /// Close the send direction, queuing a FIN.
    pub fn finish(&self) -> Result<(), QuicError> {
        let frame = {
            let mut inner = self.lock();
            if inner.fin_sent {
                return Ok(());
            }
            inner.fin_sent = true;
            StreamFrame {
                stream_id: self.id,
                offset: inner.write_offset,
                data: Bytes::new(),
                fin: true,
            }
        };
        self.queue(frame)
    }

    fn queue(&self, frame: StreamFrame) -> Result<(), QuicError> {
        let session = self.session.upgrade().ok_or_else(|| {
            QuicError::new(
                ErrorCode::InternalError,
                "session is gone",
            )
        })?;
        session.queue_stream_frame(frame);
        Ok(())
    }

    /// Record a terminal error; pending and future readers observe it.
    /// The first error wins.
    pub(crate) fn register_error(&self, err: QuicError) {
        {
            let mut inner = self.lock();
            if inner.error.is_none() {
                inner.error = Some(err);
            }
        }
        self.readable.notify_one();
    }

    /// The terminal error, if one has been registered.
    pub fn error(&self) -> Option<QuicError> {
        self.lock().error.clone()
    }

    /// Raise the send-side flow control window. Lower offsets are
    /// ignored.
    pub(crate) fn update_send_window(&self, byte_offset: ByteCount) {
        let mut inner = self.lock();
        inner.send_window = inner.send_window.max(byte_offset);
    }

    /// The current send-side flow control window.
    pub fn send_window(&self) -> ByteCount {
        self.lock().send_window
    }

    /// Whether the receive side has been fully drained by the reader.
    /// Streams in this state are garbage-collected by the session.
    pub(crate) fn finished_reading(&self) -> bool {
        let inner = self.lock();
        inner.fin_offset == Some(inner.read_offset)
    }
}

impl StreamInner {
    /// Copy contiguous data at the read offset into `buf`, dropping
    /// fully-consumed segments. Returns `None` when nothing is
    /// readable yet.
    fn pop_available(&mut self, buf: &mut [u8]) -> Option<usize> {
        let mut copied = 0;
        while copied < buf.len() {
            let Some((&offset, _)) = self.segments.iter().next() else {
                break;
            };
            if offset > self.read_offset {
                break;
            }
            let Some(mut data) = self.segments.remove(&offset) else {
                break;
            };
            let skip = (self.read_offset - offset) as usize;
            if skip >= data.len() {
                continue;
            }
            data.advance(skip);

            let n = data.len().min(buf.len() - copied);
            buf[copied..copied + n].copy_from_slice(&data[..n]);
            copied += n;
            self.read_offset += n as u64;
            if n < data.len() {
                data.advance(n);
                self.segments.insert(self.read_offset, data);
                break;
            }
        }
        (copied > 0).then_some(copied)
    }
}
