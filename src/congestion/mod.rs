//! Congestion control: the send-algorithm seam the session drives, and
//! a Reno-style implementation of it.

pub mod rtt;

pub use rtt::RttEstimator;

use std::time::Instant;

use crate::core::constants::{
    DEFAULT_MSS, INITIAL_CONGESTION_WINDOW_PACKETS, MAX_CONGESTION_WINDOW_PACKETS,
    MIN_CONGESTION_WINDOW_PACKETS,
};
use crate::core::types::{ByteCount, PacketNumber};

/// Number and length of a packet, as reported to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    /// Packet number.
    pub number: PacketNumber,
    /// Size on the wire.
    pub length: ByteCount,
}

/// The congestion-control seam the session drives.
///
/// The session reports every sent packet and every congestion event
/// (processed ack); the controller answers with the current window.
pub trait SendAlgorithm: Send {
    /// A packet was handed to the wire.
    fn on_packet_sent(
        &mut self,
        sent_time: Instant,
        bytes_in_flight: ByteCount,
        packet_number: PacketNumber,
        length: ByteCount,
        retransmittable: bool,
    );

    /// An ack was processed into newly acked and newly lost packets.
    fn on_congestion_event(
        &mut self,
        rtt_updated: bool,
        bytes_in_flight: ByteCount,
        acked: &[PacketInfo],
        lost: &[PacketInfo],
    );

    /// The current congestion window in bytes.
    fn congestion_window(&self) -> ByteCount;
}

/// Reno-style sender: slow start up to a threshold, linear growth
/// beyond it, multiplicative decrease on loss (at most once per
/// in-flight generation).
#[derive(Debug)]
pub struct RenoSender {
    window: ByteCount,
    ssthresh: ByteCount,
    largest_sent: PacketNumber,
    /// Losses at or below this number belong to an already-handled
    /// congestion event and do not shrink the window again.
    recovery_until: PacketNumber,
}

impl RenoSender {
    /// Create a sender with the protocol's initial window.
    pub fn new() -> Self {
        Self {
            window: INITIAL_CONGESTION_WINDOW_PACKETS * DEFAULT_MSS,
            ssthresh: MAX_CONGESTION_WINDOW_PACKETS * DEFAULT_MSS,
            largest_sent: 0,
            recovery_until: 0,
        }
    }

    fn max_window() -> ByteCount {
        MAX_CONGESTION_WINDOW_PACKETS * DEFAULT_MSS
    }

    fn min_window() -> ByteCount {
        MIN_CONGESTION_WINDOW_PACKETS * DEFAULT_MSS
    }
}

impl Default for RenoSender {
    fn default() -> Self {
        Self::new()
    }
}

impl SendAlgorithm for RenoSender {
    fn on_packet_sent(
        &mut self,
        _sent_time: Instant,
        _bytes_in_flight: ByteCount,
        packet_number: PacketNumber,
        _length: ByteCount,
        _retransmittable: bool,
    ) {
        self.largest_sent = self.largest_sent.max(packet_number);
    }

    fn on_congestion_event(
        &mut self,
        _rtt_updated: bool,
        _bytes_in_flight: ByteCount,
        acked: &[PacketInfo],
        lost: &[PacketInfo],
    ) {
        for packet in lost {
            if packet.number > self.recovery_until {
                self.window = (self.window / 2).max(Self::min_window());
                self.ssthresh = self.window;
                self.recovery_until = self.largest_sent;
            }
        }

        for packet in acked {
            if self.window < self.ssthresh {
                // Slow start: one MSS-equivalent per acked byte.
                self.window = (self.window + packet.length).min(Self::max_window());
            } else {
                // Congestion avoidance: roughly one MSS per window.
                let increment = DEFAULT_MSS * packet.length / self.window.max(1);
                self.window = (self.window + increment).min(Self::max_window());
            }
        }
    }

    fn congestion_window(&self) -> ByteCount {
        self.window
    }
}
