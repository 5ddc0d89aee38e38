//! Stop-waiting frame lifecycle.
//!
//! Whenever a packet is retransmitted its old number is abandoned, so
//! the peer must be told not to wait for it. The manager keeps the
//! current STOP_WAITING frame alive until an ack proves the peer has
//! seen the packet that carried it.

use crate::ack::sent::SentPacket;
use crate::core::types::PacketNumber;
use crate::frame::StopWaitingFrame;

/// Tracks which STOP_WAITING frame, if any, still needs to reach the
/// peer.
#[derive(Debug, Default)]
pub struct StopWaitingManager {
    current: Option<StopWaitingFrame>,
    sent_with: Option<PacketNumber>,
}

impl StopWaitingManager {
    /// Create a manager with nothing to announce.
    pub fn new() -> Self {
        Self::default()
    }

    /// A packet is being retransmitted: the peer must stop waiting for
    /// its original number. `entropy_below` is the cumulative entropy of
    /// all packets up to and including the abandoned number.
    pub fn register_retransmission(&mut self, packet: &SentPacket, entropy_below: u8) {
        let least_unacked = packet.number + 1;
        match &self.current {
            Some(frame) if frame.least_unacked >= least_unacked => {}
            _ => {
                self.current = Some(StopWaitingFrame {
                    least_unacked,
                    entropy: entropy_below,
                });
                self.sent_with = None;
            }
        }
    }

    /// The frame to include in the next packet, if any.
    pub fn current_frame(&self) -> Option<StopWaitingFrame> {
        self.current
    }

    /// The current frame was just sent in the given packet.
    pub fn sent_with_packet(&mut self, number: PacketNumber) {
        if self.current.is_some() {
            self.sent_with = Some(number);
        }
    }

    /// The peer acknowledged the given packet; if it carried the current
    /// frame, the announcement is complete.
    pub fn received_ack_for(&mut self, number: PacketNumber) {
        if let Some(sent_with) = self.sent_with {
            if number >= sent_with {
                self.current = None;
                self.sent_with = None;
            }
        }
    }
}
