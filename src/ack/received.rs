//! Receive-side ack scheduling.
//!
//! Records every accepted packet number together with its entropy bit,
//! and produces at most one ACK frame per burst of new packets. A
//! STOP_WAITING frame from the peer re-anchors the tracked range so old
//! ack state can be dropped.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::ack::EntropyAccumulator;
use crate::core::constants::MAX_NACKS_PER_ACK;
use crate::core::types::PacketNumber;
use crate::frame::{AckFrame, StopWaitingFrame};

/// Tracks received packets and schedules acknowledgements.
#[derive(Debug, Default)]
pub struct ReceivedPacketHandler {
    largest_observed: PacketNumber,
    largest_observed_at: Option<Instant>,
    /// Lower bound set by the peer's STOP_WAITING; packets below it are
    /// no longer tracked or reported missing.
    ignore_below: PacketNumber,
    /// Received packet numbers and their entropy bits.
    received: BTreeMap<PacketNumber, bool>,
    entropy: EntropyAccumulator,
    ack_pending: bool,
}

impl ReceivedPacketHandler {
    /// Create an empty handler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one accepted packet. Duplicates and packets below the
    /// stop-waiting anchor are ignored.
    pub fn received_packet(&mut self, number: PacketNumber, entropy_bit: bool) {
        if number < self.ignore_below || self.received.contains_key(&number) {
            return;
        }
        self.received.insert(number, entropy_bit);
        self.entropy.add(number, entropy_bit);
        if number > self.largest_observed {
            self.largest_observed = number;
            self.largest_observed_at = Some(Instant::now());
        }
        self.ack_pending = true;
    }

    /// Apply the peer's STOP_WAITING: drop state below the new anchor
    /// and rebase the entropy on the value the peer vouches for.
    pub fn received_stop_waiting(&mut self, frame: &StopWaitingFrame) {
        if frame.least_unacked <= self.ignore_below {
            return;
        }
        self.ignore_below = frame.least_unacked;
        self.received = self.received.split_off(&frame.least_unacked);

        let mut entropy = EntropyAccumulator::from_value(frame.entropy);
        for (number, bit) in &self.received {
            entropy.add(*number, *bit);
        }
        self.entropy = entropy;
    }

    /// Produce an ACK frame if new packets arrived since the last one.
    pub fn dequeue_ack_frame(&mut self) -> Option<AckFrame> {
        if !self.ack_pending || self.largest_observed == 0 {
            return None;
        }
        self.ack_pending = false;

        let mut missing = Vec::new();
        let floor = self.ignore_below.max(1);
        for number in floor..self.largest_observed {
            if !self.received.contains_key(&number) {
                missing.push(number);
                if missing.len() >= MAX_NACKS_PER_ACK {
                    break;
                }
            }
        }

        let delay = self
            .largest_observed_at
            .map(|at| at.elapsed())
            .unwrap_or(Duration::ZERO);

        Some(AckFrame {
            largest_observed: self.largest_observed,
            entropy: self.entropy.value(),
            delay,
            missing,
        })
    }

    /// Highest packet number accepted so far.
    pub fn largest_observed(&self) -> PacketNumber {
        self.largest_observed
    }
}
