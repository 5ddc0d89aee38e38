//! Loss recovery for sent packets.
//!
//! Tracks every packet handed to the wire, processes incoming ACK
//! frames into (rtt sample, newly acked, newly lost) triples, and
//! queues lost packets for retransmission once they have been reported
//! missing often enough.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use crate::ack::EntropyAccumulator;
use crate::core::constants::RETRANSMISSION_THRESHOLD;
use crate::core::error::RecoveryError;
use crate::core::types::{ByteCount, PacketNumber};
use crate::frame::{AckFrame, Frame, StreamFrame};

/// A packet as registered with loss recovery.
#[derive(Debug, Clone)]
pub struct SentPacket {
    /// Packet number.
    pub number: PacketNumber,
    /// Frames the packet carried.
    pub frames: Vec<Frame>,
    /// Entropy bit the packet contributed.
    pub entropy_bit: bool,
    /// Size on the wire.
    pub length: ByteCount,
}

impl SentPacket {
    /// Control frames worth resending if this packet is lost. Acks and
    /// stop-waiting frames are regenerated fresh, stream frames go
    /// through the high-priority queue instead.
    pub fn control_frames_for_retransmission(&self) -> Vec<Frame> {
        self.frames
            .iter()
            .filter(|frame| {
                !matches!(
                    frame,
                    Frame::Stream(_) | Frame::Ack(_) | Frame::StopWaiting(_)
                )
            })
            .cloned()
            .collect()
    }

    /// Stream frames to resend at high priority if this packet is lost.
    pub fn stream_frames_for_retransmission(&self) -> Vec<StreamFrame> {
        self.frames
            .iter()
            .filter_map(|frame| match frame {
                Frame::Stream(f) => Some(f.clone()),
                _ => None,
            })
            .collect()
    }
}

/// What an ACK frame did to the sent-packet state.
#[derive(Debug, PartialEq)]
pub struct AckResult {
    /// Round-trip sample from the largest newly acked packet, if it was
    /// still tracked.
    pub rtt: Option<Duration>,
    /// Packets newly acknowledged by this frame.
    pub acked: Vec<AckedPacket>,
    /// Packets newly declared lost by this frame.
    pub lost: Vec<AckedPacket>,
}

/// Number and length of a packet, for congestion accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckedPacket {
    /// Packet number.
    pub number: PacketNumber,
    /// Size on the wire.
    pub length: ByteCount,
}

#[derive(Debug)]
struct TrackedPacket {
    packet: SentPacket,
    send_time: Instant,
    /// Entropy of all packets sent up to and including this one.
    cumulative_entropy: u8,
    nack_count: u32,
    lost: bool,
}

/// Sent-packet bookkeeping and loss detection.
#[derive(Debug, Default)]
pub struct SentPacketHandler {
    history: BTreeMap<PacketNumber, TrackedPacket>,
    retransmission_queue: VecDeque<SentPacket>,
    bytes_in_flight: ByteCount,
    largest_sent: PacketNumber,
    largest_acked: PacketNumber,
    entropy: EntropyAccumulator,
}

impl SentPacketHandler {
    /// Create an empty handler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a packet that was just written to the wire.
    pub fn sent_packet(&mut self, packet: SentPacket) {
        self.entropy.add(packet.number, packet.entropy_bit);
        self.largest_sent = self.largest_sent.max(packet.number);
        self.bytes_in_flight += packet.length;
        self.history.insert(
            packet.number,
            TrackedPacket {
                cumulative_entropy: self.entropy.value(),
                send_time: Instant::now(),
                nack_count: 0,
                lost: false,
                packet,
            },
        );
    }

    /// Process an incoming ACK frame.
    pub fn received_ack(&mut self, ack: &AckFrame) -> Result<AckResult, RecoveryError> {
        if ack.largest_observed <= self.largest_acked {
            return Err(RecoveryError::DuplicateOrOutOfOrderAck);
        }
        if ack.largest_observed > self.largest_sent {
            return Err(RecoveryError::UnknownPacket(ack.largest_observed));
        }

        let missing: HashSet<PacketNumber> = ack.missing.iter().copied().collect();
        self.validate_entropy(ack, &missing)?;

        let rtt = self
            .history
            .get(&ack.largest_observed)
            .map(|tracked| tracked.send_time.elapsed());

        let in_range: Vec<PacketNumber> = self
            .history
            .range(..=ack.largest_observed)
            .map(|(number, _)| *number)
            .collect();

        let mut acked = Vec::new();
        let mut lost = Vec::new();
        for number in in_range {
            if missing.contains(&number) {
                if let Some(tracked) = self.history.get_mut(&number) {
                    tracked.nack_count += 1;
                    if tracked.nack_count >= RETRANSMISSION_THRESHOLD && !tracked.lost {
                        tracked.lost = true;
                        self.bytes_in_flight -= tracked.packet.length;
                        lost.push(AckedPacket {
                            number,
                            length: tracked.packet.length,
                        });
                        self.retransmission_queue.push_back(tracked.packet.clone());
                    }
                }
            } else if let Some(tracked) = self.history.remove(&number) {
                if !tracked.lost {
                    self.bytes_in_flight -= tracked.packet.length;
                }
                acked.push(AckedPacket {
                    number,
                    length: tracked.packet.length,
                });
            }
        }

        self.largest_acked = ack.largest_observed;
        Ok(AckResult { rtt, acked, lost })
    }

    fn validate_entropy(
        &self,
        ack: &AckFrame,
        missing: &HashSet<PacketNumber>,
    ) -> Result<(), RecoveryError> {
        let Some(largest) = self.history.get(&ack.largest_observed) else {
            return Err(RecoveryError::UnknownPacket(ack.largest_observed));
        };

        // The peer's entropy covers every received packet up to the
        // largest observed: our cumulative value minus the bits of the
        // packets it reports missing.
        let mut expected = EntropyAccumulator::from_value(largest.cumulative_entropy);
        for number in missing {
            let Some(tracked) = self.history.get(number) else {
                return Err(RecoveryError::UnknownPacket(*number));
            };
            expected.add(*number, tracked.packet.entropy_bit);
        }
        if expected.value() != ack.entropy {
            return Err(RecoveryError::InvalidAckEntropy);
        }
        Ok(())
    }

    /// Pop one packet queued for retransmission, if any.
    pub fn dequeue_packet_for_retransmission(&mut self) -> Option<SentPacket> {
        self.retransmission_queue.pop_front()
    }

    /// Bytes currently considered in flight.
    pub fn bytes_in_flight(&self) -> ByteCount {
        self.bytes_in_flight
    }

    /// Highest packet number the peer has acknowledged.
    pub fn largest_acked(&self) -> PacketNumber {
        self.largest_acked
    }

    /// Cumulative entropy of all packets sent up to and including
    /// `number`. Used when building STOP_WAITING frames.
    pub fn entropy_up_to(&self, number: PacketNumber) -> u8 {
        self.history
            .get(&number)
            .map(|tracked| tracked.cumulative_entropy)
            .unwrap_or_else(|| self.entropy.value())
    }
}
