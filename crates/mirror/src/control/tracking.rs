//! Packet-level acknowledgement bookkeeping: every packet carries its own
//! sequence plus an ack + 32-bit ack history of the reverse direction.
//! Smoothed RTT feeds the retransmission timeout used for item-level loss
//! detection.

use std::collections::VecDeque;
use std::time::Instant;

/// Wrap-aware sequence comparison.
pub(crate) fn sequence_greater_than(a: u32, b: u32) -> bool {
    let diff = a.wrapping_sub(b);
    diff != 0 && diff < u32::MAX / 2
}

#[derive(Debug, Clone)]
struct SentPacket {
    sequence: u32,
    send_time: Instant,
    acked: bool,
}

/// Tracks sent packets until they are acked or given up on.
#[derive(Debug)]
pub(crate) struct AckTracker {
    pending: VecDeque<SentPacket>,
    max_pending: usize,
    srtt: f32,
    rtt_var: f32,
}

impl AckTracker {
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: VecDeque::with_capacity(max_pending),
            max_pending,
            srtt: 100.0,
            rtt_var: 50.0,
        }
    }

    pub fn track_packet(&mut self, sequence: u32) {
        while self.pending.len() >= self.max_pending {
            self.pending.pop_front();
        }
        self.pending.push_back(SentPacket {
            sequence,
            send_time: Instant::now(),
            acked: false,
        });
    }

    /// Apply an incoming ack + history field; returns the newly acked
    /// sequences and updates the RTT estimate.
    pub fn process_ack(&mut self, ack: u32, ack_bitfield: u32) -> Vec<u32> {
        let mut acked_sequences = Vec::new();
        let mut rtt_samples = Vec::new();
        let now = Instant::now();

        for pending in &mut self.pending {
            if pending.acked {
                continue;
            }
            let is_acked = if pending.sequence == ack {
                true
            } else if sequence_greater_than(ack, pending.sequence) {
                let diff = ack.wrapping_sub(pending.sequence);
                diff <= 32 && (ack_bitfield & (1 << (diff - 1))) != 0
            } else {
                false
            };
            if is_acked {
                pending.acked = true;
                acked_sequences.push(pending.sequence);
                let rtt = now.duration_since(pending.send_time).as_secs_f32() * 1000.0;
                rtt_samples.push(rtt);
            }
        }
        for rtt in rtt_samples {
            self.update_rtt(rtt);
        }

        while self.pending.front().is_some_and(|p| p.acked) {
            self.pending.pop_front();
        }
        acked_sequences
    }

    /// Remove and return unacked packets older than the retransmission
    /// timeout. The caller decides what their contents mean.
    pub fn take_lost(&mut self) -> Vec<u32> {
        let rto = self.rto();
        let now = Instant::now();
        let mut lost = Vec::new();
        self.pending.retain(|p| {
            if !p.acked && now.duration_since(p.send_time).as_secs_f32() * 1000.0 > rto {
                lost.push(p.sequence);
                false
            } else {
                true
            }
        });
        lost
    }

    fn update_rtt(&mut self, rtt: f32) {
        const ALPHA: f32 = 0.125;
        const BETA: f32 = 0.25;
        let diff = (rtt - self.srtt).abs();
        self.rtt_var = (1.0 - BETA) * self.rtt_var + BETA * diff;
        self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * rtt;
    }

    /// Retransmission timeout: srtt + 4 * variance, floored so a quiet LAN
    /// does not spin on resends.
    pub fn rto(&self) -> f32 {
        (self.srtt + 4.0 * self.rtt_var).max(100.0)
    }

    pub fn srtt(&self) -> f32 {
        self.srtt
    }

    pub fn rtt_var(&self) -> f32 {
        self.rtt_var
    }

    pub fn unacked_count(&self) -> usize {
        self.pending.iter().filter(|p| !p.acked).count()
    }
}

/// Receive-side mirror: dedups packets and produces the ack + history
/// field to send back.
#[derive(Debug)]
pub(crate) struct ReceiveTracker {
    last_received: u32,
    received_bitfield: u32,
    recent_sequences: VecDeque<u32>,
    max_recent: usize,
}

impl Default for ReceiveTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveTracker {
    pub fn new() -> Self {
        Self {
            last_received: 0,
            received_bitfield: 0,
            recent_sequences: VecDeque::with_capacity(128),
            max_recent: 128,
        }
    }

    /// False for duplicates.
    pub fn record_received(&mut self, sequence: u32) -> bool {
        if self.recent_sequences.contains(&sequence) {
            return false;
        }
        if self.recent_sequences.len() >= self.max_recent {
            self.recent_sequences.pop_front();
        }
        self.recent_sequences.push_back(sequence);

        if sequence_greater_than(sequence, self.last_received) {
            let diff = sequence.wrapping_sub(self.last_received);
            if diff <= 32 {
                self.received_bitfield = (self.received_bitfield << diff) | 1;
            } else {
                self.received_bitfield = 0;
            }
            self.last_received = sequence;
        } else {
            let diff = self.last_received.wrapping_sub(sequence);
            if diff > 0 && diff <= 32 {
                self.received_bitfield |= 1 << (diff - 1);
            }
        }
        true
    }

    pub fn ack_data(&self) -> (u32, u32) {
        (self.last_received, self.received_bitfield)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn ack_bitfield_accumulates() {
        let mut tracker = ReceiveTracker::new();
        tracker.record_received(1);
        tracker.record_received(2);
        tracker.record_received(3);
        let (ack, bitfield) = tracker.ack_data();
        assert_eq!(ack, 3);
        assert_eq!(bitfield & 0b11, 0b11);
    }

    #[test]
    fn out_of_order_arrivals_still_acked() {
        let mut tracker = ReceiveTracker::new();
        tracker.record_received(3);
        tracker.record_received(1);
        tracker.record_received(2);
        let (ack, bitfield) = tracker.ack_data();
        assert_eq!(ack, 3);
        assert_eq!(bitfield & 0b11, 0b11);
    }

    #[test]
    fn duplicates_rejected() {
        let mut tracker = ReceiveTracker::new();
        assert!(tracker.record_received(1));
        assert!(!tracker.record_received(1));
        assert!(tracker.record_received(2));
    }

    #[test]
    fn ack_updates_rtt() {
        let mut tracker = AckTracker::new(32);
        tracker.track_packet(1);
        std::thread::sleep(Duration::from_millis(10));
        let acked = tracker.process_ack(1, 0);
        assert_eq!(acked, vec![1]);
        assert!(tracker.srtt() > 0.0);
    }

    #[test]
    fn bitfield_acks_older_packets() {
        let mut tracker = AckTracker::new(32);
        tracker.track_packet(5);
        tracker.track_packet(6);
        tracker.track_packet(7);
        // Ack 7 with history bits covering 6 and 5.
        let acked = tracker.process_ack(7, 0b11);
        assert_eq!(acked.len(), 3);
        assert_eq!(tracker.unacked_count(), 0);
    }

    #[test]
    fn wrap_comparison() {
        assert!(sequence_greater_than(1, u32::MAX));
        assert!(!sequence_greater_than(u32::MAX, 1));
        assert!(!sequence_greater_than(5, 5));
    }

    #[test]
    fn fresh_tracker_reports_no_loss() {
        let mut tracker = AckTracker::new(8);
        tracker.track_packet(1);
        assert!(tracker.take_lost().is_empty());
    }
}
