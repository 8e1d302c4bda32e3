//! Reliability and acknowledgement engine: packet-number tracking,
//! duplicate/out-of-order/lurch detection, and the in-flight
//! retransmission queue for the reliable stream.

use std::collections::BTreeMap;

use crate::stats::IntervalCounters;
use crate::wire::Frame;

/// Fixed pair of 64-bit words covering the last 128 packet numbers
/// relative to `highest`, per the design guidance to keep this a fixed
/// bitmask rather than a growable structure.
#[derive(Debug, Clone, Copy, Default)]
struct PacketBitmask {
    low: u64,
    high: u64,
}

const BITMASK_WIDTH: u64 = 128;

impl PacketBitmask {
    fn is_set(&self, bit: u64) -> bool {
        if bit < 64 {
            self.low & (1 << bit) != 0
        } else if bit < 128 {
            self.high & (1 << (bit - 64)) != 0
        } else {
            false
        }
    }

    fn set(&mut self, bit: u64) {
        if bit < 64 {
            self.low |= 1 << bit;
        } else if bit < 128 {
            self.high |= 1 << (bit - 64);
        }
    }

    /// Shifts the window forward by `n` packet numbers (a higher packet
    /// number has become the new highest-seen), dropping bits that fall
    /// off the low end.
    fn shift(&mut self, n: u64) {
        if n >= BITMASK_WIDTH {
            self.low = 0;
            self.high = 0;
            return;
        }
        if n == 0 {
            return;
        }
        if n < 64 {
            self.low = (self.low << n) | (self.high >> (64 - n));
            self.high <<= n;
        } else {
            self.low = self.high << (n - 64);
            self.high = 0;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketClass {
    Lurch,
    Duplicate,
    OutOfOrder,
    InOrder,
}

/// Receive-side packet-number tracking for one direction of one
/// connection.
pub struct ReceiveTracker {
    max_recv_pkt_num: Option<u64>,
    bitmask: PacketBitmask,
    lurch_window: u64,
    pub counters: IntervalCounters,
}

impl ReceiveTracker {
    pub fn new(lurch_window: u64) -> Self {
        Self {
            max_recv_pkt_num: None,
            bitmask: PacketBitmask::default(),
            lurch_window: lurch_window.min(BITMASK_WIDTH),
            counters: IntervalCounters::default(),
        }
    }

    /// Processes one authenticated, decoded packet number (I6: call this
    /// only once the packet has been authenticated). Returns its
    /// classification; lurches and duplicates are not delivered to the
    /// application.
    pub fn process(&mut self, pkt_num: u64) -> PacketClass {
        let Some(highest) = self.max_recv_pkt_num else {
            self.max_recv_pkt_num = Some(pkt_num);
            self.bitmask.set(0);
            self.counters.n_recv += 1;
            return PacketClass::InOrder;
        };

        if pkt_num > highest {
            let gap = pkt_num - highest;
            self.bitmask.shift(gap);
            self.bitmask.set(0);
            self.max_recv_pkt_num = Some(pkt_num);
            self.counters.n_recv += 1;
            if gap > 1 {
                self.counters.n_dropped += gap - 1;
            }
            return PacketClass::InOrder;
        }

        let distance = highest - pkt_num;
        if distance >= self.lurch_window {
            self.counters.n_lurch += 1;
            return PacketClass::Lurch;
        }

        if self.bitmask.is_set(distance) {
            self.counters.n_duplicate += 1;
            return PacketClass::Duplicate;
        }

        self.bitmask.set(distance);
        self.counters.n_recv += 1;
        self.counters.n_dropped = self.counters.n_dropped.saturating_sub(1);
        self.counters.n_out_of_order += 1;
        PacketClass::OutOfOrder
    }

    pub fn highest_seen(&self) -> Option<u64> {
        self.max_recv_pkt_num
    }

    /// Encodes an ack block covering the most recent packets since
    /// `last_acked`, as `(unacked_run, acked_run)` pairs, most recent
    /// first.
    pub fn encode_ack_block(&self) -> Option<Frame> {
        let highest = self.max_recv_pkt_num?;
        let mut runs = Vec::new();
        let mut i: u64 = 0;
        while i < BITMASK_WIDTH {
            let acked_start = i;
            while i < BITMASK_WIDTH && self.bitmask.is_set(i) {
                i += 1;
            }
            let acked_run = i - acked_start;
            if acked_run == 0 && runs.is_empty() {
                // Leading unacked run before any acked bit; fold into the
                // next pair's unacked count below.
            }
            let unacked_start = i;
            while i < BITMASK_WIDTH && !self.bitmask.is_set(i) {
                i += 1;
            }
            let unacked_run = i - unacked_start;
            if acked_run == 0 && unacked_run == 0 {
                break;
            }
            runs.push((unacked_run as u32, acked_run as u32));
        }
        Some(Frame::AckBlock { latest_pkt_num: highest, runs })
    }
}

/// Inverse of `ReceiveTracker::encode_ack_block`: walks the same
/// `(unacked_run, acked_run)` pairs from `latest_pkt_num` backwards and
/// returns the full packet numbers the peer reported as received.
pub fn decode_ack_block(latest_pkt_num: u64, runs: &[(u32, u32)]) -> Vec<u64> {
    let mut acked = Vec::new();
    let mut cursor: u64 = 0;
    for &(unacked_run, acked_run) in runs {
        for d in cursor..cursor + acked_run as u64 {
            if d <= latest_pkt_num {
                acked.push(latest_pkt_num - d);
            }
        }
        cursor += acked_run as u64 + unacked_run as u64;
    }
    acked
}

/// One outstanding reliable-stream range awaiting acknowledgement,
/// indexed by the packet number that carried it.
#[derive(Debug, Clone)]
pub struct InFlightRange {
    pub stream_pos: u64,
    pub bytes: Vec<u8>,
}

/// Sender-side retransmission bookkeeping: tracks in-flight reliable
/// ranges by the packet number that carried them, retiring on ack and
/// re-queuing ranges that age out without one.
#[derive(Default)]
pub struct RetransmitQueue {
    in_flight: BTreeMap<u64, InFlightRange>,
    max_acked_pkt_num: Option<u64>,
}

impl RetransmitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_send(&mut self, pkt_num: u64, stream_pos: u64, bytes: Vec<u8>) {
        self.in_flight.insert(pkt_num, InFlightRange { stream_pos, bytes });
    }

    /// Retires every in-flight packet number covered by `acked`.
    pub fn on_ack(&mut self, acked: &[u64]) {
        for pkt_num in acked {
            self.in_flight.remove(pkt_num);
            self.max_acked_pkt_num = Some(self.max_acked_pkt_num.map_or(*pkt_num, |m| m.max(*pkt_num)));
        }
    }

    /// Returns ranges whose packet number is older than
    /// `maxAckedPktNum - 3` and were never acked; these are considered
    /// lost and should be re-enqueued at the head of the reliable stream.
    pub fn reap_lost(&mut self) -> Vec<InFlightRange> {
        let Some(max_acked) = self.max_acked_pkt_num else { return Vec::new() };
        let threshold = max_acked.saturating_sub(3);
        let lost_keys: Vec<u64> = self.in_flight.range(..threshold).map(|(&k, _)| k).collect();
        lost_keys.into_iter().filter_map(|k| self.in_flight.remove(&k)).collect()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn pending_bytes(&self) -> u64 {
        self.in_flight.values().map(|r| r.bytes.len() as u64).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rel_001_first_packet_in_order() {
        let mut t = ReceiveTracker::new(128);
        assert_eq!(t.process(10), PacketClass::InOrder);
        assert_eq!(t.highest_seen(), Some(10));
    }

    #[test]
    fn rel_002_in_order_sequence() {
        let mut t = ReceiveTracker::new(128);
        assert_eq!(t.process(1), PacketClass::InOrder);
        assert_eq!(t.process(2), PacketClass::InOrder);
        assert_eq!(t.process(3), PacketClass::InOrder);
    }

    #[test]
    fn rel_003_gap_counts_as_dropped() {
        let mut t = ReceiveTracker::new(128);
        t.process(1);
        t.process(5);
        assert_eq!(t.counters.n_dropped, 3);
    }

    #[test]
    fn rel_004_out_of_order_corrects_dropped() {
        let mut t = ReceiveTracker::new(128);
        t.process(1);
        t.process(5);
        assert_eq!(t.counters.n_dropped, 3);
        t.process(3);
        assert_eq!(t.counters.n_dropped, 2);
        assert_eq!(t.counters.n_out_of_order, 1);
    }

    #[test]
    fn p3_duplicate_detected_at_most_once() {
        let mut t = ReceiveTracker::new(128);
        t.process(10);
        t.process(9);
        assert_eq!(t.process(9), PacketClass::Duplicate);
        assert_eq!(t.counters.n_duplicate, 1);
    }

    #[test]
    fn rel_005_lurch_beyond_window() {
        let mut t = ReceiveTracker::new(128);
        t.process(200);
        assert_eq!(t.process(71), PacketClass::Lurch);
        assert_eq!(t.counters.n_lurch, 1);
    }

    #[test]
    fn rel_006_ack_block_roundtrips_through_wire() {
        let mut t = ReceiveTracker::new(128);
        t.process(1);
        t.process(2);
        t.process(4);
        let frame = t.encode_ack_block().unwrap();
        if let Frame::AckBlock { latest_pkt_num, runs } = frame {
            assert_eq!(latest_pkt_num, 4);
            assert!(!runs.is_empty());
        } else {
            panic!("expected AckBlock");
        }
    }

    #[test]
    fn rel_006b_decode_ack_block_recovers_acked_packet_numbers() {
        let mut t = ReceiveTracker::new(128);
        t.process(1);
        t.process(2);
        t.process(4);
        let frame = t.encode_ack_block().unwrap();
        let Frame::AckBlock { latest_pkt_num, runs } = frame else { panic!("expected AckBlock") };
        let mut acked = decode_ack_block(latest_pkt_num, &runs);
        acked.sort_unstable();
        assert_eq!(acked, vec![1, 2, 4]);
    }

    #[test]
    fn rel_007_retransmit_queue_retires_on_ack() {
        let mut q = RetransmitQueue::new();
        q.on_send(1, 0, b"aa".to_vec());
        q.on_send(2, 2, b"bb".to_vec());
        q.on_ack(&[1]);
        assert_eq!(q.in_flight_count(), 1);
    }

    #[test]
    fn rel_008_retransmit_queue_reaps_lost_ranges() {
        let mut q = RetransmitQueue::new();
        for pkt in 1..=10u64 {
            q.on_send(pkt, pkt, vec![pkt as u8]);
        }
        q.on_ack(&[10]);
        let lost = q.reap_lost();
        assert!(!lost.is_empty());
        assert!(lost.iter().all(|r| r.stream_pos < 7));
    }
}
