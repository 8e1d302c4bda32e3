//! Unreliable-message fragmentation and reassembly.
//!
//! A fragmented unreliable message is only delivered if every fragment
//! arrives; partial delivery is never allowed. Incomplete fragment slots
//! are reclaimed under either of two independent, explicit policies
//! (Open Question #3): age-based and displacement-based.

use std::collections::HashMap;

use crate::clock::UsecTime;

/// Splits `payload` into `ceil(len / max_fragment_len)` fragments, each
/// carrying the shared `msg_num` and its fragment index.
pub fn fragment(payload: &[u8], max_fragment_len: usize) -> Vec<Vec<u8>> {
    if payload.is_empty() {
        return vec![Vec::new()];
    }
    payload.chunks(max_fragment_len).map(|c| c.to_vec()).collect()
}

struct PendingMessage {
    frag_count: u32,
    received: Vec<Option<Vec<u8>>>,
    received_count: u32,
    first_seen: UsecTime,
}

/// Reassembles unreliable fragments keyed by message number, evicting
/// stale slots per the configured GC policy.
pub struct ReassemblyTable {
    pending: HashMap<u64, PendingMessage>,
    max_age: std::time::Duration,
    max_newer_messages: u32,
    highest_msg_num: u64,
}

impl ReassemblyTable {
    pub fn new(max_age: std::time::Duration, max_newer_messages: u32) -> Self {
        Self { pending: HashMap::new(), max_age, max_newer_messages, highest_msg_num: 0 }
    }

    /// Accepts one fragment. Returns `Some(complete_message)` once every
    /// fragment for `msg_num` has arrived.
    pub fn receive_fragment(
        &mut self,
        now: UsecTime,
        msg_num: u64,
        frag_idx: u32,
        frag_count: u32,
        bytes: Vec<u8>,
    ) -> Option<Vec<u8>> {
        self.highest_msg_num = self.highest_msg_num.max(msg_num);
        self.gc(now);

        if frag_count == 1 {
            return Some(bytes);
        }

        let entry = self.pending.entry(msg_num).or_insert_with(|| PendingMessage {
            frag_count,
            received: vec![None; frag_count as usize],
            received_count: 0,
            first_seen: now,
        });

        if (frag_idx as usize) >= entry.received.len() {
            return None;
        }
        if entry.received[frag_idx as usize].is_none() {
            entry.received[frag_idx as usize] = Some(bytes);
            entry.received_count += 1;
        }

        if entry.received_count == entry.frag_count {
            let entry = self.pending.remove(&msg_num).unwrap();
            let mut out = Vec::new();
            for part in entry.received.into_iter() {
                out.extend_from_slice(&part.unwrap());
            }
            Some(out)
        } else {
            None
        }
    }

    fn gc(&mut self, now: UsecTime) {
        let max_age = self.max_age;
        let max_newer = self.max_newer_messages as u64;
        let highest = self.highest_msg_num;
        self.pending.retain(|&msg_num, pending| {
            let age_ok = now.saturating_sub(pending.first_seen) <= max_age;
            let displacement_ok = highest.saturating_sub(msg_num) <= max_newer;
            age_ok && displacement_ok
        });
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn reasm_001_single_fragment_message() {
        let mut table = ReassemblyTable::new(Duration::from_secs(10), 64);
        let out = table.receive_fragment(UsecTime(0), 1, 0, 1, b"whole".to_vec());
        assert_eq!(out, Some(b"whole".to_vec()));
    }

    #[test]
    fn reasm_002_multi_fragment_in_order() {
        let mut table = ReassemblyTable::new(Duration::from_secs(10), 64);
        assert!(table.receive_fragment(UsecTime(0), 5, 0, 3, b"aa".to_vec()).is_none());
        assert!(table.receive_fragment(UsecTime(0), 5, 1, 3, b"bb".to_vec()).is_none());
        let out = table.receive_fragment(UsecTime(0), 5, 2, 3, b"cc".to_vec());
        assert_eq!(out, Some(b"aabbcc".to_vec()));
    }

    #[test]
    fn reasm_003_multi_fragment_out_of_order() {
        let mut table = ReassemblyTable::new(Duration::from_secs(10), 64);
        assert!(table.receive_fragment(UsecTime(0), 5, 2, 3, b"cc".to_vec()).is_none());
        assert!(table.receive_fragment(UsecTime(0), 5, 0, 3, b"aa".to_vec()).is_none());
        let out = table.receive_fragment(UsecTime(0), 5, 1, 3, b"bb".to_vec());
        assert_eq!(out, Some(b"aabbcc".to_vec()));
    }

    #[test]
    fn reasm_004_age_based_gc_drops_stale_partial() {
        let mut table = ReassemblyTable::new(Duration::from_millis(100), 1000);
        table.receive_fragment(UsecTime(0), 1, 0, 2, b"aa".to_vec());
        assert_eq!(table.pending_count(), 1);
        // Past max_age: the next call's GC pass should evict it.
        table.receive_fragment(UsecTime(200_000), 2, 0, 2, b"zz".to_vec());
        assert_eq!(table.pending_count(), 1);
    }

    #[test]
    fn reasm_005_displacement_based_gc_drops_stale_partial() {
        let mut table = ReassemblyTable::new(Duration::from_secs(600), 2);
        table.receive_fragment(UsecTime(0), 1, 0, 2, b"aa".to_vec());
        assert_eq!(table.pending_count(), 1);
        table.receive_fragment(UsecTime(0), 10, 0, 2, b"zz".to_vec());
        assert_eq!(table.pending_count(), 1);
    }

    #[test]
    fn reasm_006_fragment_helper_splits() {
        let parts = fragment(b"abcdefgh", 3);
        assert_eq!(parts, vec![b"abc".to_vec(), b"def".to_vec(), b"gh".to_vec()]);
    }
}
