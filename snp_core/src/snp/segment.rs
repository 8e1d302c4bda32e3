//! Reliable byte-stream framing and the sparse receive buffer used to
//! reassemble out-of-order reliable segments.
//!
//! The reliable byte stream is a virtual, unbounded ordered sequence of
//! bytes formed by concatenating every reliable message's payload plus a
//! short varint length-prefix framing header. Stream position is a
//! monotonically increasing 64-bit byte offset (I2).

use std::collections::BTreeMap;

/// Encodes `payload` as one reliable-stream frame: a 1-5 byte varint
/// length prefix followed by the payload bytes.
pub fn frame_message(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 5);
    let mut len = payload.len() as u64;
    loop {
        let mut byte = (len & 0x7f) as u8;
        len >>= 7;
        if len != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
    out.extend_from_slice(payload);
    out
}

/// Incrementally decodes framed messages out of a contiguous byte stream,
/// retaining a partially-received frame across calls.
#[derive(Default)]
pub struct MessageDecoder {
    pending: Vec<u8>,
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends newly-available contiguous bytes and returns every message
    /// that is now fully framed.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(bytes);
        let mut out = Vec::new();
        loop {
            let mut shift = 0;
            let mut len: u64 = 0;
            let mut consumed = 0;
            let mut complete_varint = false;
            for (i, &b) in self.pending.iter().enumerate() {
                len |= ((b & 0x7f) as u64) << shift;
                consumed = i + 1;
                if b & 0x80 == 0 {
                    complete_varint = true;
                    break;
                }
                shift += 7;
            }
            if !complete_varint {
                break;
            }
            let total_needed = consumed + len as usize;
            if self.pending.len() < total_needed {
                break;
            }
            let payload = self.pending[consumed..total_needed].to_vec();
            self.pending.drain(0..total_needed);
            out.push(payload);
        }
        out
    }
}

/// A sparse, merging interval buffer for out-of-order reliable segments.
/// `insert` accepts segments at any position ≥ `base`; overlapping
/// segments must agree byte-for-byte (I2), enforced on the overlapping
/// region.
#[derive(Default)]
pub struct ReliableRecvBuffer {
    /// The stream position of the first byte not yet consumed.
    base: u64,
    /// Sparse intervals keyed by start position, each a contiguous run of
    /// bytes not yet merged into `base`.
    intervals: BTreeMap<u64, Vec<u8>>,
}

#[derive(Debug)]
pub struct OverlapMismatch;

impl ReliableRecvBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    /// Inserts a received segment `[stream_pos, stream_pos+bytes.len())`.
    /// Returns the newly available contiguous prefix starting at `base`,
    /// if any (consumed), or an error if overlapping bytes disagree.
    pub fn insert(&mut self, stream_pos: u64, bytes: &[u8]) -> Result<Vec<u8>, OverlapMismatch> {
        if bytes.is_empty() {
            return Ok(Vec::new());
        }
        let end = stream_pos + bytes.len() as u64;
        if end <= self.base {
            // Entirely already-consumed; nothing to do.
            return Ok(Vec::new());
        }
        let (start, data) = if stream_pos < self.base {
            let skip = (self.base - stream_pos) as usize;
            (self.base, bytes[skip..].to_vec())
        } else {
            (stream_pos, bytes.to_vec())
        };

        self.merge_interval(start, data)?;
        Ok(self.drain_contiguous())
    }

    fn merge_interval(&mut self, mut start: u64, mut data: Vec<u8>) -> Result<(), OverlapMismatch> {
        // Find any existing interval that overlaps or touches [start, end).
        let end = start + data.len() as u64;

        // Merge with a predecessor interval that overlaps from the left.
        if let Some((&pred_start, pred_data)) = self.intervals.range(..=start).next_back() {
            let pred_end = pred_start + pred_data.len() as u64;
            if pred_end >= start {
                let overlap_start = start;
                let overlap_len = pred_end.saturating_sub(overlap_start).min(data.len() as u64) as usize;
                let pred_overlap_offset = (overlap_start - pred_start) as usize;
                if pred_data[pred_overlap_offset..pred_overlap_offset + overlap_len] != data[..overlap_len] {
                    return Err(OverlapMismatch);
                }
                if pred_end >= end {
                    // Entirely covered already.
                    return Ok(());
                }
                let mut merged = pred_data.clone();
                merged.extend_from_slice(&data[overlap_len..]);
                let merged_start = pred_start;
                self.intervals.remove(&pred_start);
                start = merged_start;
                data = merged;
            }
        }

        // Merge with any successor intervals overlapped or adjoined by [start, end).
        let end = start + data.len() as u64;
        let overlapping_keys: Vec<u64> =
            self.intervals.range(start..=end).map(|(&k, _)| k).collect();
        for key in overlapping_keys {
            let existing = self.intervals.remove(&key).unwrap();
            let existing_end = key + existing.len() as u64;
            let rel_offset = (key - start) as usize;
            let overlap_len = data.len().saturating_sub(rel_offset).min(existing.len());
            if data[rel_offset..rel_offset + overlap_len] != existing[..overlap_len] {
                return Err(OverlapMismatch);
            }
            if existing_end > end {
                data.extend_from_slice(&existing[overlap_len..]);
            }
        }

        self.intervals.insert(start, data);
        Ok(())
    }

    fn drain_contiguous(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some((&start, _)) = self.intervals.iter().next() {
            if start != self.base {
                break;
            }
            let data = self.intervals.remove(&start).unwrap();
            self.base += data.len() as u64;
            out.extend_from_slice(&data);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seg_001_frame_and_decode_roundtrip() {
        let mut decoder = MessageDecoder::new();
        let framed_a = frame_message(b"hello");
        let framed_b = frame_message(b"world!");
        let mut stream = framed_a;
        stream.extend_from_slice(&framed_b);
        let msgs = decoder.push_bytes(&stream);
        assert_eq!(msgs, vec![b"hello".to_vec(), b"world!".to_vec()]);
    }

    #[test]
    fn seg_002_decoder_handles_partial_frame() {
        let mut decoder = MessageDecoder::new();
        let framed = frame_message(b"partial-message");
        let (head, tail) = framed.split_at(2);
        assert!(decoder.push_bytes(head).is_empty());
        let msgs = decoder.push_bytes(tail);
        assert_eq!(msgs, vec![b"partial-message".to_vec()]);
    }

    #[test]
    fn seg_003_recv_buffer_in_order() {
        let mut buf = ReliableRecvBuffer::new();
        let out1 = buf.insert(0, b"abc").unwrap();
        assert_eq!(out1, b"abc");
        let out2 = buf.insert(3, b"def").unwrap();
        assert_eq!(out2, b"def");
        assert_eq!(buf.base(), 6);
    }

    #[test]
    fn seg_004_recv_buffer_out_of_order() {
        let mut buf = ReliableRecvBuffer::new();
        let out1 = buf.insert(3, b"def").unwrap();
        assert!(out1.is_empty());
        let out2 = buf.insert(0, b"abc").unwrap();
        assert_eq!(out2, b"abcdef");
        assert_eq!(buf.base(), 6);
    }

    #[test]
    fn seg_005_recv_buffer_duplicate_is_idempotent() {
        let mut buf = ReliableRecvBuffer::new();
        buf.insert(0, b"abc").unwrap();
        let out = buf.insert(0, b"abc").unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn seg_006_recv_buffer_overlap_agreement_ok() {
        let mut buf = ReliableRecvBuffer::new();
        buf.insert(5, b"cdef").unwrap();
        let out = buf.insert(0, b"abcde").unwrap();
        assert_eq!(out, b"abcdecdef" as &[u8]);
    }

    #[test]
    fn seg_007_recv_buffer_overlap_mismatch_errors() {
        let mut buf = ReliableRecvBuffer::new();
        buf.insert(5, b"cdef").unwrap();
        assert!(buf.insert(3, b"XYzz").is_err());
    }

    #[test]
    fn seg_008_recv_buffer_three_way_merge() {
        let mut buf = ReliableRecvBuffer::new();
        let out1 = buf.insert(0, b"aa").unwrap();
        assert_eq!(out1, b"aa");
        let out2 = buf.insert(6, b"dd").unwrap();
        assert!(out2.is_empty());
        let out3 = buf.insert(2, b"bbcc").unwrap();
        assert_eq!(out3, b"bbccdd" as &[u8]);
        assert_eq!(buf.base(), 8);
    }
}
