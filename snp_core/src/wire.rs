//! Wire framing: the packet header (type byte + packet-number-low field)
//! and the TLV-style frame set carried inside the encrypted record.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{NetError, Result};

pub const FRAME_ACK_BLOCK: u8 = 0x01;
pub const FRAME_RELIABLE_SEGMENT: u8 = 0x02;
pub const FRAME_UNRELIABLE_SEGMENT: u8 = 0x03;
pub const FRAME_STATS_PIGGYBACK: u8 = 0x04;
pub const FRAME_CLOSE: u8 = 0x05;
pub const FRAME_PING: u8 = 0x06;

/// Packet-number-low field width, chosen per-packet by the sender based on
/// the expected in-flight window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PktNumWidth {
    Bits16,
    Bits32,
}

impl PktNumWidth {
    fn byte_len(self) -> usize {
        match self {
            PktNumWidth::Bits16 => 2,
            PktNumWidth::Bits32 => 4,
        }
    }

    fn type_flag(self) -> u8 {
        match self {
            PktNumWidth::Bits16 => 0x00,
            PktNumWidth::Bits32 => 0x10,
        }
    }
}

/// Type byte ≥ 0x80 marks unconnected control packets (handshake,
/// rejection); 0x00..0x3F marks data packets and also encodes the
/// packet-number-low width via bit 0x10.
pub const CONTROL_PACKET_FLAG: u8 = 0x80;

pub fn is_control_packet(type_byte: u8) -> bool {
    type_byte & CONTROL_PACKET_FLAG != 0
}

/// Encodes the data-packet header: type byte + packet-number-low bytes
/// (big-endian truncation of the full 64-bit packet number).
pub fn encode_data_header(buf: &mut BytesMut, width: PktNumWidth, pkt_num: u64) {
    buf.put_u8(width.type_flag());
    match width {
        PktNumWidth::Bits16 => buf.put_u16(pkt_num as u16),
        PktNumWidth::Bits32 => buf.put_u32(pkt_num as u32),
    }
}

pub struct DecodedHeader {
    pub width: PktNumWidth,
    pub pkt_num_low: u64,
    pub header_len: usize,
}

pub fn decode_data_header(buf: &[u8]) -> Result<DecodedHeader> {
    if buf.is_empty() {
        return Err(NetError::Internal("empty packet".to_string()));
    }
    let type_byte = buf[0];
    if is_control_packet(type_byte) {
        return Err(NetError::Internal("not a data packet".to_string()));
    }
    let width = if type_byte & 0x10 != 0 { PktNumWidth::Bits32 } else { PktNumWidth::Bits16 };
    let needed = 1 + width.byte_len();
    if buf.len() < needed {
        return Err(NetError::Internal("truncated packet header".to_string()));
    }
    let pkt_num_low = match width {
        PktNumWidth::Bits16 => u16::from_be_bytes([buf[1], buf[2]]) as u64,
        PktNumWidth::Bits32 => u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as u64,
    };
    Ok(DecodedHeader { width, pkt_num_low, header_len: needed })
}

/// Reconstructs the full 64-bit packet number from its low-bit
/// truncation, choosing the candidate closest to `highest_seen + 1` (P4).
pub fn reconstruct_packet_number(low_bits: u64, bits: u32, highest_seen: u64) -> u64 {
    let modulus: u128 = 1u128 << bits;
    let expected = highest_seen as u128 + 1;
    let base = (expected / modulus) * modulus;

    let mut best: u128 = base + low_bits as u128;
    let mut best_dist = best.abs_diff(expected);

    for candidate_base in [base.saturating_sub(modulus), base + modulus] {
        let candidate = candidate_base + low_bits as u128;
        let dist = candidate.abs_diff(expected);
        if dist < best_dist {
            best = candidate;
            best_dist = dist;
        }
    }
    best as u64
}

fn put_varint(buf: &mut BytesMut, mut v: u64) {
    loop {
        let mut byte = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if v == 0 {
            break;
        }
    }
}

fn get_varint(buf: &mut impl Buf) -> Result<u64> {
    let mut v: u64 = 0;
    let mut shift = 0;
    loop {
        if !buf.has_remaining() {
            return Err(NetError::Internal("truncated varint".to_string()));
        }
        let byte = buf.get_u8();
        v |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift >= 64 {
            return Err(NetError::Internal("varint too long".to_string()));
        }
    }
    Ok(v)
}

/// One TLV frame carried inside the encrypted record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    AckBlock { latest_pkt_num: u64, runs: Vec<(u32, u32)> },
    ReliableSegment { stream_pos: u64, bytes: Vec<u8> },
    UnreliableSegment { msg_num: u64, frag_idx: u32, frag_count: u32, bytes: Vec<u8> },
    StatsPiggyback { is_lifetime: bool, bytes: Vec<u8> },
    Close { reason: u32, debug: String },
    Ping,
}

/// Encodes `frame`'s tag, then a varint byte length, then its body. Every
/// frame is length-prefixed this way (not just the variable-length ones)
/// so that a decoder which does not recognize a tag can still skip over
/// its body and continue parsing the rest of the record (§6: "implementations
/// must skip unknown frame types for forward compatibility").
pub fn encode_frame(buf: &mut BytesMut, frame: &Frame) {
    let mut body = BytesMut::new();
    let tag = match frame {
        Frame::AckBlock { latest_pkt_num, runs } => {
            put_varint(&mut body, *latest_pkt_num);
            put_varint(&mut body, runs.len() as u64);
            for (unacked, acked) in runs {
                put_varint(&mut body, *unacked as u64);
                put_varint(&mut body, *acked as u64);
            }
            FRAME_ACK_BLOCK
        }
        Frame::ReliableSegment { stream_pos, bytes } => {
            put_varint(&mut body, *stream_pos);
            body.put_slice(bytes);
            FRAME_RELIABLE_SEGMENT
        }
        Frame::UnreliableSegment { msg_num, frag_idx, frag_count, bytes } => {
            put_varint(&mut body, *msg_num);
            put_varint(&mut body, *frag_idx as u64);
            put_varint(&mut body, *frag_count as u64);
            body.put_slice(bytes);
            FRAME_UNRELIABLE_SEGMENT
        }
        Frame::StatsPiggyback { is_lifetime, bytes } => {
            body.put_u8(if *is_lifetime { 1 } else { 0 });
            body.put_slice(bytes);
            FRAME_STATS_PIGGYBACK
        }
        Frame::Close { reason, debug } => {
            body.put_u32(*reason);
            body.put_slice(debug.as_bytes());
            FRAME_CLOSE
        }
        Frame::Ping => FRAME_PING,
    };
    buf.put_u8(tag);
    put_varint(buf, body.len() as u64);
    buf.put_slice(&body);
}

/// Decodes every frame in `data`. Every frame carries a varint byte length
/// right after its tag, so a tag this implementation does not recognize is
/// skipped whole (its length is still known) rather than aborting the
/// parse, per §6's forward-compatibility requirement.
pub fn decode_frames(data: &[u8]) -> Result<Vec<Frame>> {
    let mut buf = data;
    let mut frames = Vec::new();
    while buf.has_remaining() {
        let tag = buf.get_u8();
        let len = get_varint(&mut buf)? as usize;
        if buf.remaining() < len {
            return Err(NetError::Internal("truncated frame body".to_string()));
        }
        let mut body = &buf[..len];
        buf.advance(len);
        match tag {
            FRAME_ACK_BLOCK => {
                let latest_pkt_num = get_varint(&mut body)?;
                let n = get_varint(&mut body)?;
                let mut runs = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    let unacked = get_varint(&mut body)? as u32;
                    let acked = get_varint(&mut body)? as u32;
                    runs.push((unacked, acked));
                }
                frames.push(Frame::AckBlock { latest_pkt_num, runs });
            }
            FRAME_RELIABLE_SEGMENT => {
                let stream_pos = get_varint(&mut body)?;
                frames.push(Frame::ReliableSegment { stream_pos, bytes: body.to_vec() });
            }
            FRAME_UNRELIABLE_SEGMENT => {
                let msg_num = get_varint(&mut body)?;
                let frag_idx = get_varint(&mut body)? as u32;
                let frag_count = get_varint(&mut body)? as u32;
                frames.push(Frame::UnreliableSegment { msg_num, frag_idx, frag_count, bytes: body.to_vec() });
            }
            FRAME_STATS_PIGGYBACK => {
                if !body.has_remaining() {
                    return Err(NetError::Internal("truncated stats piggyback".to_string()));
                }
                let is_lifetime = body.get_u8() != 0;
                frames.push(Frame::StatsPiggyback { is_lifetime, bytes: body.to_vec() });
            }
            FRAME_CLOSE => {
                if body.remaining() < 4 {
                    return Err(NetError::Internal("truncated close frame".to_string()));
                }
                let reason = body.get_u32();
                let debug = String::from_utf8_lossy(body).to_string();
                frames.push(Frame::Close { reason, debug });
            }
            FRAME_PING => frames.push(Frame::Ping),
            _unknown => {
                // Length already consumed above; the body is simply dropped.
            }
        }
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_001_header_roundtrip() {
        let mut buf = BytesMut::new();
        encode_data_header(&mut buf, PktNumWidth::Bits32, 123456789);
        let decoded = decode_data_header(&buf).unwrap();
        assert_eq!(decoded.width, PktNumWidth::Bits32);
        assert_eq!(decoded.pkt_num_low, 123456789);
    }

    #[test]
    fn wire_002_frame_roundtrip_all_types() {
        let frames = vec![
            Frame::AckBlock { latest_pkt_num: 99, runs: vec![(3, 5), (0, 128)] },
            Frame::ReliableSegment { stream_pos: 42, bytes: b"hello".to_vec() },
            Frame::UnreliableSegment { msg_num: 7, frag_idx: 1, frag_count: 3, bytes: b"frag".to_vec() },
            Frame::StatsPiggyback { is_lifetime: true, bytes: vec![1, 2, 3] },
            Frame::Close { reason: 1003, debug: "timeout".to_string() },
            Frame::Ping,
        ];
        let mut buf = BytesMut::new();
        for f in &frames {
            encode_frame(&mut buf, f);
        }
        let decoded = decode_frames(&buf).unwrap();
        assert_eq!(decoded, frames);
    }

    #[test]
    fn wire_003_unknown_frame_type_is_skipped_not_errored() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x7f);
        put_varint(&mut buf, 3);
        buf.put_slice(b"abc");
        encode_frame(&mut buf, &Frame::Ping);
        let decoded = decode_frames(&buf).unwrap();
        assert_eq!(decoded, vec![Frame::Ping]);
    }

    #[test]
    fn wire_003b_truncated_unknown_frame_still_errors() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x7f);
        put_varint(&mut buf, 10);
        buf.put_slice(b"ab");
        assert!(decode_frames(&buf).is_err());
    }

    #[test]
    fn p4_reconstruct_packet_number_16bit() {
        let highest_seen = 70_000u64;
        let full = 70_005u64;
        let low = (full & 0xffff) as u64;
        let reconstructed = reconstruct_packet_number(low, 16, highest_seen);
        assert_eq!(reconstructed, full);
    }

    #[test]
    fn p4_reconstruct_packet_number_across_wraparound() {
        let highest_seen = 65_534u64;
        let full = 65_540u64;
        let low = full & 0xffff;
        let reconstructed = reconstruct_packet_number(low, 16, highest_seen);
        assert_eq!(reconstructed, full);
    }
}
