//! Packet framing: `[3-byte little-endian length][1-byte sequence id][payload]`.
//! `PacketReader` accumulates raw socket bytes until a full packet is
//! available; `write_packet` frames an outgoing payload the same way.

use std::collections::VecDeque;

use crate::error::MySqlError;

const HEADER_LEN: usize = 4;

/// Assembles complete packets out of a stream of raw socket reads. Holds
/// whatever partial bytes have arrived so far; `read_next_payload`
/// (`conn.rs`) feeds it more bytes only when `has_packet()` is false.
#[derive(Default)]
pub struct PacketReader {
    buf: VecDeque<u8>,
}

impl PacketReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend(data.iter().copied());
    }

    pub fn has_packet(&self) -> bool {
        if self.buf.len() < HEADER_LEN {
            return false;
        }
        let len = peek_len(&self.buf);
        self.buf.len() >= HEADER_LEN + len
    }

    /// Pops one complete packet, returning `(sequence_id, payload)`. Panics
    /// if `has_packet()` was false — callers must check first.
    pub fn take_packet(&mut self) -> (u8, Vec<u8>) {
        debug_assert!(self.has_packet());
        let len = peek_len(&self.buf);
        for _ in 0..3 {
            self.buf.pop_front();
        }
        let seq = self.buf.pop_front().expect("header present");
        let payload: Vec<u8> = self.buf.drain(..len).collect();
        (seq, payload)
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

fn peek_len(buf: &VecDeque<u8>) -> usize {
    let b0 = buf[0] as usize;
    let b1 = buf[1] as usize;
    let b2 = buf[2] as usize;
    b0 | (b1 << 8) | (b2 << 16)
}

/// Frames `payload` under `sequence_id`. Payloads at or above 16MB would
/// need splitting across multiple packets per the wire protocol; this
/// client's query/prepared-statement traffic never approaches that size, so
/// the split path is not implemented here.
pub fn write_packet(payload: &[u8], sequence_id: u8) -> Result<Vec<u8>, MySqlError> {
    if payload.len() >= 0xFF_FFFF {
        return Err(MySqlError::Protocol(
            "payload too large for unsplit packet framing".to_string(),
        ));
    }
    let len = payload.len();
    let mut out = Vec::with_capacity(HEADER_LEN + len);
    out.push((len & 0xFF) as u8);
    out.push(((len >> 8) & 0xFF) as u8);
    out.push(((len >> 16) & 0xFF) as u8);
    out.push(sequence_id);
    out.extend_from_slice(payload);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_a_packet_fed_in_two_chunks() {
        let mut reader = PacketReader::new();
        let packet = write_packet(b"hello", 3).unwrap();
        reader.feed(&packet[..2]);
        assert!(!reader.has_packet());
        reader.feed(&packet[2..]);
        assert!(reader.has_packet());
        let (seq, payload) = reader.take_packet();
        assert_eq!(seq, 3);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn leaves_a_second_packet_buffered_after_taking_the_first() {
        let mut reader = PacketReader::new();
        reader.feed(&write_packet(b"a", 0).unwrap());
        reader.feed(&write_packet(b"bb", 1).unwrap());
        let (seq1, p1) = reader.take_packet();
        assert_eq!((seq1, p1), (0, b"a".to_vec()));
        assert!(reader.has_packet());
        let (seq2, p2) = reader.take_packet();
        assert_eq!((seq2, p2), (1, b"bb".to_vec()));
        assert!(reader.is_empty());
    }
}
