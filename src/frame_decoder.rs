//! Reassembly of the radio-link byte stream into CRC-checked sensor frames.
//!
//! Frame layout: `[0xFF][f32 LE; (len - 2) / 4][crc8]`. The CRC covers every byte
//! except itself, start byte included.

use thiserror::Error;

use crate::types::{RawSample, FIELD_LEN, MSG_LEN, START_BYTE};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("Invalid frame length {0}: payload must be a positive multiple of 4 bytes")]
    InvalidLength(usize),
}

/// CRC-8 with feedback polynomial 0x18, LSB first within each byte (CRC-8/MAXIM).
/// Must match the frame producer bit for bit.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &byte in data {
        let mut byte = byte;
        for _ in 0..8 {
            let feedback = (crc ^ byte) & 0x01;
            if feedback == 0x01 {
                crc ^= 0x18;
            }
            crc = (crc >> 1) & 0x7f;
            if feedback == 0x01 {
                crc |= 0x80;
            }
            byte >>= 1;
        }
    }
    crc
}

/// Builds a valid frame carrying `fields`
pub fn encode_frame(fields: &[f32]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(fields.len() * FIELD_LEN + 2);
    frame.push(START_BYTE);
    for value in fields {
        frame.extend_from_slice(&value.to_le_bytes());
    }
    frame.push(crc8(&frame));
    frame
}

/// Decoder counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub frames_decoded: u64,
    pub crc_failures: u64,
    pub bytes_dropped: u64,
}

pub struct FrameDecoder {
    buffer: Vec<u8>,
    msg_len: usize,
    stats: DecoderStats,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MSG_LEN * 2),
            msg_len: MSG_LEN,
            stats: DecoderStats::default(),
        }
    }

    pub fn with_msg_len(msg_len: usize) -> Result<Self, FrameError> {
        if msg_len <= 2 || (msg_len - 2) % FIELD_LEN != 0 {
            return Err(FrameError::InvalidLength(msg_len));
        }
        Ok(Self {
            buffer: Vec::with_capacity(msg_len * 2),
            msg_len,
            stats: DecoderStats::default(),
        })
    }

    pub fn msg_len(&self) -> usize {
        self.msg_len
    }

    pub fn field_count(&self) -> usize {
        (self.msg_len - 2) / FIELD_LEN
    }

    /// Appends `bytes` and returns every sample completed by them, in stream order.
    /// After this call the accumulator is empty or holds a partial frame starting
    /// with the start byte.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<RawSample> {
        self.buffer.extend_from_slice(bytes);
        let mut samples = Vec::new();

        loop {
            match self.buffer.iter().position(|&b| b == START_BYTE) {
                None => {
                    self.stats.bytes_dropped += self.buffer.len() as u64;
                    self.buffer.clear();
                    break;
                }
                Some(0) => {}
                Some(pos) => {
                    self.stats.bytes_dropped += pos as u64;
                    self.buffer.drain(..pos);
                }
            }

            if self.buffer.len() < self.msg_len {
                break;
            }

            let frame: Vec<u8> = self.buffer.drain(..self.msg_len).collect();
            match self.decode_frame(&frame) {
                Some(sample) => {
                    self.stats.frames_decoded += 1;
                    samples.push(sample);
                }
                None => self.stats.crc_failures += 1,
            }
        }

        samples
    }

    /// Number of bytes currently held awaiting completion
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    fn decode_frame(&self, frame: &[u8]) -> Option<RawSample> {
        let (body, crc) = frame.split_at(self.msg_len - 1);
        if crc8(body) != crc[0] {
            return None;
        }

        let fields: Vec<f32> = body[1..]
            .chunks_exact(FIELD_LEN)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        Some(RawSample::from_f32(&fields))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn fields(seed: f32) -> [f32; 9] {
        std::array::from_fn(|i| seed + i as f32 * 0.5)
    }

    #[test]
    fn crc8_matches_reference_check_value() {
        assert_eq!(crc8(b"123456789"), 0xA1);
        assert_eq!(crc8(&[]), 0x00);
        assert_eq!(crc8(&[0xFF]), 0x35);
    }

    #[test]
    fn encoded_frame_has_fixed_length() {
        let frame = encode_frame(&fields(1.0));
        assert_eq!(frame.len(), MSG_LEN);
        assert_eq!(frame[0], START_BYTE);
        assert_eq!(crc8(&frame[..MSG_LEN - 1]), frame[MSG_LEN - 1]);
    }

    #[test]
    fn concatenated_frames_decode_in_order() {
        let mut stream = Vec::new();
        for k in 0..5 {
            stream.extend(encode_frame(&fields(k as f32)));
        }

        let mut decoder = FrameDecoder::new();
        let samples = decoder.feed(&stream);
        assert_eq!(samples.len(), 5);
        for (k, sample) in samples.iter().enumerate() {
            assert_eq!(sample.len(), 9);
            assert_eq!(sample.get(0), Some(k as f64));
            assert_eq!(sample.get(8), Some(k as f64 + 4.0));
        }
        assert_eq!(decoder.pending(), 0);
        assert_eq!(decoder.stats().frames_decoded, 5);
    }

    #[test]
    fn frame_split_across_chunks() {
        let frame = encode_frame(&fields(3.0));
        let mut decoder = FrameDecoder::new();

        assert!(decoder.feed(&frame[..10]).is_empty());
        assert_eq!(decoder.pending(), 10);
        assert!(decoder.feed(&frame[10..37]).is_empty());
        let samples = decoder.feed(&frame[37..]);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].get(0), Some(3.0));
    }

    #[test]
    fn corrupted_frame_is_dropped_without_desync() {
        let mut corrupted = encode_frame(&fields(1.0));
        corrupted[5] ^= 0x01;

        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(&corrupted).is_empty());
        assert_eq!(decoder.stats().crc_failures, 1);

        let mut tail = encode_frame(&fields(7.0));
        tail.extend(encode_frame(&fields(8.0)));
        let samples = decoder.feed(&tail);
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].get(0), Some(7.0));
        assert_eq!(samples[1].get(0), Some(8.0));
    }

    #[test]
    fn garbage_prefix_is_trimmed() {
        let mut stream = vec![0x01, 0x02, 0x03, 0x10];
        stream.extend(encode_frame(&fields(2.0)));

        let mut decoder = FrameDecoder::new();
        let samples = decoder.feed(&stream);
        assert_eq!(samples.len(), 1);
        assert_eq!(decoder.stats().bytes_dropped, 4);
    }

    #[test]
    fn buffer_stays_bounded_on_random_garbage() {
        let mut rng = rand::thread_rng();
        let mut decoder = FrameDecoder::new();

        for _ in 0..200 {
            let chunk: Vec<u8> = (0..rng.gen_range(1..64)).map(|_| rng.gen()).collect();
            // Whatever the garbage decodes to, memory never exceeds one frame.
            let _ = decoder.feed(&chunk);
            assert!(decoder.pending() < MSG_LEN);
        }

        // A fresh valid frame is found once any dangling partial frame is flushed.
        let mut flush = vec![0x00; MSG_LEN];
        flush.extend(encode_frame(&fields(42.0)));
        let recovered = decoder.feed(&flush);
        assert!(recovered
            .iter()
            .any(|s| s.get(0) == Some(42.0) && s.get(8) == Some(46.0)));
    }

    #[test]
    fn garbage_without_start_byte_then_frame() {
        let mut decoder = FrameDecoder::new();
        let garbage: Vec<u8> = (0..200u32).map(|i| (i % 250) as u8).collect();
        assert!(decoder.feed(&garbage).is_empty());
        assert_eq!(decoder.pending(), 0);

        let samples = decoder.feed(&encode_frame(&fields(5.0)));
        assert_eq!(samples.len(), 1);
    }

    #[test]
    fn custom_lengths_are_validated() {
        assert_eq!(FrameDecoder::with_msg_len(14).map(|d| d.field_count()), Ok(3));
        assert_eq!(
            FrameDecoder::with_msg_len(15).err(),
            Some(FrameError::InvalidLength(15))
        );
        assert!(FrameDecoder::with_msg_len(2).is_err());
    }
}
