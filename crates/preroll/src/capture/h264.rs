//! H.264 Annex-B splitting for external encoders
//!
//! Encoders that write an elementary stream to a pipe give no buffer flags,
//! so the stream is cut at start codes and each NAL unit becomes one chunk:
//! - SPS/PPS are config chunks
//! - the first slice of an IDR picture starts a keyframe
//! - every slice ends a frame
//!
//! Start codes stay in the payload so chunks can be written to disk as-is.

use bytes::{Bytes, BytesMut};
use tracing::warn;

use crate::chunk::{Chunk, ChunkFlags};

/// NAL unit types (5 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalUnitType {
    /// Non-IDR slice (P or B frame)
    SliceNonIdr,
    /// IDR slice (keyframe)
    SliceIdr,
    Sei,
    Sps,
    Pps,
    /// Access unit delimiter
    Aud,
    Other(u8),
}

impl From<u8> for NalUnitType {
    fn from(value: u8) -> Self {
        match value & 0x1F {
            1 => NalUnitType::SliceNonIdr,
            5 => NalUnitType::SliceIdr,
            6 => NalUnitType::Sei,
            7 => NalUnitType::Sps,
            8 => NalUnitType::Pps,
            9 => NalUnitType::Aud,
            n => NalUnitType::Other(n),
        }
    }
}

impl NalUnitType {
    pub fn is_parameter_set(&self) -> bool {
        matches!(self, NalUnitType::Sps | NalUnitType::Pps)
    }

    pub fn is_slice(&self) -> bool {
        matches!(self, NalUnitType::SliceNonIdr | NalUnitType::SliceIdr)
    }
}

/// Maximum buffered bytes without a complete NAL unit
const MAX_NAL_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Cuts an Annex-B byte stream into flagged chunks.
pub struct ChunkSplitter {
    buffer: BytesMut,
    /// Bytes of `buffer` already searched for the next start code
    scanned: usize,
}

impl ChunkSplitter {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            scanned: 0,
        }
    }

    /// Feed stream bytes; returns every NAL unit completed by them.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Chunk> {
        self.buffer.extend_from_slice(data);
        if self.buffer.len() > MAX_NAL_BUFFER_SIZE {
            warn!(
                limit = MAX_NAL_BUFFER_SIZE,
                "H.264 splitter buffer overflow, resetting"
            );
            self.buffer.clear();
            self.scanned = 0;
            return Vec::new();
        }

        let mut chunks = Vec::new();
        loop {
            let Some(start) = find_start_code(&self.buffer, 0) else {
                break;
            };
            if start > 0 {
                // Garbage before the first start code
                let _ = self.buffer.split_to(start);
                self.scanned = self.scanned.saturating_sub(start);
            }

            let body = start_code_len(&self.buffer, 0);
            let from = self.scanned.max(body);
            match find_start_code(&self.buffer, from) {
                Some(end) => {
                    let nal = self.buffer.split_to(end).freeze();
                    self.scanned = 0;
                    chunks.push(classify(nal));
                }
                None => {
                    // Keep the last few bytes unscanned: a start code may
                    // straddle the next feed.
                    self.scanned = self.buffer.len().saturating_sub(3).max(body);
                    break;
                }
            }
        }
        chunks
    }

    /// Emit whatever is buffered as a final chunk.
    pub fn flush(&mut self) -> Option<Chunk> {
        self.scanned = 0;
        let start = find_start_code(&self.buffer, 0)?;
        let _ = self.buffer.split_to(start);
        if self.buffer.len() <= start_code_len(&self.buffer, 0) {
            self.buffer.clear();
            return None;
        }
        Some(classify(self.buffer.split().freeze()))
    }
}

impl Default for ChunkSplitter {
    fn default() -> Self {
        Self::new()
    }
}

/// Turn one start-code-prefixed NAL unit into a flagged chunk.
fn classify(nal: Bytes) -> Chunk {
    let header_at = start_code_len(&nal, 0);
    let Some(&header) = nal.get(header_at) else {
        return Chunk::partial(nal, false);
    };
    let nal_type = NalUnitType::from(header);

    let mut flags = ChunkFlags::default();
    if nal_type.is_parameter_set() {
        flags = flags.with(ChunkFlags::CONFIG);
    } else if nal_type.is_slice() {
        flags = flags.with(ChunkFlags::FRAME_END);
        // first_mb_in_slice is ue(v); a leading 1 bit encodes 0, i.e. the
        // first slice of a picture.
        let first_slice = nal.get(header_at + 1).is_some_and(|b| b & 0x80 != 0);
        if nal_type == NalUnitType::SliceIdr && first_slice {
            flags = flags.with(ChunkFlags::KEYFRAME);
        }
    }
    Chunk {
        flags,
        payload: nal,
    }
}

/// Position of the next 3- or 4-byte start code at or after `offset`.
fn find_start_code(buf: &[u8], offset: usize) -> Option<usize> {
    if buf.len() < offset + 3 {
        return None;
    }
    (offset..buf.len() - 2).find_map(|i| {
        if buf[i] != 0 || buf[i + 1] != 0 {
            return None;
        }
        if buf[i + 2] == 1 {
            Some(i)
        } else if buf[i + 2] == 0 && buf.get(i + 3) == Some(&1) {
            Some(i)
        } else {
            None
        }
    })
}

fn start_code_len(buf: &[u8], pos: usize) -> usize {
    if buf.get(pos..pos + 4) == Some(&[0u8, 0, 0, 1][..]) {
        4
    } else {
        3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> Vec<u8> {
        vec![
            0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1E, // SPS
            0x00, 0x00, 0x00, 0x01, 0x68, 0xCE, 0x38, 0x80, // PPS
            0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84, 0x10, // IDR, first slice
            0x00, 0x00, 0x01, 0x65, 0x40, 0x84, // IDR, second slice
            0x00, 0x00, 0x00, 0x01, 0x41, 0x9A, 0x24, // P
            0x00, 0x00, 0x00, 0x01, 0x09, 0x10, // AUD
        ]
    }

    #[test]
    fn test_nal_type_parsing() {
        assert_eq!(NalUnitType::from(0x65), NalUnitType::SliceIdr);
        assert_eq!(NalUnitType::from(0x67), NalUnitType::Sps);
        assert_eq!(NalUnitType::from(0x68), NalUnitType::Pps);
        assert_eq!(NalUnitType::from(0x41), NalUnitType::SliceNonIdr);
        assert_eq!(NalUnitType::from(0x0C), NalUnitType::Other(12));
    }

    #[test]
    fn test_split_and_classify() {
        let mut splitter = ChunkSplitter::new();
        let chunks = splitter.feed(&stream());
        // The trailing AUD has no terminating start code yet
        assert_eq!(chunks.len(), 5);

        assert!(chunks[0].flags.is_config());
        assert!(chunks[1].flags.is_config());
        assert!(chunks[2].flags.is_keyframe() && chunks[2].flags.is_frame_end());
        // Second IDR slice ends a frame but does not start a keyframe
        assert!(!chunks[3].flags.is_keyframe() && chunks[3].flags.is_frame_end());
        assert!(!chunks[4].flags.is_keyframe() && chunks[4].flags.is_frame_end());

        // Payloads keep their start codes
        assert_eq!(&chunks[0].payload[..5], &[0, 0, 0, 1, 0x67]);
        assert_eq!(&chunks[3].payload[..4], &[0, 0, 1, 0x65]);

        let last = splitter.flush().unwrap();
        assert_eq!(last.flags, ChunkFlags::default());
        assert_eq!(&last.payload[..], &[0, 0, 0, 1, 0x09, 0x10]);
    }

    #[test]
    fn test_byte_at_a_time_matches_bulk() {
        let data = stream();
        let mut bulk = ChunkSplitter::new();
        let expected = bulk.feed(&data);

        let mut trickle = ChunkSplitter::new();
        let mut got = Vec::new();
        for b in &data {
            got.extend(trickle.feed(std::slice::from_ref(b)));
        }
        assert_eq!(got, expected);
    }

    #[test]
    fn test_concatenated_payloads_reproduce_stream() {
        let data = stream();
        let mut splitter = ChunkSplitter::new();
        let mut out = Vec::new();
        for piece in data.chunks(5) {
            for chunk in splitter.feed(piece) {
                out.extend_from_slice(&chunk.payload);
            }
        }
        if let Some(chunk) = splitter.flush() {
            out.extend_from_slice(&chunk.payload);
        }
        assert_eq!(out, data);
    }

    #[test]
    fn test_leading_garbage_dropped() {
        let mut splitter = ChunkSplitter::new();
        let mut data = vec![0xFF, 0xFE];
        data.extend_from_slice(&stream());
        let chunks = splitter.feed(&data);
        assert!(chunks[0].flags.is_config());
        assert_eq!(&chunks[0].payload[..4], &[0, 0, 0, 1]);
    }
}
