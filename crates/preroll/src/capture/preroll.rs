//! Pre-roll buffer: byte ring, keyframe index and stream header as one unit
//!
//! The producer thread owns a `PrerollBuffer` while buffering and moves it to
//! the engine when a recording starts. Because ownership moves, a snapshot
//! can never observe a half-finished append.

use std::io::{self, Write};

use tracing::{debug, warn};

use super::buffer::{Region, RingBuffer};
use super::keyframe::KeyframeIndex;
use crate::chunk::Chunk;
use crate::error::{CaptureError, Result};

/// Bytes reserved for codec parameter sets.
pub const STREAM_HEADER_CAPACITY: usize = 256;

/// Out-of-band codec parameters, prefixed to every recording.
pub struct StreamHeader {
    bytes: [u8; STREAM_HEADER_CAPACITY],
    len: usize,
}

impl StreamHeader {
    pub fn new() -> Self {
        Self {
            bytes: [0u8; STREAM_HEADER_CAPACITY],
            len: 0,
        }
    }

    /// Append parameter bytes. Returns false, leaving the header untouched,
    /// if they do not fit.
    pub fn extend(&mut self, payload: &[u8]) -> bool {
        let end = self.len + payload.len();
        if end > STREAM_HEADER_CAPACITY {
            return false;
        }
        self.bytes[self.len..end].copy_from_slice(payload);
        self.len = end;
        true
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl Default for StreamHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// What an append did besides storing bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Keyframe entries dropped because this write overwrote them
    pub evicted: usize,
    /// First append since the last keyframe to cross half the ring
    pub keyframe_starved: bool,
}

pub struct PrerollBuffer {
    ring: RingBuffer,
    index: KeyframeIndex,
    header: StreamHeader,
    /// Ring offset where the frame currently being received began
    frame_start: Option<usize>,
    frame_len: usize,
    /// Current frame already has an index entry
    frame_indexed: bool,
    /// Previous chunk was a config chunk (parameter sets arrive in runs)
    in_config_run: bool,
    since_keyframe: usize,
    starvation_reported: bool,
    last_seq: Option<u64>,
}

impl PrerollBuffer {
    /// Fails with a configuration fault when the ring cannot be allocated.
    pub fn new(capacity: usize, keyframe_slots: usize) -> Result<Self> {
        Ok(Self {
            ring: RingBuffer::new(capacity)?,
            index: KeyframeIndex::new(keyframe_slots),
            header: StreamHeader::new(),
            frame_start: None,
            frame_len: 0,
            frame_indexed: false,
            in_config_run: false,
            since_keyframe: 0,
            starvation_reported: false,
            last_seq: None,
        })
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    pub fn index(&self) -> &KeyframeIndex {
        &self.index
    }

    pub fn header(&self) -> &StreamHeader {
        &self.header
    }

    /// Sequence number of the last chunk this buffer consumed.
    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }

    /// Consume one encoder chunk.
    ///
    /// Config chunks go to the stream header. Everything else lands in the
    /// ring after the keyframe index has been cleared of entries the write
    /// would overwrite.
    pub fn append(&mut self, seq: u64, chunk: &Chunk) -> Result<AppendOutcome> {
        self.last_seq = Some(seq);

        if chunk.flags.is_config() {
            self.capture_config(chunk);
            return Ok(AppendOutcome::default());
        }
        self.in_config_run = false;

        let cap = self.ring.capacity();
        let len = chunk.len();
        let mut outcome = AppendOutcome::default();

        if len > 0 {
            let frame_start = *self.frame_start.get_or_insert(self.ring.write_pos());
            self.frame_len += len;
            if self.frame_len > cap {
                return Err(CaptureError::FrameTooLarge {
                    frame_len: self.frame_len,
                    capacity: cap,
                });
            }

            outcome.evicted = self.index.evict_covered(&self.ring, len);

            if chunk.flags.is_keyframe() && !self.frame_indexed {
                self.index.push(frame_start);
                self.frame_indexed = true;
                self.since_keyframe = self.frame_len - len;
                self.starvation_reported = false;
            }

            self.ring.append(&chunk.payload);
            self.since_keyframe += len;
        }

        if chunk.flags.is_frame_end() {
            self.abandon_frame();
        }

        if outcome.evicted > 0 && self.index.is_empty() {
            return Err(CaptureError::KeyframeIndexExhausted { capacity: cap });
        }
        self.check_invariants()?;

        if self.since_keyframe > cap / 2 && !self.starvation_reported {
            self.starvation_reported = true;
            outcome.keyframe_starved = true;
        }

        Ok(outcome)
    }

    fn capture_config(&mut self, chunk: &Chunk) {
        // Encoders that repeat parameter sets inline send a fresh run before
        // each keyframe; keep only the latest run.
        if !self.in_config_run {
            self.header.clear();
            self.in_config_run = true;
        }
        if !self.header.extend(&chunk.payload) {
            warn!(
                len = chunk.len(),
                capacity = STREAM_HEADER_CAPACITY,
                "Stream header overflow, dropping config chunk"
            );
        }
    }

    /// The oldest index entry must point at retained bytes no further back
    /// than the ring holds.
    pub fn check_invariants(&self) -> Result<()> {
        let Some(oldest) = self.index.oldest() else {
            return Ok(());
        };
        match self.ring.distance_to_cursor(oldest) {
            Some(distance) if distance <= self.ring.len() => Ok(()),
            _ => Err(CaptureError::Invariant(format!(
                "keyframe offset {} not retained (cursor {}, wrapped {})",
                oldest,
                self.ring.write_pos(),
                self.ring.is_wrapped()
            ))),
        }
    }

    /// Header plus every byte from the oldest intact keyframe to the cursor.
    ///
    /// With no keyframe retained the body is empty.
    pub fn snapshot(&self) -> Result<PrerollSnapshot<'_>> {
        let body = match self.index.oldest() {
            Some(offset) => self.ring.materialize(offset)?,
            None => Region::EMPTY,
        };
        Ok(PrerollSnapshot {
            header: self.header.as_bytes(),
            body,
            last_seq: self.last_seq,
            has_keyframe: !self.index.is_empty(),
        })
    }

    /// Empty the ring and index for a new buffering period. The stream
    /// header is kept, since encoders send it only at stream start.
    pub fn rewind(&mut self) {
        self.ring.reset();
        self.index.clear();
        self.abandon_frame();
        self.in_config_run = false;
        self.since_keyframe = 0;
        self.starvation_reported = false;
        debug!(capacity = self.ring.capacity(), "Pre-roll buffer rewound");
    }

    /// Forget the frame in progress; the next chunk starts a new one.
    pub fn abandon_frame(&mut self) {
        self.frame_start = None;
        self.frame_len = 0;
        self.frame_indexed = false;
    }

    /// Forget everything including the stream header.
    pub fn reset(&mut self) {
        self.rewind();
        self.header.clear();
        self.last_seq = None;
    }
}

/// Borrowed view of a pre-roll, ready to be written out.
#[derive(Debug, Clone, Copy)]
pub struct PrerollSnapshot<'a> {
    pub header: &'a [u8],
    pub body: Region<'a>,
    /// Last chunk covered by this snapshot
    pub last_seq: Option<u64>,
    pub has_keyframe: bool,
}

impl PrerollSnapshot<'_> {
    pub fn len(&self) -> usize {
        self.header.len() + self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(self.header)?;
        self.body.write_to(out)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        out.extend_from_slice(self.header);
        out.extend_from_slice(&self.body.to_vec());
        out
    }
}
