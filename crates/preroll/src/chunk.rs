//! Bitstream chunk and motion-vector types delivered by the encoder

use bytes::Bytes;

/// Encoder buffer flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkFlags(pub u8);

impl ChunkFlags {
    /// Out-of-band codec parameters (SPS/PPS)
    pub const CONFIG: u8 = 0b0000_0001;
    /// Chunk belongs to a keyframe
    pub const KEYFRAME: u8 = 0b0000_0010;
    /// Last chunk of a frame
    pub const FRAME_END: u8 = 0b0000_0100;

    pub fn is_config(&self) -> bool {
        self.0 & Self::CONFIG != 0
    }

    pub fn is_keyframe(&self) -> bool {
        self.0 & Self::KEYFRAME != 0
    }

    pub fn is_frame_end(&self) -> bool {
        self.0 & Self::FRAME_END != 0
    }

    pub fn with(mut self, flag: u8) -> Self {
        self.0 |= flag;
        self
    }
}

/// One buffer of encoded bitstream as delivered by the encoder callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub flags: ChunkFlags,
    pub payload: Bytes,
}

impl Chunk {
    /// Codec parameter bytes
    pub fn config(payload: impl Into<Bytes>) -> Self {
        Self {
            flags: ChunkFlags(ChunkFlags::CONFIG),
            payload: payload.into(),
        }
    }

    /// A complete frame in a single chunk
    pub fn frame(payload: impl Into<Bytes>, keyframe: bool) -> Self {
        let mut flags = ChunkFlags(ChunkFlags::FRAME_END);
        if keyframe {
            flags = flags.with(ChunkFlags::KEYFRAME);
        }
        Self {
            flags,
            payload: payload.into(),
        }
    }

    /// Partial frame data; the frame continues in the next chunk
    pub fn partial(payload: impl Into<Bytes>, keyframe: bool) -> Self {
        let flags = if keyframe {
            ChunkFlags(ChunkFlags::KEYFRAME)
        } else {
            ChunkFlags::default()
        };
        Self {
            flags,
            payload: payload.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Bytes per macroblock in an encoder motion-vector block.
///
/// ```text
/// ┌──────────┬──────────┬──────────────────┐
/// │ dx (i8)  │ dy (i8)  │ SAD (u16, unused)│
/// └──────────┴──────────┴──────────────────┘
/// ```
pub const MOTION_VECTOR_BYTES: usize = 4;

/// One frame's worth of motion vectors, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MotionVectors {
    pub columns: usize,
    pub rows: usize,
    pub data: Bytes,
}

impl MotionVectors {
    /// Wrap a raw vector block. Returns None if `data` is shorter than the grid.
    pub fn new(columns: usize, rows: usize, data: Bytes) -> Option<Self> {
        if data.len() < columns * rows * MOTION_VECTOR_BYTES {
            return None;
        }
        Some(Self {
            columns,
            rows,
            data,
        })
    }

    pub fn macroblocks(&self) -> usize {
        self.columns * self.rows
    }

    /// Raw (dx, dy) bytes of macroblock `index`.
    pub fn vector(&self, index: usize) -> (u8, u8) {
        let base = index * MOTION_VECTOR_BYTES;
        (self.data[base], self.data[base + 1])
    }
}
