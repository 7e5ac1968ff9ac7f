//! Capture path from encoder to pre-roll buffer
//!
//! - Byte ring and keyframe index holding the most recent stretch of stream
//! - Producer thread that owns the buffer between recordings
//! - Motion-vector trigger with hysteresis
//! - Encoder collaborators and H.264 splitting

pub mod buffer;
pub mod h264;
pub mod keyframe;
pub mod motion;
pub mod preroll;
pub mod producer;
pub mod ring;
pub mod video;

// Re-export commonly used types
pub use buffer::{Region, RingBuffer};
pub use h264::ChunkSplitter;
pub use keyframe::{KeyframeIndex, DEFAULT_KEYFRAME_SLOTS};
pub use motion::{MotionDetector, MotionEvent, MotionMask, MotionPhase};
pub use preroll::{AppendOutcome, PrerollBuffer, PrerollSnapshot, StreamHeader};
pub use producer::{spawn_producer, ProducerHandle, SequencedChunk, StreamEvent};
pub use ring::SlotRing;
pub use video::{EncoderControl, PipeEncoder, VideoCaptureConfig};

#[cfg(feature = "test-source")]
pub use video::{TestEncoder, TestSourceConfig};
