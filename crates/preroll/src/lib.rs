//! Preroll - pre-roll video capture core
//!
//! Keeps the last few seconds of an encoded camera stream in memory so a
//! recording can start before the event that triggered it.
//!
//! - **`capture`**: ring buffer, keyframe index, producer thread, motion trigger, encoders
//! - **`engine`**: the Idle / Buffering / Recording state machine
//! - **`postprocess`**: bounded queue of container-wrapping jobs
//! - **`command`**: two-letter control pipe protocol
//! - **`storage`** / **`status`**: recording files and the status file
//! - **`test-source`** feature: synthetic encoder without hardware

mod chunk;
mod error;

pub use chunk::{Chunk, ChunkFlags, MotionVectors, MOTION_VECTOR_BYTES};
pub use error::{CaptureError, Result};

pub mod capture;
pub mod command;
pub mod config;
pub mod engine;
pub mod postprocess;
pub mod status;
pub mod storage;

pub use command::{Command, RecordParams};
pub use config::{BoxingConfig, CaptureConfig, MotionConfig};
pub use engine::{CaptureEngine, CaptureState, Trigger};
pub use postprocess::{BoxJob, JobOutcome, Mp4BoxTranscoder, PostProcessQueue, Transcoder};
pub use status::{DaemonStatus, StatusWriter};
pub use storage::{RecordingFile, RecordingPaths, RecordingStore};
