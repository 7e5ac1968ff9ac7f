//! Typed daemon configuration
//!
//! Populated once at startup. The control protocol mutates individual fields
//! through engine setters, never through string keys.

use std::path::PathBuf;
use std::time::Duration;

use crate::capture::keyframe::DEFAULT_KEYFRAME_SLOTS;

/// Largest ring the engine will try to allocate.
pub const DEFAULT_MAX_RING_BYTES: usize = 256 * 1024 * 1024;

/// Ring capacity in bytes for `buffer` worth of stream at `bitrate_bps`.
pub fn ring_capacity(bitrate_bps: u32, buffer: Duration) -> usize {
    ((bitrate_bps as u64 / 8).saturating_mul(buffer.as_millis() as u64) / 1000) as usize
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Encoder bitrate, used to size the ring
    pub bitrate_bps: u32,
    /// Pre-roll length in milliseconds; 0 disables buffering
    pub buffer_ms: u32,
    pub keyframe_slots: usize,
    /// Buffer requests above this are refused
    pub max_ring_bytes: usize,
    /// Encoder intra-refresh period in frames
    pub intra_period: u32,
    pub recordings_dir: PathBuf,
    pub status_file: Option<PathBuf>,
    /// Control loop period
    pub tick: Duration,
    pub motion: MotionConfig,
    pub boxing: BoxingConfig,
}

impl CaptureConfig {
    pub fn buffer(&self) -> Duration {
        Duration::from_millis(self.buffer_ms as u64)
    }

    pub fn ring_capacity(&self) -> usize {
        ring_capacity(self.bitrate_bps, self.buffer())
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            bitrate_bps: 17_000_000,
            buffer_ms: 0,
            keyframe_slots: DEFAULT_KEYFRAME_SLOTS,
            max_ring_bytes: DEFAULT_MAX_RING_BYTES,
            intra_period: 60,
            recordings_dir: PathBuf::from("/var/lib/preroll/media"),
            status_file: None,
            tick: Duration::from_millis(100),
            motion: MotionConfig::default(),
            boxing: BoxingConfig::default(),
        }
    }
}

/// Motion detection parameters.
#[derive(Debug, Clone)]
pub struct MotionConfig {
    pub enabled: bool,
    /// Vector components within this distance of 0 or 255 are noise
    pub noise: u8,
    /// Changed components per frame that count as motion
    pub threshold: u32,
    /// Consecutive motion frames before Start
    pub start_frames: u32,
    /// Consecutive quiet frames before Stop
    pub stop_frames: u32,
    /// Macroblock grid, `width / 16 + 1` by `height / 16`
    pub columns: usize,
    pub rows: usize,
    /// Optional binary PGM selecting analysed macroblocks
    pub mask_path: Option<PathBuf>,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            noise: 1,
            threshold: 7,
            start_frames: 3,
            stop_frames: 150,
            columns: 121,
            rows: 68,
            mask_path: None,
        }
    }
}

/// Post-capture container wrapping.
#[derive(Debug, Clone)]
pub struct BoxingConfig {
    pub enabled: bool,
    /// Frame rate passed to the muxer
    pub fps: u32,
    pub queue_capacity: usize,
    pub program: String,
}

impl Default for BoxingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            fps: 25,
            queue_capacity: 32,
            program: "MP4Box".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_capacity() {
        // 8 Mbit/s for one second is one megabyte
        assert_eq!(ring_capacity(8_000_000, Duration::from_secs(1)), 1_000_000);
        assert_eq!(ring_capacity(17_000_000, Duration::from_millis(2500)), 5_312_500);
        assert_eq!(ring_capacity(17_000_000, Duration::ZERO), 0);
    }

    #[test]
    fn test_defaults() {
        let config = CaptureConfig::default();
        assert_eq!(config.ring_capacity(), 0);
        assert_eq!(config.tick, Duration::from_millis(100));
        assert_eq!(config.boxing.queue_capacity, 32);
        assert!(!config.motion.enabled);
    }
}
