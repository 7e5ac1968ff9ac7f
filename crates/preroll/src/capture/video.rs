//! Encoder collaborators
//!
//! Provides the `EncoderControl` seam the engine drives, an implementation
//! backed by an external encoder process (libcamera-vid) writing H.264 to a
//! pipe, and a synthetic test source for development without hardware.

use anyhow::{Context, Result};
use bytes::Bytes;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

use super::h264::ChunkSplitter;
use super::producer::ProducerHandle;
use crate::chunk::{MotionVectors, MOTION_VECTOR_BYTES};

/// Signals the engine sends to the encoder.
pub trait EncoderControl: Send {
    /// Start or stop delivering chunks to the producer.
    fn set_capture(&mut self, enabled: bool);
    /// Frames between keyframes.
    fn set_intra_period(&mut self, frames: u32);
    /// Ask for a keyframe as soon as possible.
    fn request_keyframe(&mut self);
}

/// Video capture configuration
#[derive(Debug, Clone)]
pub struct VideoCaptureConfig {
    /// Encoder executable
    pub program: String,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Frames per second
    pub fps: u32,
    /// Bitrate in bits per second (0 = auto)
    pub bitrate: u32,
    /// Keyframe interval in frames (0 = auto)
    pub intra_period: u32,
    /// File or FIFO delivering raw motion-vector blocks
    pub motion_source: Option<PathBuf>,
}

impl Default for VideoCaptureConfig {
    fn default() -> Self {
        Self {
            program: "libcamera-vid".to_string(),
            width: 1920,
            height: 1080,
            fps: 25,
            bitrate: 17_000_000,
            intra_period: 60,
            motion_source: None,
        }
    }
}

impl VideoCaptureConfig {
    /// Macroblock grid of the encoder's vector output: one spare column.
    pub fn motion_grid(&self) -> (usize, usize) {
        let columns = (self.width as usize + 15) / 16 + 1;
        let rows = (self.height as usize + 15) / 16;
        (columns, rows)
    }

    fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-t".to_string(),
            "0".to_string(), // Run indefinitely
            "--width".to_string(),
            self.width.to_string(),
            "--height".to_string(),
            self.height.to_string(),
            "--framerate".to_string(),
            self.fps.to_string(),
            "--codec".to_string(),
            "h264".to_string(),
            "--inline".to_string(),
            "--flush".to_string(),
            "-o".to_string(),
            "-".to_string(),
        ];
        if self.bitrate > 0 {
            args.push("--bitrate".to_string());
            args.push(self.bitrate.to_string());
        }
        if self.intra_period > 0 {
            args.push("--intra".to_string());
            args.push(self.intra_period.to_string());
        }
        args
    }
}

/// Encoder running as a child process with H.264 on stdout.
pub struct PipeEncoder {
    config: VideoCaptureConfig,
    producer: ProducerHandle,
    capturing: Arc<AtomicBool>,
    child: Option<Child>,
    keyframe_warned: bool,
}

impl PipeEncoder {
    /// Spawn the encoder and its reader threads. Capture starts gated off.
    pub fn start(config: VideoCaptureConfig, producer: ProducerHandle) -> Result<Self> {
        let capturing = Arc::new(AtomicBool::new(false));

        if let Some(path) = config.motion_source.clone() {
            let (columns, rows) = config.motion_grid();
            let producer = producer.clone();
            let capturing = capturing.clone();
            thread::Builder::new()
                .name("motion-reader".into())
                .spawn(move || read_motion(path, columns, rows, producer, capturing))
                .context("Failed to spawn motion reader thread")?;
        }

        let mut encoder = Self {
            config,
            producer,
            capturing,
            child: None,
            keyframe_warned: false,
        };
        encoder.spawn_process()?;
        Ok(encoder)
    }

    fn spawn_process(&mut self) -> Result<()> {
        let args = self.config.args();
        info!(
            "Starting {}: {}x{} @ {}fps",
            self.config.program, self.config.width, self.config.height, self.config.fps
        );
        debug!("Encoder args: {:?}", args);

        let mut child = Command::new(&self.config.program)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to spawn {}. Is it installed?", self.config.program))?;

        let stdout = child
            .stdout
            .take()
            .context("Failed to capture encoder stdout")?;

        let producer = self.producer.clone();
        let capturing = self.capturing.clone();
        let buf_size = if self.config.bitrate > 0 && self.config.fps > 0 {
            (self.config.bitrate / 8 / self.config.fps).max(16384) as usize
        } else {
            65536
        };
        thread::Builder::new()
            .name("encoder-reader".into())
            .spawn(move || read_stream(stdout, buf_size, producer, capturing))
            .context("Failed to spawn encoder reader thread")?;

        self.child = Some(child);
        Ok(())
    }

    pub fn config(&self) -> &VideoCaptureConfig {
        &self.config
    }

    /// Stop the encoder process
    pub fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            info!("Stopping encoder");
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl EncoderControl for PipeEncoder {
    fn set_capture(&mut self, enabled: bool) {
        let was = self.capturing.swap(enabled, Ordering::SeqCst);
        if was != enabled {
            info!(enabled, "Encoder capture");
        }
    }

    fn set_intra_period(&mut self, frames: u32) {
        if frames == self.config.intra_period {
            return;
        }
        // The external process only takes the period at startup
        info!(frames, "Restarting encoder with new intra period");
        self.config.intra_period = frames;
        self.stop();
        if let Err(e) = self.spawn_process() {
            error!(error = %e, "Encoder restart failed");
        }
    }

    fn request_keyframe(&mut self) {
        if !self.keyframe_warned {
            warn!(
                intra_period = self.config.intra_period,
                "External encoder cannot take keyframe requests; lower the intra period"
            );
            self.keyframe_warned = true;
        }
    }
}

impl Drop for PipeEncoder {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Split encoder output into chunks and hand them to the producer while
/// capture is enabled. The pipe is drained either way.
fn read_stream<R: Read>(
    mut reader: R,
    buf_size: usize,
    producer: ProducerHandle,
    capturing: Arc<AtomicBool>,
) {
    let mut splitter = ChunkSplitter::new();
    let mut buf = vec![0u8; buf_size];
    let mut total_bytes = 0u64;
    let mut chunk_count = 0u64;

    loop {
        match reader.read(&mut buf) {
            Ok(0) => {
                info!("Video stream ended (EOF)");
                break;
            }
            Ok(n) => {
                total_bytes += n as u64;
                for chunk in splitter.feed(&buf[..n]) {
                    if !capturing.load(Ordering::Relaxed) {
                        continue;
                    }
                    chunk_count += 1;
                    if !producer.push_chunk(chunk) {
                        info!("Producer gone, stopping stream reader");
                        return;
                    }
                }
                if chunk_count > 0 && chunk_count % 1000 == 0 {
                    debug!(chunk_count, total_bytes, "Video capture progress");
                }
            }
            Err(e) => {
                error!(error = %e, "Error reading video stream");
                break;
            }
        }
    }

    info!(chunk_count, total_bytes, "Video capture finished");
}

/// Read fixed-size motion-vector blocks, one per frame.
fn read_motion(
    path: PathBuf,
    columns: usize,
    rows: usize,
    producer: ProducerHandle,
    capturing: Arc<AtomicBool>,
) {
    let mut file = match File::open(&path) {
        Ok(file) => file,
        Err(e) => {
            error!(error = %e, path = ?path, "Cannot open motion-vector source");
            return;
        }
    };
    info!(path = ?path, columns, rows, "Reading motion vectors");

    let block = columns * rows * MOTION_VECTOR_BYTES;
    let mut buf = vec![0u8; block];
    loop {
        if let Err(e) = file.read_exact(&mut buf) {
            info!(error = %e, "Motion-vector source ended");
            break;
        }
        if !capturing.load(Ordering::Relaxed) {
            continue;
        }
        let Some(vectors) = MotionVectors::new(columns, rows, Bytes::copy_from_slice(&buf)) else {
            continue;
        };
        if !producer.push_motion(vectors) {
            break;
        }
    }
}

/// Configuration for test video source
#[cfg(feature = "test-source")]
#[derive(Debug, Clone)]
pub struct TestSourceConfig {
    /// Frames per second
    pub fps: u32,
    /// Simulated frame size in bytes
    pub frame_size: usize,
    /// Simulate keyframes every N frames
    pub intra_period: u32,
    /// Motion-vector grid
    pub motion_grid: (usize, usize),
    /// A motion burst starts every this many frames
    pub motion_period: u32,
    /// Frames of motion per burst
    pub motion_burst: u32,
}

#[cfg(feature = "test-source")]
impl Default for TestSourceConfig {
    fn default() -> Self {
        Self {
            fps: 25,
            frame_size: 10000, // ~10KB per frame
            intra_period: 25,
            motion_grid: (41, 23),
            motion_period: 750,
            motion_burst: 100,
        }
    }
}

/// Synthetic encoder producing H.264-shaped chunks and motion bursts.
#[cfg(feature = "test-source")]
pub struct TestEncoder {
    capturing: Arc<AtomicBool>,
    intra_period: Arc<std::sync::atomic::AtomicU32>,
    keyframe_requested: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

#[cfg(feature = "test-source")]
impl TestEncoder {
    pub fn start(config: TestSourceConfig, producer: ProducerHandle) -> Result<Self> {
        use std::sync::atomic::AtomicU32;

        let capturing = Arc::new(AtomicBool::new(false));
        let intra_period = Arc::new(AtomicU32::new(config.intra_period.max(1)));
        let keyframe_requested = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(true));

        let source = TestSource {
            config,
            producer,
            capturing: capturing.clone(),
            intra_period: intra_period.clone(),
            keyframe_requested: keyframe_requested.clone(),
            running: running.clone(),
        };
        let thread = thread::Builder::new()
            .name("test-source".into())
            .spawn(move || source.run())
            .context("Failed to spawn test source thread")?;

        Ok(Self {
            capturing,
            intra_period,
            keyframe_requested,
            running,
            thread: Some(thread),
        })
    }
}

#[cfg(feature = "test-source")]
impl EncoderControl for TestEncoder {
    fn set_capture(&mut self, enabled: bool) {
        self.capturing.store(enabled, Ordering::SeqCst);
    }

    fn set_intra_period(&mut self, frames: u32) {
        self.intra_period.store(frames.max(1), Ordering::SeqCst);
    }

    fn request_keyframe(&mut self) {
        self.keyframe_requested.store(true, Ordering::SeqCst);
    }
}

#[cfg(feature = "test-source")]
impl Drop for TestEncoder {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(feature = "test-source")]
struct TestSource {
    config: TestSourceConfig,
    producer: ProducerHandle,
    capturing: Arc<AtomicBool>,
    intra_period: Arc<std::sync::atomic::AtomicU32>,
    keyframe_requested: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
}

#[cfg(feature = "test-source")]
impl TestSource {
    const SPS: &'static [u8] = &[0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1E];
    const PPS: &'static [u8] = &[0x00, 0x00, 0x00, 0x01, 0x68, 0xCE, 0x38, 0x80];

    fn run(self) {
        use crate::chunk::Chunk;
        use std::time::Duration;

        let frame_interval = Duration::from_micros(1_000_000 / self.config.fps.max(1) as u64);
        let (columns, rows) = self.config.motion_grid;
        let mut frame_num = 0u32;
        let mut since_keyframe = 0u32;
        let mut need_headers = true;

        info!(
            "Test video source started: {}fps, {}B frames",
            self.config.fps, self.config.frame_size
        );

        while self.running.load(Ordering::Relaxed) {
            thread::sleep(frame_interval);

            if !self.capturing.load(Ordering::Relaxed) {
                need_headers = true;
                continue;
            }

            let mut is_keyframe = need_headers
                || since_keyframe >= self.intra_period.load(Ordering::Relaxed)
                || self.keyframe_requested.swap(false, Ordering::SeqCst);
            if need_headers {
                self.producer.push_chunk(Chunk::config(Bytes::from_static(Self::SPS)));
                self.producer.push_chunk(Chunk::config(Bytes::from_static(Self::PPS)));
                need_headers = false;
                is_keyframe = true;
            }

            let frame = build_frame(frame_num, is_keyframe, self.config.frame_size);
            if !self.producer.push_chunk(Chunk::frame(frame, is_keyframe)) {
                break;
            }
            since_keyframe = if is_keyframe { 1 } else { since_keyframe + 1 };

            let in_burst =
                frame_num % self.config.motion_period.max(1) < self.config.motion_burst;
            let magnitude = if in_burst { 40 } else { 0 };
            let data = vec![magnitude; columns * rows * MOTION_VECTOR_BYTES];
            if let Some(vectors) = MotionVectors::new(columns, rows, Bytes::from(data)) {
                self.producer.push_motion(vectors);
            }

            frame_num = frame_num.wrapping_add(1);
            if frame_num % 300 == 0 {
                debug!("Test source: {} frames generated", frame_num);
            }
        }

        info!("Test video source stopped after {} frames", frame_num);
    }
}

/// Start code, slice header and a payload free of start-code patterns.
#[cfg(feature = "test-source")]
fn build_frame(frame_num: u32, keyframe: bool, size: usize) -> Bytes {
    let mut data = Vec::with_capacity(size.max(16));
    data.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
    data.push(if keyframe { 0x65 } else { 0x41 });
    data.push(0x88); // first_mb_in_slice = 0
    data.extend_from_slice(&(frame_num | 0x0101_0101).to_be_bytes());
    while data.len() < size {
        data.push(0x5A);
    }
    Bytes::from(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_motion_grid() {
        let config = VideoCaptureConfig::default();
        assert_eq!(config.motion_grid(), (121, 68));

        let small = VideoCaptureConfig {
            width: 640,
            height: 480,
            ..Default::default()
        };
        assert_eq!(small.motion_grid(), (41, 30));
    }

    #[test]
    fn test_encoder_args() {
        let config = VideoCaptureConfig {
            intra_period: 30,
            bitrate: 0,
            ..Default::default()
        };
        let args = config.args();
        assert!(args.contains(&"--inline".to_string()));
        assert!(!args.contains(&"--bitrate".to_string()));
        let intra = args.iter().position(|a| a == "--intra").unwrap();
        assert_eq!(args[intra + 1], "30");
    }

    #[cfg(feature = "test-source")]
    #[test]
    fn test_synthetic_frame_shape() {
        let frame = build_frame(7, true, 64);
        assert_eq!(frame.len(), 64);
        assert_eq!(&frame[..5], &[0, 0, 0, 1, 0x65]);
        // No start code after the first one
        let mut splitter = ChunkSplitter::new();
        assert!(splitter.feed(&frame).is_empty());
        let chunk = splitter.flush().unwrap();
        assert!(chunk.flags.is_keyframe());
    }
}
