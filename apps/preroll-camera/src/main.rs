//! Preroll Camera Daemon
//!
//! Keeps the last seconds of the camera stream in memory and writes them in
//! front of every recording. Recordings are started by motion or by
//! two-letter commands written to the control pipe.
//!
//! ## Usage
//!
//! ```bash
//! # Five seconds of pre-roll at the default bitrate
//! PREROLL_BUFFER_MS=5000 preroll-camera
//!
//! # With motion detection from the start
//! preroll-camera -md
//!
//! # Run with test source (development)
//! preroll-camera --test-source
//!
//! # Start a 30 second recording
//! echo "ca 1 30" > /var/run/preroll/control
//! ```

use anyhow::{Context, Result};
use std::ffi::CString;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::block_in_place;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use preroll::capture::{spawn_producer, EncoderControl, PipeEncoder, VideoCaptureConfig};
use preroll::{
    BoxingConfig, CaptureConfig, CaptureEngine, CaptureError, MotionConfig, Mp4BoxTranscoder,
};

/// Daemon configuration from environment/args
struct Config {
    capture: CaptureConfig,
    /// Encoder settings
    video: VideoCaptureConfig,
    /// FIFO read for control lines
    control_pipe: Option<PathBuf>,
    /// Use test source instead of real camera
    test_source: bool,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().filter(|s| !s.is_empty()).map(PathBuf::from)
}

impl Config {
    fn from_env() -> Result<Self> {
        let args: Vec<String> = std::env::args().collect();
        let test_source = args.iter().any(|arg| arg == "--test-source");
        let motion_flag = args.iter().any(|arg| arg == "-md");

        let video = VideoCaptureConfig {
            program: env_or("PREROLL_ENCODER", "libcamera-vid".to_string()),
            width: env_or("PREROLL_WIDTH", 1920),
            height: env_or("PREROLL_HEIGHT", 1080),
            fps: env_or("PREROLL_FPS", 25),
            bitrate: env_or("PREROLL_BITRATE", 17_000_000),
            intra_period: env_or("PREROLL_INTRA", 60),
            motion_source: env_path("PREROLL_MOTION_VECTORS"),
        };
        if video.fps == 0 {
            anyhow::bail!("PREROLL_FPS must be positive");
        }
        let (columns, rows) = video.motion_grid();

        let capture = CaptureConfig {
            bitrate_bps: video.bitrate,
            buffer_ms: env_or("PREROLL_BUFFER_MS", 0),
            intra_period: video.intra_period,
            recordings_dir: env_path("PREROLL_MEDIA_DIR")
                .unwrap_or_else(|| PathBuf::from("/var/lib/preroll/media")),
            status_file: env_path("PREROLL_STATUS_FILE"),
            tick: Duration::from_millis(env_or("PREROLL_TICK_MS", 100).max(1)),
            max_ring_bytes: env_or(
                "PREROLL_MAX_RING_BYTES",
                CaptureConfig::default().max_ring_bytes,
            ),
            motion: MotionConfig {
                enabled: motion_flag || env_or("PREROLL_MOTION", 0u8) != 0,
                noise: env_or("PREROLL_MOTION_NOISE", 1),
                threshold: env_or("PREROLL_MOTION_THRESHOLD", 7),
                start_frames: env_or("PREROLL_MOTION_START", 3),
                stop_frames: env_or("PREROLL_MOTION_STOP", 150),
                columns,
                rows,
                mask_path: env_path("PREROLL_MOTION_MASK"),
            },
            boxing: BoxingConfig {
                enabled: env_or("PREROLL_BOXING", 0u8) != 0,
                fps: env_or("PREROLL_BOX_FPS", video.fps),
                queue_capacity: env_or("PREROLL_BOX_QUEUE", 32),
                program: env_or("PREROLL_MP4BOX", "MP4Box".to_string()),
            },
            ..CaptureConfig::default()
        };

        Ok(Self {
            capture,
            video,
            control_pipe: env_path("PREROLL_CONTROL_PIPE"),
            test_source,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("preroll=info".parse()?),
        )
        .init();

    // Load configuration
    let config = Config::from_env()?;

    info!("Preroll camera starting");
    info!(
        "  Video: {}x{} @ {}fps, {} bps",
        config.video.width, config.video.height, config.video.fps, config.video.bitrate
    );
    info!("  Pre-roll: {} ms", config.capture.buffer_ms);
    info!("  Motion detection: {}", config.capture.motion.enabled);
    info!("  Boxing: {}", config.capture.boxing.enabled);
    info!("  Recordings: {:?}", config.capture.recordings_dir);
    info!("  Test source: {}", config.test_source);

    let (event_tx, mut events) = mpsc::unbounded_channel();
    let (producer, producer_thread) =
        spawn_producer(event_tx).context("Failed to start producer thread")?;

    let encoder: Box<dyn EncoderControl> = if config.test_source {
        #[cfg(feature = "test-source")]
        {
            info!("Starting test video source");
            Box::new(preroll::capture::TestEncoder::start(
                preroll::capture::TestSourceConfig {
                    fps: config.video.fps,
                    intra_period: config.video.intra_period,
                    motion_grid: config.video.motion_grid(),
                    ..Default::default()
                },
                producer.clone(),
            )?)
        }
        #[cfg(not(feature = "test-source"))]
        {
            anyhow::bail!("Test source not enabled. Rebuild with --features test-source");
        }
    } else {
        info!("Starting video capture");
        Box::new(
            PipeEncoder::start(config.video.clone(), producer.clone())
                .context("Failed to start video capture")?,
        )
    };

    let transcoder = Mp4BoxTranscoder::new(
        config.capture.boxing.program.clone(),
        config.capture.boxing.fps,
    );
    let mut engine = CaptureEngine::new(
        config.capture.clone(),
        producer.clone(),
        encoder,
        Box::new(transcoder),
    )
    .context("Failed to start capture engine")?;

    // The sender stays alive here so the channel never closes
    let (command_tx, mut commands) = mpsc::channel::<String>(16);
    if let Some(path) = config.control_pipe.clone() {
        spawn_control_reader(path, command_tx.clone())
            .context("Failed to start control pipe reader")?;
    }

    let mut tick = tokio::time::interval(config.capture.tick);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    info!("Ready");

    // Engine steps may wait on the producer rendezvous, so they run off the
    // async worker
    let result = loop {
        let step = tokio::select! {
            _ = tick.tick() => block_in_place(|| engine.tick(Instant::now()).map(|_| ())),
            event = events.recv() => match event {
                Some(event) => block_in_place(|| engine.handle_event(event)),
                None => Err(CaptureError::ProducerGone),
            },
            Some(line) = commands.recv() => block_in_place(|| engine.apply_line(&line)),
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break Ok(());
            }
            _ = sigterm.recv() => {
                info!("Terminated, shutting down");
                break Ok(());
            }
        };
        match step {
            Err(e) if e.is_fatal() => break Err(e),
            // Already logged where it happened
            Err(e) => debug!(error = %e, "Step failed"),
            Ok(()) => {}
        }
    };

    if let Err(e) = &result {
        error!(error = %e, "Capture engine failed");
    }
    if let Err(e) = block_in_place(|| engine.shutdown()) {
        warn!(error = %e, "Shutdown incomplete");
    }
    info!(recordings = engine.produced_count(), "Preroll camera stopped");
    // Stops the encoder process before waiting on the producer
    drop(engine);
    drop(command_tx);
    if producer_thread.join().is_err() {
        error!("Producer thread panicked");
    }

    result.context("Capture engine failed")
}

/// Read control lines from a FIFO on a dedicated thread.
///
/// The pipe is reopened whenever the last writer closes it.
fn spawn_control_reader(
    path: PathBuf,
    commands: mpsc::Sender<String>,
) -> std::io::Result<thread::JoinHandle<()>> {
    ensure_fifo(&path);
    thread::Builder::new()
        .name("control-pipe".into())
        .spawn(move || loop {
            // Blocks until a writer opens the pipe
            let file = match File::open(&path) {
                Ok(file) => file,
                Err(e) => {
                    warn!(error = %e, path = ?path, "Cannot open control pipe, retrying");
                    thread::sleep(Duration::from_secs(1));
                    continue;
                }
            };
            for line in BufReader::new(file).lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "Control pipe read failed");
                        break;
                    }
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                debug!(line, "Control line");
                if commands.blocking_send(line.to_string()).is_err() {
                    return;
                }
            }
        })
}

fn ensure_fifo(path: &Path) {
    if path.exists() {
        return;
    }
    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        warn!(path = ?path, "Control pipe path contains a NUL byte");
        return;
    };
    let result = unsafe { libc::mkfifo(c_path.as_ptr(), 0o660) };
    if result == 0 {
        info!(path = ?path, "Control pipe created");
    } else {
        let e = std::io::Error::last_os_error();
        warn!(error = %e, path = ?path, "Cannot create control pipe");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileTypeExt;

    // ========== Control pipe ==========

    #[test]
    fn test_ensure_fifo_creates_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control");
        ensure_fifo(&path);
        assert!(std::fs::metadata(&path).unwrap().file_type().is_fifo());

        // An existing path is left alone
        ensure_fifo(&path);
        assert!(std::fs::metadata(&path).unwrap().file_type().is_fifo());
    }

    #[test]
    fn test_control_reader_forwards_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control");
        let (tx, mut rx) = mpsc::channel(4);
        spawn_control_reader(path.clone(), tx).unwrap();

        // Opening for write blocks until the reader has the pipe open
        std::fs::write(&path, "ca 1 30\n\n  bu 500  \n").unwrap();
        assert_eq!(rx.blocking_recv().as_deref(), Some("ca 1 30"));
        assert_eq!(rx.blocking_recv().as_deref(), Some("bu 500"));
    }

    // ========== Engine steps ==========

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_blocking_step_leaves_runtime_running() {
        let started = Instant::now();
        // Occupies the only worker the way an engine step waiting out the
        // producer rendezvous would
        let step = tokio::spawn(async {
            block_in_place(|| thread::sleep(Duration::from_millis(500)));
        });
        tokio::task::yield_now().await;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            started.elapsed()
        });
        let fired_after = timer.await.unwrap();
        step.await.unwrap();
        assert!(fired_after < Duration::from_millis(500), "{fired_after:?}");
    }
}
