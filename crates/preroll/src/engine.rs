//! Capture state machine
//!
//! `CaptureEngine` owns everything the control loop touches: the recording
//! session, the post-process queue, the motion detector and the encoder
//! signals. The pre-roll buffer belongs to the producer thread except while a
//! recording is running, when the engine holds it.
//!
//! ```text
//!            enable_buffering            start
//!   Idle ─────────────────────▶ Buffering ─────▶ Recording
//!    ▲  ◀─────────────────────     ▲                 │
//!    │     disable_buffering       └──── stop ───────┤
//!    └──────────────── stop (not buffering) ─────────┘
//! ```

use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::capture::motion::{MotionDetector, MotionEvent, MotionMask};
use crate::capture::preroll::PrerollBuffer;
use crate::capture::producer::{ProducerHandle, SequencedChunk, StreamEvent};
use crate::capture::video::EncoderControl;
use crate::chunk::MotionVectors;
use crate::command::{Command, RecordParams};
use crate::config::{ring_capacity, CaptureConfig};
use crate::error::{CaptureError, Result};
use crate::postprocess::{BoxJob, JobOutcome, PostProcessQueue, Transcoder};
use crate::status::{DaemonStatus, StatusWriter};
use crate::storage::{RecordingFile, RecordingPaths, RecordingStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Buffering,
    Recording,
}

/// What started the current recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Manual,
    Motion,
}

struct CaptureSession {
    paths: RecordingPaths,
    file: RecordingFile,
    trigger: Trigger,
    deadline: Option<Instant>,
    /// Chunks up to this sequence number are already in the file or lost
    cutoff: Option<u64>,
    /// Skip live chunks until one a decoder can start from
    awaiting_keyframe: bool,
    started: Instant,
}

impl CaptureSession {
    fn write_live(&mut self, chunk: &SequencedChunk) {
        if self.cutoff.is_some_and(|cutoff| chunk.seq <= cutoff) {
            return;
        }
        if self.awaiting_keyframe {
            let flags = chunk.chunk.flags;
            // A keyframe tail is not a place a decoder can start from
            if !chunk.starts_frame || !(flags.is_config() || flags.is_keyframe()) {
                return;
            }
            self.awaiting_keyframe = false;
        }
        self.file.write_chunk(&chunk.chunk.payload);
    }
}

pub struct CaptureEngine {
    config: CaptureConfig,
    producer: ProducerHandle,
    encoder: Box<dyn EncoderControl>,
    encoder_capturing: bool,
    store: RecordingStore,
    queue: PostProcessQueue,
    detector: MotionDetector,
    status: StatusWriter,
    session: Option<CaptureSession>,
    /// Pre-roll buffering is armed
    buffering: bool,
    /// Buffer taken from the producer for the current recording
    held: Option<PrerollBuffer>,
    halted: bool,
    /// Buffering stopped by a configuration fault
    faulted: bool,
    produced_count: u64,
    last_seq: Option<u64>,
}

impl CaptureEngine {
    /// Build the engine and arm buffering if the config asks for it.
    pub fn new(
        config: CaptureConfig,
        producer: ProducerHandle,
        encoder: Box<dyn EncoderControl>,
        transcoder: Box<dyn Transcoder>,
    ) -> Result<Self> {
        let store = RecordingStore::open(&config.recordings_dir)?;
        let mask = config.motion.mask_path.as_ref().and_then(|path| {
            match MotionMask::load(path, config.motion.columns, config.motion.rows) {
                Ok(mask) => {
                    info!(path = ?path, "Motion mask loaded");
                    Some(mask)
                }
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "Ignoring motion mask");
                    None
                }
            }
        });

        let mut engine = Self {
            detector: MotionDetector::new(&config.motion, mask),
            queue: PostProcessQueue::new(config.boxing.queue_capacity, transcoder),
            status: StatusWriter::new(config.status_file.clone()),
            config,
            producer,
            encoder,
            encoder_capturing: false,
            store,
            session: None,
            buffering: false,
            held: None,
            halted: false,
            faulted: false,
            produced_count: 0,
            last_seq: None,
        };

        if engine.config.buffer_ms > 0 {
            engine.enable_buffering(engine.config.bitrate_bps, engine.config.buffer())?;
        } else {
            engine.sync_encoder();
            engine.refresh_status();
        }
        Ok(engine)
    }

    pub fn state(&self) -> CaptureState {
        if self.session.is_some() {
            CaptureState::Recording
        } else if self.buffering {
            CaptureState::Buffering
        } else {
            CaptureState::Idle
        }
    }

    pub fn status(&self) -> DaemonStatus {
        if self.faulted {
            DaemonStatus::Error
        } else if self.halted {
            DaemonStatus::Halted
        } else if self.session.is_some() {
            DaemonStatus::Recording
        } else if self.queue.is_busy() {
            DaemonStatus::Boxing
        } else {
            DaemonStatus::Ready
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn queue(&self) -> &PostProcessQueue {
        &self.queue
    }

    pub fn detector(&self) -> &MotionDetector {
        &self.detector
    }

    /// Recordings finished since startup.
    pub fn produced_count(&self) -> u64 {
        self.produced_count
    }

    /// Trigger of the running recording.
    pub fn trigger(&self) -> Option<Trigger> {
        self.session.as_ref().map(|s| s.trigger)
    }

    /// Raw file of the running recording.
    pub fn recording_paths(&self) -> Option<&RecordingPaths> {
        self.session.as_ref().map(|s| &s.paths)
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    // ========== Buffering ==========

    /// Arm pre-roll buffering with a ring of `bitrate_bps × buffer / 8` bytes.
    ///
    /// While recording the new buffer is kept aside and armed at `stop`.
    pub fn enable_buffering(&mut self, bitrate_bps: u32, buffer: Duration) -> Result<()> {
        let capacity = ring_capacity(bitrate_bps, buffer);
        if capacity == 0 {
            return self.disable_buffering();
        }
        if capacity > self.config.max_ring_bytes {
            let e = CaptureError::BufferAllocation { capacity };
            error!(
                error = %e,
                limit = self.config.max_ring_bytes,
                "Buffer request refused, keeping current buffering"
            );
            return Err(e);
        }
        if self.halted {
            self.config.bitrate_bps = bitrate_bps;
            self.config.buffer_ms = buffer.as_millis().min(u32::MAX as u128) as u32;
            info!(capacity, "Buffer size stored, applies on resume");
            return Ok(());
        }

        let fresh = PrerollBuffer::new(capacity, self.config.keyframe_slots).map_err(|e| {
            error!(error = %e, "Buffer request refused, keeping current buffering");
            e
        })?;
        self.config.bitrate_bps = bitrate_bps;
        self.config.buffer_ms = buffer.as_millis().min(u32::MAX as u128) as u32;
        if self.session.is_some() {
            self.held = Some(fresh);
        } else {
            // Drop whatever the producer had, then arm the new buffer
            let _ = self.producer.pause()?;
            self.producer.resume(fresh)?;
        }
        self.buffering = true;
        self.faulted = false;
        info!(
            capacity,
            buffer_ms = self.config.buffer_ms,
            bitrate_bps,
            "Pre-roll buffering enabled"
        );
        self.sync_encoder();
        self.refresh_status();
        Ok(())
    }

    pub fn disable_buffering(&mut self) -> Result<()> {
        self.config.buffer_ms = 0;
        self.faulted = false;
        if self.buffering {
            self.disarm()?;
            info!("Pre-roll buffering disabled");
        }
        self.sync_encoder();
        self.refresh_status();
        Ok(())
    }

    /// Stop buffering without touching the configured length.
    fn disarm(&mut self) -> Result<()> {
        if self.session.is_some() {
            self.held = None;
        } else if self.buffering {
            let _ = self.producer.pause()?;
        }
        self.buffering = false;
        Ok(())
    }

    fn fresh_buffer(&self) -> Result<Option<PrerollBuffer>> {
        let capacity = self.config.ring_capacity();
        if capacity == 0 {
            return Ok(None);
        }
        PrerollBuffer::new(capacity, self.config.keyframe_slots).map(Some)
    }

    /// Change the bitrate used to size the ring. Re-arms if buffering.
    pub fn set_bitrate(&mut self, bitrate_bps: u32) -> Result<()> {
        if self.buffering {
            self.enable_buffering(bitrate_bps, self.config.buffer())
        } else {
            self.config.bitrate_bps = bitrate_bps;
            Ok(())
        }
    }

    // ========== Recording ==========

    /// Start a manual recording, optionally ending at `deadline`.
    pub fn start(&mut self, deadline: Option<Instant>) -> Result<()> {
        self.start_with(Trigger::Manual, deadline)
    }

    fn start_with(&mut self, trigger: Trigger, deadline: Option<Instant>) -> Result<()> {
        if self.halted {
            return Err(CaptureError::Protocol("capture is halted".into()));
        }
        if let Some(session) = self.session.as_mut() {
            // A manual request takes over a motion recording
            if trigger == Trigger::Manual {
                session.trigger = Trigger::Manual;
                session.deadline = deadline;
            }
            debug!("Start ignored, already recording");
            return Ok(());
        }

        let paths = self.store.next_paths();
        let mut file = RecordingFile::create(&paths.raw).map_err(|e| {
            error!(error = %e, "Cannot start recording");
            e
        })?;

        let mut cutoff = self.last_seq;
        let mut awaiting_keyframe = true;
        if self.buffering {
            match self.producer.pause()? {
                Some(buffer) => {
                    let snapshot = buffer.snapshot()?;
                    file.write_preroll(&snapshot);
                    info!(
                        bytes = snapshot.len(),
                        keyframes = buffer.index().len(),
                        "Pre-roll written"
                    );
                    cutoff = snapshot.last_seq.or(cutoff);
                    awaiting_keyframe = !snapshot.has_keyframe;
                    self.held = Some(buffer);
                }
                None => warn!("Buffering armed but no pre-roll available"),
            }
        }

        info!(path = ?paths.raw, ?trigger, ?deadline, "Recording started");
        self.session = Some(CaptureSession {
            paths,
            file,
            trigger,
            deadline,
            cutoff,
            awaiting_keyframe,
            started: Instant::now(),
        });
        self.sync_encoder();
        self.refresh_status();
        Ok(())
    }

    /// Finish the running recording. A no-op when not recording.
    pub fn stop(&mut self) -> Result<()> {
        let Some(session) = self.session.take() else {
            debug!("Stop ignored, not recording");
            return Ok(());
        };
        let CaptureSession {
            paths,
            file,
            started,
            ..
        } = session;

        let write_errors = file.write_errors();
        match file.finish() {
            Ok(bytes) => info!(
                path = ?paths.raw,
                bytes,
                secs = started.elapsed().as_secs_f32(),
                write_errors,
                "Recording finished"
            ),
            Err(e) => error!(error = %e, "Recording not flushed completely"),
        }
        self.produced_count += 1;

        // Re-arm with an empty ring so recordings never overlap
        if self.buffering {
            let buffer = match self.held.take() {
                Some(mut buffer) => {
                    buffer.rewind();
                    Ok(Some(buffer))
                }
                None => self.fresh_buffer(),
            };
            match buffer {
                Ok(Some(buffer)) => self.producer.resume(buffer)?,
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "Pre-roll buffering halted");
                    self.buffering = false;
                    self.faulted = true;
                }
            }
        } else {
            self.held = None;
        }

        if self.config.boxing.enabled {
            let job = BoxJob {
                source_path: paths.raw,
                output_path: paths.boxed,
            };
            if let Err(e) = self.queue.enqueue(job) {
                if e.is_fatal() {
                    return Err(e);
                }
            }
        }

        self.sync_encoder();
        self.refresh_status();
        Ok(())
    }

    /// Deadline check and post-process poll; call once per control tick.
    pub fn tick(&mut self, now: Instant) -> Result<Vec<JobOutcome>> {
        let expired = self
            .session
            .as_ref()
            .and_then(|s| s.deadline)
            .is_some_and(|deadline| now >= deadline);
        if expired {
            info!("Recording deadline reached");
            self.stop()?;
        }

        let outcomes = self.queue.poll();
        self.refresh_status();
        Ok(outcomes)
    }

    // ========== Stream events ==========

    /// React to one producer event. Errors returned here are fatal.
    pub fn handle_event(&mut self, event: StreamEvent) -> Result<()> {
        match event {
            StreamEvent::Chunk(chunk) => {
                self.last_seq = Some(chunk.seq);
                if let Some(session) = self.session.as_mut() {
                    session.write_live(&chunk);
                }
                Ok(())
            }
            StreamEvent::Motion(vectors) => self.on_motion(&vectors),
            StreamEvent::KeyframeStarved => {
                warn!("No keyframe for over half the pre-roll, requesting one");
                self.encoder.request_keyframe();
                Ok(())
            }
            StreamEvent::Fault(e) => self.on_fault(e),
        }
    }

    fn on_motion(&mut self, vectors: &MotionVectors) -> Result<()> {
        if !self.config.motion.enabled || self.halted {
            return Ok(());
        }
        match self.detector.analyse(vectors) {
            Some(MotionEvent::Start) if self.session.is_none() => {
                if let Err(e) = self.start_with(Trigger::Motion, None) {
                    if e.is_fatal() {
                        return Err(e);
                    }
                }
            }
            Some(MotionEvent::Stop) if self.trigger() == Some(Trigger::Motion) => {
                self.stop()?;
            }
            _ => {}
        }
        Ok(())
    }

    fn on_fault(&mut self, e: CaptureError) -> Result<()> {
        if e.is_fatal() {
            return Err(e);
        }
        if !self.buffering {
            debug!(error = %e, "Fault after buffering stopped");
            return Ok(());
        }
        // The fault may come from a buffer that has since been replaced
        if self.session.is_some() {
            if self.held.is_some() {
                debug!(error = %e, "Ignoring fault from a replaced buffer");
                return Ok(());
            }
        } else if let Some(buffer) = self.producer.pause()? {
            self.producer.resume(buffer)?;
            debug!(error = %e, "Ignoring fault from a replaced buffer");
            return Ok(());
        }

        if e.is_configuration_fault() {
            error!(
                error = %e,
                buffer_ms = self.config.buffer_ms,
                "Pre-roll buffering halted; increase the buffer or lower the intra period"
            );
        } else {
            error!(error = %e, "Pre-roll buffering halted");
        }
        self.buffering = false;
        self.held = None;
        self.faulted = true;
        self.sync_encoder();
        self.refresh_status();
        Ok(())
    }

    // ========== Settings ==========

    pub fn set_motion_detection(&mut self, enabled: bool) -> Result<()> {
        self.config.motion.enabled = enabled;
        self.detector.reset();
        info!(enabled, "Motion detection");
        if !enabled && self.trigger() == Some(Trigger::Motion) {
            self.stop()?;
        }
        self.sync_encoder();
        self.refresh_status();
        Ok(())
    }

    pub fn set_boxing(&mut self, enabled: bool) {
        self.config.boxing.enabled = enabled;
        info!(enabled, "Boxing");
    }

    pub fn set_intra_period(&mut self, frames: u32) {
        self.config.intra_period = frames;
        self.encoder.set_intra_period(frames);
    }

    /// Stop recording and buffering and gate the encoder off.
    pub fn halt(&mut self) -> Result<()> {
        if self.halted {
            return Ok(());
        }
        self.stop()?;
        self.disarm()?;
        self.halted = true;
        self.faulted = false;
        self.detector.reset();
        info!("Capture halted");
        self.sync_encoder();
        self.refresh_status();
        Ok(())
    }

    /// Undo `halt`, re-arming buffering if configured.
    pub fn run(&mut self) -> Result<()> {
        if !self.halted {
            return Ok(());
        }
        self.halted = false;
        info!("Capture resumed");
        if self.config.buffer_ms > 0 {
            self.enable_buffering(self.config.bitrate_bps, self.config.buffer())?;
        } else {
            self.sync_encoder();
            self.refresh_status();
        }
        Ok(())
    }

    /// Finish any recording and release the producer.
    pub fn shutdown(&mut self) -> Result<()> {
        self.stop()?;
        let _ = self.disarm();
        self.halted = true;
        self.sync_encoder();
        self.producer.shutdown();
        Ok(())
    }

    // ========== Control protocol ==========

    /// Apply one command given as opcode and raw parameters.
    ///
    /// Protocol errors are logged and leave state untouched.
    pub fn apply_command(&mut self, opcode: &str, params: &str) -> Result<()> {
        let command = Command::from_parts(opcode, params).map_err(|e| {
            warn!(error = %e, "Rejected command");
            e
        })?;
        self.execute(command)
    }

    /// Apply one full control line.
    pub fn apply_line(&mut self, line: &str) -> Result<()> {
        let command = Command::parse(line).map_err(|e| {
            warn!(error = %e, "Rejected command");
            e
        })?;
        self.execute(command)
    }

    pub fn execute(&mut self, command: Command) -> Result<()> {
        debug!(%command, "Applying command");
        match command {
            Command::Record(RecordParams {
                start: true,
                duration_secs,
            }) => {
                let deadline = match duration_secs {
                    Some(secs) => Some(
                        Instant::now()
                            .checked_add(Duration::from_secs(secs))
                            .ok_or_else(|| {
                                let e = CaptureError::Protocol(format!(
                                    "recording duration {secs}s out of range"
                                ));
                                warn!(error = %e, "Rejected command");
                                e
                            })?,
                    ),
                    None => None,
                };
                self.start(deadline)
            }
            Command::Record(RecordParams { start: false, .. }) => self.stop(),
            Command::SetBuffer { millis: 0 } => self.disable_buffering(),
            Command::SetBuffer { millis } => {
                self.enable_buffering(self.config.bitrate_bps, Duration::from_millis(millis as u64))
            }
            Command::SetBitrate { bps } => self.set_bitrate(bps),
            Command::SetIntraPeriod { frames } => {
                self.set_intra_period(frames);
                Ok(())
            }
            Command::MotionDetection { enabled } => self.set_motion_detection(enabled),
            Command::MotionNoise { noise } => {
                self.config.motion.noise = noise;
                self.detector.set_noise(noise);
                Ok(())
            }
            Command::MotionThreshold { threshold } => {
                self.config.motion.threshold = threshold;
                self.detector.set_threshold(threshold);
                Ok(())
            }
            Command::MotionStartFrames { frames } => {
                self.config.motion.start_frames = frames;
                self.detector.set_start_frames(frames);
                Ok(())
            }
            Command::MotionStopFrames { frames } => {
                self.config.motion.stop_frames = frames;
                self.detector.set_stop_frames(frames);
                Ok(())
            }
            Command::Boxing { enabled } => {
                self.set_boxing(enabled);
                Ok(())
            }
            Command::Run { enabled: true } => self.run(),
            Command::Run { enabled: false } => self.halt(),
        }
    }

    // ========== Helpers ==========

    /// The encoder delivers while buffering, recording or watching for motion.
    fn sync_encoder(&mut self) {
        let wanted = !self.halted
            && (self.buffering || self.session.is_some() || self.config.motion.enabled);
        if wanted != self.encoder_capturing {
            self.encoder.set_capture(wanted);
            self.encoder_capturing = wanted;
        }
    }

    fn refresh_status(&mut self) {
        let status = self.status();
        self.status.update(status, self.config.motion.enabled);
    }
}
