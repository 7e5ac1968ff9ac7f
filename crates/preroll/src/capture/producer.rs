//! Stream producer thread
//!
//! Stands in for the encoder callback context: it sequences every chunk,
//! appends it to the pre-roll buffer while buffering is armed and forwards it
//! to the engine. The engine never touches the buffer while the producer owns
//! it; `pause` moves the buffer out through a rendezvous and `resume` moves a
//! buffer back in.

use std::io;
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

use super::preroll::PrerollBuffer;
use crate::chunk::{Chunk, MotionVectors};
use crate::error::{CaptureError, Result};

/// How long `pause` waits for the producer to hand over its buffer.
pub const RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(2);

/// A chunk tagged with its position in the stream.
#[derive(Debug, Clone)]
pub struct SequencedChunk {
    pub seq: u64,
    /// The previous frame ended before this chunk
    pub starts_frame: bool,
    pub chunk: Chunk,
}

/// Producer to engine notifications.
#[derive(Debug)]
pub enum StreamEvent {
    Chunk(SequencedChunk),
    Motion(MotionVectors),
    /// No keyframe for more than half the ring
    KeyframeStarved,
    /// Buffering stopped because of this error
    Fault(CaptureError),
}

pub enum ProducerInput {
    Chunk(Chunk),
    Motion(MotionVectors),
    Control(Control),
}

pub enum Control {
    Pause(SyncSender<Option<PrerollBuffer>>),
    Resume(PrerollBuffer),
    Flush(SyncSender<()>),
    Shutdown,
}

/// Sending side of the producer. Cheap to clone; the encoder and the engine
/// each hold one.
#[derive(Clone)]
pub struct ProducerHandle {
    tx: Sender<ProducerInput>,
}

impl ProducerHandle {
    /// Returns false once the producer has exited.
    pub fn push_chunk(&self, chunk: Chunk) -> bool {
        self.tx.send(ProducerInput::Chunk(chunk)).is_ok()
    }

    pub fn push_motion(&self, vectors: MotionVectors) -> bool {
        self.tx.send(ProducerInput::Motion(vectors)).is_ok()
    }

    /// Take the pre-roll buffer away from the producer.
    ///
    /// Every input queued before this call has been applied when it returns.
    /// `None` means the producer was not buffering.
    pub fn pause(&self) -> Result<Option<PrerollBuffer>> {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.tx
            .send(ProducerInput::Control(Control::Pause(reply_tx)))
            .map_err(|_| CaptureError::ProducerGone)?;
        reply_rx
            .recv_timeout(RENDEZVOUS_TIMEOUT)
            .map_err(|_| CaptureError::ProducerGone)
    }

    /// Hand a buffer to the producer and start appending to it.
    pub fn resume(&self, buffer: PrerollBuffer) -> Result<()> {
        self.tx
            .send(ProducerInput::Control(Control::Resume(buffer)))
            .map_err(|_| CaptureError::ProducerGone)
    }

    /// Block until every input queued before this call has been processed.
    pub fn flush(&self) -> Result<()> {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.tx
            .send(ProducerInput::Control(Control::Flush(reply_tx)))
            .map_err(|_| CaptureError::ProducerGone)?;
        reply_rx
            .recv_timeout(RENDEZVOUS_TIMEOUT)
            .map_err(|_| CaptureError::ProducerGone)
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(ProducerInput::Control(Control::Shutdown));
    }
}

/// Start the producer thread.
pub fn spawn_producer(
    events: UnboundedSender<StreamEvent>,
) -> io::Result<(ProducerHandle, JoinHandle<()>)> {
    let (tx, rx) = mpsc::channel();
    let producer = Producer {
        buffer: None,
        buffer_synced: false,
        mid_frame: false,
        next_seq: 0,
        events,
        engine_gone: false,
    };
    let thread = thread::Builder::new()
        .name("preroll-producer".into())
        .spawn(move || producer.run(rx))?;
    Ok((ProducerHandle { tx }, thread))
}

struct Producer {
    buffer: Option<PrerollBuffer>,
    /// The buffer has seen every chunk of the current frame
    buffer_synced: bool,
    /// The last frame chunk did not end its frame
    mid_frame: bool,
    next_seq: u64,
    events: UnboundedSender<StreamEvent>,
    engine_gone: bool,
}

impl Producer {
    fn run(mut self, rx: Receiver<ProducerInput>) {
        debug!("Producer started");
        while let Ok(input) = rx.recv() {
            match input {
                ProducerInput::Chunk(chunk) => self.on_chunk(chunk),
                ProducerInput::Motion(vectors) => self.emit(StreamEvent::Motion(vectors)),
                ProducerInput::Control(Control::Pause(reply)) => {
                    let buffer = self.buffer.take();
                    if let Some(buffer) = &buffer {
                        debug!(
                            retained = buffer.ring().len(),
                            keyframes = buffer.index().len(),
                            "Handing pre-roll buffer to engine"
                        );
                    }
                    if let Err(mpsc::SendError(Some(buffer))) = reply.send(buffer) {
                        // Requester timed out; keep buffering
                        warn!("Pause requester gone, keeping buffer");
                        self.buffer = Some(buffer);
                    }
                }
                ProducerInput::Control(Control::Resume(buffer)) => self.arm(buffer),
                ProducerInput::Control(Control::Flush(reply)) => {
                    let _ = reply.send(());
                }
                ProducerInput::Control(Control::Shutdown) => break,
            }
        }
        info!(chunks = self.next_seq, "Producer stopped");
    }

    /// A buffer that missed chunks starts at the next frame boundary.
    fn arm(&mut self, mut buffer: PrerollBuffer) {
        let continuous = buffer
            .last_seq()
            .is_some_and(|last| last + 1 == self.next_seq);
        if !continuous {
            buffer.abandon_frame();
        }
        self.buffer_synced = continuous || !self.mid_frame;
        debug!(
            capacity = buffer.capacity(),
            synced = self.buffer_synced,
            "Buffering armed"
        );
        self.buffer = Some(buffer);
    }

    fn on_chunk(&mut self, chunk: Chunk) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let starts_frame = !self.mid_frame;
        let is_config = chunk.flags.is_config();
        if !is_config {
            if chunk.flags.is_frame_end() {
                self.mid_frame = false;
            } else if !chunk.is_empty() {
                self.mid_frame = true;
            }
        }
        if starts_frame && !is_config {
            self.buffer_synced = true;
        }

        // Config chunks go to the stream header even before a frame boundary
        let accept = self.buffer_synced || is_config;
        if let Some(buffer) = self.buffer.as_mut().filter(|_| accept) {
            match buffer.append(seq, &chunk) {
                Ok(outcome) => {
                    if outcome.keyframe_starved {
                        self.emit(StreamEvent::KeyframeStarved);
                    }
                }
                Err(e) => {
                    error!(error = %e, "Pre-roll buffering halted");
                    self.buffer = None;
                    self.emit(StreamEvent::Fault(e));
                }
            }
        }

        self.emit(StreamEvent::Chunk(SequencedChunk {
            seq,
            starts_frame,
            chunk,
        }));
    }

    fn emit(&mut self, event: StreamEvent) {
        if self.events.send(event).is_err() && !self.engine_gone {
            warn!("Engine event channel closed, discarding stream events");
            self.engine_gone = true;
        }
    }
}
