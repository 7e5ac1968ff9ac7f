//! Error taxonomy for the capture core
//!
//! Four classes matter to callers:
//! - configuration faults (ring too small for the keyframe interval) halt buffering
//! - I/O errors abort the current capture attempt only
//! - queue exhaustion drops a post-process job
//! - protocol errors leave state untouched
//!
//! Internal invariant violations are separate and always fatal.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = CaptureError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum CaptureError {
    /// Eviction emptied the keyframe index: the ring cannot hold one keyframe interval.
    #[error("keyframe index exhausted: {capacity} byte ring is too small for the keyframe interval")]
    KeyframeIndexExhausted { capacity: usize },

    /// A single frame is longer than the whole ring.
    #[error("frame of {frame_len} bytes does not fit in {capacity} byte ring")]
    FrameTooLarge { frame_len: usize, capacity: usize },

    /// The ring cannot be allocated at the requested size.
    #[error("cannot allocate a {capacity} byte pre-roll buffer")]
    BufferAllocation { capacity: usize },

    #[error("{context} ({path:?}): {source}")]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("post-process queue full ({occupied}/{capacity}), dropping {path:?}")]
    QueueFull {
        path: PathBuf,
        occupied: usize,
        capacity: usize,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    /// Cursor or index bookkeeping is inconsistent. Continuing would corrupt output.
    #[error("internal invariant violated: {0}")]
    Invariant(String),

    #[error("stream producer is not responding")]
    ProducerGone,
}

impl CaptureError {
    pub(crate) fn io(context: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        CaptureError::Io {
            context,
            path: path.into(),
            source,
        }
    }

    /// Buffer sizing problem that halts buffering until reconfigured.
    pub fn is_configuration_fault(&self) -> bool {
        matches!(
            self,
            CaptureError::KeyframeIndexExhausted { .. }
                | CaptureError::FrameTooLarge { .. }
                | CaptureError::BufferAllocation { .. }
        )
    }

    /// The daemon cannot safely continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CaptureError::Invariant(_) | CaptureError::ProducerGone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let exhausted = CaptureError::KeyframeIndexExhausted { capacity: 1024 };
        assert!(exhausted.is_configuration_fault());
        assert!(!exhausted.is_fatal());

        let io = CaptureError::io(
            "open recording",
            "/tmp/x.h264",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(!io.is_configuration_fault());
        assert!(!io.is_fatal());

        let oversized = CaptureError::BufferAllocation { capacity: usize::MAX };
        assert!(oversized.is_configuration_fault());
        assert!(!oversized.is_fatal());

        assert!(CaptureError::Invariant("kr past kw".into()).is_fatal());
        assert!(!CaptureError::Protocol("zz".into()).is_fatal());
    }

    #[test]
    fn io_error_message_names_path() {
        let err = CaptureError::io(
            "open recording",
            "/media/vi_0001.h264",
            io::Error::new(io::ErrorKind::NotFound, "missing"),
        );
        let msg = err.to_string();
        assert!(msg.contains("open recording"));
        assert!(msg.contains("vi_0001.h264"));
    }
}
