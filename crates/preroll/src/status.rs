//! Status file for external UIs
//!
//! A single word describing what the daemon is doing, rewritten only when
//! it changes.

use std::fmt;
use std::path::PathBuf;

use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonStatus {
    /// Buffering halted by a configuration fault
    Error,
    Halted,
    Recording,
    /// A post-process job is in flight
    Boxing,
    Ready,
}

impl DaemonStatus {
    /// Text written to the status file.
    pub fn render(self, motion_detection: bool) -> String {
        let word = match self {
            DaemonStatus::Error => return "Error".to_string(),
            DaemonStatus::Halted => return "halted".to_string(),
            DaemonStatus::Recording => "video",
            DaemonStatus::Boxing => "boxing",
            DaemonStatus::Ready => "ready",
        };
        if motion_detection {
            format!("md_{word}")
        } else {
            word.to_string()
        }
    }
}

impl fmt::Display for DaemonStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(false))
    }
}

pub struct StatusWriter {
    path: Option<PathBuf>,
    last: Option<String>,
}

impl StatusWriter {
    /// `None` keeps the status in memory only.
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path, last: None }
    }

    pub fn current(&self) -> Option<&str> {
        self.last.as_deref()
    }

    /// Returns true if the rendered status changed.
    pub fn update(&mut self, status: DaemonStatus, motion_detection: bool) -> bool {
        let text = status.render(motion_detection);
        if self.last.as_deref() == Some(text.as_str()) {
            return false;
        }
        debug!(status = %text, "Status changed");
        if let Some(path) = &self.path {
            if let Err(e) = std::fs::write(path, &text) {
                warn!(error = %e, path = ?path, "Failed to write status file");
            }
        }
        self.last = Some(text);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render() {
        assert_eq!(DaemonStatus::Ready.render(false), "ready");
        assert_eq!(DaemonStatus::Ready.render(true), "md_ready");
        assert_eq!(DaemonStatus::Recording.render(true), "md_video");
        assert_eq!(DaemonStatus::Boxing.render(false), "boxing");
        assert_eq!(DaemonStatus::Error.render(true), "Error");
        assert_eq!(DaemonStatus::Halted.render(true), "halted");
    }

    #[test]
    fn test_writes_only_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status");
        let mut writer = StatusWriter::new(Some(path.clone()));

        assert!(writer.update(DaemonStatus::Ready, false));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "ready");

        std::fs::write(&path, "tampered").unwrap();
        assert!(!writer.update(DaemonStatus::Ready, false));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "tampered");

        assert!(writer.update(DaemonStatus::Ready, true));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "md_ready");
        assert_eq!(writer.current(), Some("md_ready"));
    }

    #[test]
    fn test_unwritable_path_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = StatusWriter::new(Some(dir.path().join("missing/status")));
        assert!(writer.update(DaemonStatus::Recording, false));
        assert_eq!(writer.current(), Some("video"));
    }
}
