//! Recording files on the local filesystem
//!
//! Recordings are named `vi_NNNN_YYYYMMDD_HHMMSS.h264`. The counter continues
//! from the highest number already present in the directory, so restarts
//! never overwrite earlier recordings.

use chrono::Local;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

use crate::capture::PrerollSnapshot;
use crate::error::{CaptureError, Result};

const RECORDING_PREFIX: &str = "vi_";
const RAW_EXTENSION: &str = "h264";
const BOXED_EXTENSION: &str = "mp4";

/// Where one recording lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingPaths {
    pub index: u32,
    /// Elementary stream written during capture
    pub raw: PathBuf,
    /// Container file produced by post-processing
    pub boxed: PathBuf,
}

pub struct RecordingStore {
    root: PathBuf,
    next_index: u32,
}

impl RecordingStore {
    /// Create the directory if needed and find the next free number.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| CaptureError::io("create recordings directory", &root, e))?;
        let next_index = Self::scan_next_index(&root);
        info!(root = ?root, next_index, "Recording store ready");
        Ok(Self { root, next_index })
    }

    fn scan_next_index(root: &Path) -> u32 {
        let highest = fs::read_dir(root)
            .into_iter()
            .flatten()
            .flatten()
            .filter_map(|entry| parse_index(&entry.file_name().to_string_lossy()))
            .max()
            .unwrap_or(0);
        highest + 1
    }

    pub fn next_index(&self) -> u32 {
        self.next_index
    }

    /// Allocate the paths for the next recording.
    pub fn next_paths(&mut self) -> RecordingPaths {
        let index = self.next_index;
        self.next_index += 1;
        let stem = format!(
            "{RECORDING_PREFIX}{index:04}_{}",
            Local::now().format("%Y%m%d_%H%M%S")
        );
        RecordingPaths {
            index,
            raw: self.root.join(format!("{stem}.{RAW_EXTENSION}")),
            boxed: self.root.join(format!("{stem}.{BOXED_EXTENSION}")),
        }
    }
}

/// `vi_0042_...` -> 42
fn parse_index(name: &str) -> Option<u32> {
    let rest = name.strip_prefix(RECORDING_PREFIX)?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// An open recording. Write failures are logged and counted; the recording
/// carries on with whatever reaches the disk.
pub struct RecordingFile {
    writer: BufWriter<File>,
    path: PathBuf,
    bytes_written: u64,
    write_errors: u32,
}

impl RecordingFile {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).map_err(|e| CaptureError::io("open recording", path, e))?;
        debug!(path = ?path, "Recording file opened");
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            bytes_written: 0,
            write_errors: 0,
        })
    }

    pub fn write_errors(&self) -> u32 {
        self.write_errors
    }

    /// Returns false if the bytes did not all reach the writer.
    pub fn write_chunk(&mut self, bytes: &[u8]) -> bool {
        match self.writer.write_all(bytes) {
            Ok(()) => {
                self.bytes_written += bytes.len() as u64;
                true
            }
            Err(e) => {
                self.write_errors += 1;
                error!(error = %e, path = ?self.path, len = bytes.len(), "Recording write failed");
                false
            }
        }
    }

    /// Write the stream header and buffered pre-roll.
    pub fn write_preroll(&mut self, snapshot: &PrerollSnapshot<'_>) -> bool {
        match snapshot.write_to(&mut self.writer) {
            Ok(()) => {
                self.bytes_written += snapshot.len() as u64;
                true
            }
            Err(e) => {
                self.write_errors += 1;
                error!(error = %e, path = ?self.path, "Pre-roll write failed");
                false
            }
        }
    }

    /// Flush and close. Returns the byte count.
    pub fn finish(mut self) -> Result<u64> {
        self.writer
            .flush()
            .map_err(|e| CaptureError::io("flush recording", &self.path, e))?;
        Ok(self.bytes_written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_index() {
        assert_eq!(parse_index("vi_0042_20240101_120000.h264"), Some(42));
        assert_eq!(parse_index("vi_7.mp4"), Some(7));
        assert_eq!(parse_index("vi_.h264"), None);
        assert_eq!(parse_index("im_0003.jpg"), None);
    }

    #[test]
    fn test_numbering_continues_from_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("vi_0003_20240101_000000.mp4"), b"").unwrap();
        fs::write(dir.path().join("vi_0011_20240101_000000.h264"), b"").unwrap();
        fs::write(dir.path().join("notes.txt"), b"").unwrap();

        let mut store = RecordingStore::open(dir.path()).unwrap();
        assert_eq!(store.next_index(), 12);

        let paths = store.next_paths();
        assert_eq!(paths.index, 12);
        let raw = paths.raw.file_name().unwrap().to_string_lossy().to_string();
        assert!(raw.starts_with("vi_0012_"));
        assert!(raw.ends_with(".h264"));
        assert_eq!(paths.boxed.with_extension("h264"), paths.raw);
        assert_eq!(store.next_paths().index, 13);
    }

    #[test]
    fn test_open_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("media/video");
        let store = RecordingStore::open(&root).unwrap();
        assert!(root.is_dir());
        assert_eq!(store.next_index(), 1);
    }

    #[test]
    fn test_recording_file_counts_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vi_0001.h264");
        let mut file = RecordingFile::create(&path).unwrap();
        assert!(file.write_chunk(b"abc"));
        assert!(file.write_chunk(b"defg"));
        assert_eq!(file.finish().unwrap(), 7);
        assert_eq!(fs::read(&path).unwrap(), b"abcdefg");
    }

    #[test]
    fn test_create_in_missing_directory_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = RecordingFile::create(&dir.path().join("nope/vi_0001.h264")).err().unwrap();
        assert!(matches!(err, CaptureError::Io { .. }));
        assert!(!err.is_fatal());
    }
}
