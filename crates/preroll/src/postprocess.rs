//! Post-capture boxing queue
//!
//! Raw recordings are handed to an external muxer one at a time. The muxer
//! deletes its input when it succeeds, so a job is complete once the raw file
//! is gone. The queue never waits on the child process; `poll` is called from
//! the control loop tick.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use crate::capture::ring::SlotRing;
use crate::error::CaptureError;

/// One recording waiting to be wrapped in a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoxJob {
    /// Raw elementary stream; deleted by the transcoder on success
    pub source_path: PathBuf,
    pub output_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed(BoxJob),
    Failed { job: BoxJob, reason: String },
}

/// A launched transcoder process, if any.
pub struct TranscodeHandle {
    child: Option<Child>,
}

impl TranscodeHandle {
    pub fn from_child(child: Child) -> Self {
        Self { child: Some(child) }
    }

    /// A handle with no process to watch; completion is seen only through
    /// the artifact.
    pub fn detached() -> Self {
        Self { child: None }
    }

    /// Reap the process without blocking. Returns its status once it has exited.
    pub fn try_exit(&mut self) -> Option<ExitStatus> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "Cannot query transcoder process");
                None
            }
        }
    }
}

/// Starts a boxing job without waiting for it.
pub trait Transcoder: Send {
    fn launch(&mut self, job: &BoxJob) -> Result<TranscodeHandle>;
}

/// Runs `MP4Box -fps F -add RAW BOXED` and removes RAW when it succeeds.
pub struct Mp4BoxTranscoder {
    program: String,
    fps: u32,
}

impl Mp4BoxTranscoder {
    pub fn new(program: impl Into<String>, fps: u32) -> Self {
        Self {
            program: program.into(),
            fps,
        }
    }

    fn command(&self, job: &BoxJob) -> Command {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(r#""$0" -fps "$1" -add "$2" "$3" > /dev/null && rm "$2""#)
            .arg(&self.program)
            .arg(self.fps.to_string())
            .arg(&job.source_path)
            .arg(&job.output_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        command
    }
}

impl Transcoder for Mp4BoxTranscoder {
    fn launch(&mut self, job: &BoxJob) -> Result<TranscodeHandle> {
        let child = self
            .command(job)
            .spawn()
            .with_context(|| format!("Failed to launch {}", self.program))?;
        Ok(TranscodeHandle::from_child(child))
    }
}

pub struct PostProcessQueue {
    jobs: SlotRing<BoxJob>,
    /// Handle of the job at the front of `jobs`
    in_flight: Option<TranscodeHandle>,
    transcoder: Box<dyn Transcoder>,
    /// Outcomes produced outside `poll`, reported by the next `poll`
    pending: Vec<JobOutcome>,
    /// Finished jobs whose process has not been reaped yet
    lingering: Vec<TranscodeHandle>,
}

impl PostProcessQueue {
    /// `capacity` slots, one reserved as headroom. Must be at least 2.
    pub fn new(capacity: usize, transcoder: Box<dyn Transcoder>) -> Self {
        Self {
            jobs: SlotRing::new(capacity.max(2)),
            in_flight: None,
            transcoder,
            pending: Vec::new(),
            lingering: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.jobs.capacity()
    }

    /// Occupied slots, including the in-flight job.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn in_flight(&self) -> Option<&BoxJob> {
        self.in_flight.as_ref().and(self.jobs.front())
    }

    /// Queue a job, launching it at once if nothing is running.
    ///
    /// Rejected when more than `capacity - 2` slots are occupied.
    pub fn enqueue(&mut self, job: BoxJob) -> Result<(), CaptureError> {
        let occupied = self.jobs.len();
        if occupied > self.jobs.capacity() - 2 {
            let err = CaptureError::QueueFull {
                path: job.source_path,
                occupied,
                capacity: self.jobs.capacity(),
            };
            warn!(error = %err, "Boxing job dropped");
            return Err(err);
        }
        debug!(source = ?job.source_path, "Boxing job queued");
        if let Err(job) = self.jobs.push(job) {
            return Err(CaptureError::Invariant(format!(
                "queue rejected {:?} below its limit",
                job.source_path
            )));
        }
        if self.in_flight.is_none() {
            let mut outcomes = std::mem::take(&mut self.pending);
            self.launch_next(&mut outcomes);
            self.pending = outcomes;
        }
        Ok(())
    }

    /// Check the in-flight job and advance the queue. Never blocks.
    pub fn poll(&mut self) -> Vec<JobOutcome> {
        let mut outcomes = std::mem::take(&mut self.pending);
        self.lingering.retain_mut(|handle| handle.try_exit().is_none());
        loop {
            let Some(job) = self.jobs.front() else {
                break;
            };
            let Some(handle) = self.in_flight.as_mut() else {
                self.launch_next(&mut outcomes);
                if self.in_flight.is_none() {
                    break;
                }
                continue;
            };

            if !artifact_exists(&job.source_path) {
                if handle.child.is_some() && handle.try_exit().is_none() {
                    if let Some(handle) = self.in_flight.take() {
                        self.lingering.push(handle);
                    }
                }
                self.in_flight = None;
                if let Some(job) = self.jobs.pop() {
                    info!(output = ?job.output_path, "Boxing finished");
                    outcomes.push(JobOutcome::Completed(job));
                }
                self.launch_next(&mut outcomes);
                continue;
            }

            match handle.try_exit() {
                Some(status) => {
                    // Exited but left the raw file behind
                    self.in_flight = None;
                    if let Some(job) = self.jobs.pop() {
                        error!(source = ?job.source_path, %status, "Boxing failed, raw file kept");
                        outcomes.push(JobOutcome::Failed {
                            job,
                            reason: format!("transcoder exited with {status}"),
                        });
                    }
                    self.launch_next(&mut outcomes);
                }
                None => break,
            }
        }
        outcomes
    }

    /// Launch the front job; jobs that fail to launch are dropped.
    fn launch_next(&mut self, outcomes: &mut Vec<JobOutcome>) {
        while let Some(job) = self.jobs.front() {
            match self.transcoder.launch(job) {
                Ok(handle) => {
                    info!(
                        source = ?job.source_path,
                        queued = self.jobs.len() - 1,
                        "Boxing started"
                    );
                    self.in_flight = Some(handle);
                    return;
                }
                Err(e) => {
                    error!(
                        error = %e,
                        source = ?job.source_path,
                        "Boxing launch failed, dropping job"
                    );
                    if let Some(job) = self.jobs.pop() {
                        outcomes.push(JobOutcome::Failed {
                            job,
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }
    }
}

fn artifact_exists(path: &Path) -> bool {
    path.try_exists().unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::{Arc, Mutex};

    /// Records launches; never touches the artifacts.
    #[derive(Clone, Default)]
    struct FakeTranscoder {
        launched: Arc<Mutex<Vec<PathBuf>>>,
        fail: bool,
    }

    impl Transcoder for FakeTranscoder {
        fn launch(&mut self, job: &BoxJob) -> Result<TranscodeHandle> {
            if self.fail {
                anyhow::bail!("no such program");
            }
            self.launched.lock().unwrap().push(job.source_path.clone());
            Ok(TranscodeHandle::detached())
        }
    }

    fn job(dir: &Path, n: usize) -> BoxJob {
        let source_path = dir.join(format!("vi_{n:04}.h264"));
        fs::write(&source_path, b"raw").unwrap();
        BoxJob {
            source_path,
            output_path: dir.join(format!("vi_{n:04}.mp4")),
        }
    }

    // ========== Capacity ==========

    #[test]
    fn test_capacity_headroom() {
        let dir = tempfile::tempdir().unwrap();
        let transcoder = FakeTranscoder::default();
        let m = 5;
        let mut queue = PostProcessQueue::new(m, Box::new(transcoder.clone()));

        for n in 0..m - 1 {
            queue.enqueue(job(dir.path(), n)).unwrap();
        }
        assert_eq!(queue.len(), m - 1);

        for n in m - 1..m + 1 {
            let err = queue.enqueue(job(dir.path(), n)).unwrap_err();
            assert!(matches!(err, CaptureError::QueueFull { .. }));
        }
        assert_eq!(queue.len(), m - 1);

        // Only the first job has been launched
        assert_eq!(transcoder.launched.lock().unwrap().len(), 1);
        assert!(queue.is_busy());
    }

    // ========== Completion ==========

    #[test]
    fn test_artifact_removal_advances_exactly_one_job() {
        let dir = tempfile::tempdir().unwrap();
        let transcoder = FakeTranscoder::default();
        let mut queue = PostProcessQueue::new(8, Box::new(transcoder.clone()));

        let first = job(dir.path(), 1);
        queue.enqueue(first.clone()).unwrap();
        queue.enqueue(job(dir.path(), 2)).unwrap();
        queue.enqueue(job(dir.path(), 3)).unwrap();

        assert!(queue.poll().is_empty());
        assert_eq!(queue.in_flight(), Some(&first));

        fs::remove_file(&first.source_path).unwrap();
        let outcomes = queue.poll();
        assert_eq!(outcomes, vec![JobOutcome::Completed(first)]);
        assert_eq!(queue.len(), 2);
        assert_eq!(
            queue.in_flight().map(|j| j.source_path.clone()),
            Some(dir.path().join("vi_0002.h264"))
        );
        assert_eq!(transcoder.launched.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_queue_drains() {
        let dir = tempfile::tempdir().unwrap();
        let mut queue = PostProcessQueue::new(4, Box::new(FakeTranscoder::default()));
        let a = job(dir.path(), 1);
        let b = job(dir.path(), 2);
        queue.enqueue(a.clone()).unwrap();
        queue.enqueue(b.clone()).unwrap();

        fs::remove_file(&a.source_path).unwrap();
        fs::remove_file(&b.source_path).unwrap();
        let outcomes = queue.poll();
        assert_eq!(outcomes.len(), 2);
        assert!(queue.is_empty());
        assert!(!queue.is_busy());
    }

    #[test]
    fn test_launch_failure_drops_job() {
        let dir = tempfile::tempdir().unwrap();
        let transcoder = FakeTranscoder {
            fail: true,
            ..Default::default()
        };
        let mut queue = PostProcessQueue::new(4, Box::new(transcoder));
        queue.enqueue(job(dir.path(), 1)).unwrap();
        assert!(queue.is_empty());

        let outcomes = queue.poll();
        assert!(matches!(outcomes.as_slice(), [JobOutcome::Failed { .. }]));
    }

    // ========== Real process ==========

    #[test]
    fn test_exited_process_with_artifact_is_failure() {
        struct FalseTranscoder;
        impl Transcoder for FalseTranscoder {
            fn launch(&mut self, _job: &BoxJob) -> Result<TranscodeHandle> {
                let child = Command::new("sh").arg("-c").arg("exit 3").spawn()?;
                Ok(TranscodeHandle::from_child(child))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let mut queue = PostProcessQueue::new(4, Box::new(FalseTranscoder));
        let j = job(dir.path(), 1);
        queue.enqueue(j.clone()).unwrap();

        let mut outcomes = Vec::new();
        for _ in 0..200 {
            outcomes = queue.poll();
            if !outcomes.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(matches!(&outcomes[..], [JobOutcome::Failed { job, .. }] if *job == j));
        assert!(j.source_path.exists());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_mp4box_command_line() {
        let transcoder = Mp4BoxTranscoder::new("MP4Box", 25);
        let job = BoxJob {
            source_path: PathBuf::from("/media/vi 1.h264"),
            output_path: PathBuf::from("/media/vi 1.mp4"),
        };
        let command = transcoder.command(&job);
        let args: Vec<_> = command
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert_eq!(args[0], "-c");
        assert_eq!(&args[2..], ["MP4Box", "25", "/media/vi 1.h264", "/media/vi 1.mp4"]);
    }
}
