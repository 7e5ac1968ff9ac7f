//! Motion-vector trigger with hysteresis
//!
//! Each frame's vectors are reduced to a count of "changed" components: a
//! dx or dy byte counts when it lies strictly between the noise floor and
//! `255 - noise`. Values near 0 or near 255 are either still or saturated and
//! treated as noise.
//!
//! A Start needs `start_frames` consecutive frames at or above the threshold;
//! a Stop needs `stop_frames` consecutive frames below it. A single frame on
//! the wrong side resets the run.

use std::fmt;
use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use crate::chunk::MotionVectors;
use crate::config::MotionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionPhase {
    WaitingForMotion,
    WaitingForQuiet,
}

impl fmt::Display for MotionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MotionPhase::WaitingForMotion => write!(f, "waiting for motion"),
            MotionPhase::WaitingForQuiet => write!(f, "waiting for quiet"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionEvent {
    Start,
    Stop,
}

/// Per-macroblock selection; `true` means analysed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MotionMask {
    columns: usize,
    rows: usize,
    cells: Vec<bool>,
}

impl MotionMask {
    pub fn new(columns: usize, rows: usize, cells: Vec<bool>) -> Option<Self> {
        if cells.len() != columns * rows {
            return None;
        }
        Some(Self {
            columns,
            rows,
            cells,
        })
    }

    /// Load a binary PGM (`P5`, maxval 255) whose size matches the grid.
    /// Nonzero pixels are analysed.
    pub fn load(path: &Path, columns: usize, rows: usize) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("reading motion mask {}", path.display()))?;
        Self::from_pgm(&bytes, columns, rows)
            .with_context(|| format!("parsing motion mask {}", path.display()))
    }

    pub fn from_pgm(bytes: &[u8], columns: usize, rows: usize) -> Result<Self> {
        let mut pos = 0;
        let magic = pgm_token(bytes, &mut pos)?;
        if magic != b"P5" {
            bail!("not a binary PGM");
        }
        let width: usize = pgm_number(bytes, &mut pos)?;
        let height: usize = pgm_number(bytes, &mut pos)?;
        let maxval: usize = pgm_number(bytes, &mut pos)?;
        if maxval != 255 {
            bail!("unsupported maxval {maxval}");
        }
        if width != columns || height != rows {
            bail!("mask is {width}x{height}, grid is {columns}x{rows}");
        }
        // Exactly one whitespace byte separates the header from the raster
        pos += 1;
        let raster = bytes
            .get(pos..pos + columns * rows)
            .context("truncated raster")?;
        let cells = raster.iter().map(|&v| v != 0).collect();
        Ok(Self {
            columns,
            rows,
            cells,
        })
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn is_active(&self, index: usize) -> bool {
        self.cells.get(index).copied().unwrap_or(true)
    }
}

fn pgm_token<'a>(bytes: &'a [u8], pos: &mut usize) -> Result<&'a [u8]> {
    loop {
        match bytes.get(*pos) {
            Some(b'#') => {
                while bytes.get(*pos).is_some_and(|&b| b != b'\n') {
                    *pos += 1;
                }
            }
            Some(b) if b.is_ascii_whitespace() => *pos += 1,
            Some(_) => break,
            None => bail!("truncated header"),
        }
    }
    let start = *pos;
    while bytes.get(*pos).is_some_and(|b| !b.is_ascii_whitespace()) {
        *pos += 1;
    }
    Ok(&bytes[start..*pos])
}

fn pgm_number(bytes: &[u8], pos: &mut usize) -> Result<usize> {
    let token = pgm_token(bytes, pos)?;
    std::str::from_utf8(token)
        .ok()
        .and_then(|s| s.parse().ok())
        .with_context(|| format!("bad header field {:?}", String::from_utf8_lossy(token)))
}

pub struct MotionDetector {
    noise: u8,
    threshold: u32,
    start_frames: u32,
    stop_frames: u32,
    mask: Option<MotionMask>,
    phase: MotionPhase,
    run_counter: u32,
    changed_count: u32,
}

impl MotionDetector {
    pub fn new(config: &MotionConfig, mask: Option<MotionMask>) -> Self {
        Self {
            noise: config.noise,
            threshold: config.threshold,
            start_frames: config.start_frames.max(1),
            stop_frames: config.stop_frames.max(1),
            mask,
            phase: MotionPhase::WaitingForMotion,
            run_counter: 0,
            changed_count: 0,
        }
    }

    pub fn phase(&self) -> MotionPhase {
        self.phase
    }

    /// Changed components in the most recent frame.
    pub fn changed_count(&self) -> u32 {
        self.changed_count
    }

    pub fn set_noise(&mut self, noise: u8) {
        self.noise = noise;
    }

    pub fn set_threshold(&mut self, threshold: u32) {
        self.threshold = threshold;
    }

    pub fn set_start_frames(&mut self, frames: u32) {
        self.start_frames = frames.max(1);
    }

    pub fn set_stop_frames(&mut self, frames: u32) {
        self.stop_frames = frames.max(1);
    }

    /// Back to waiting for motion with an empty run.
    pub fn reset(&mut self) {
        self.phase = MotionPhase::WaitingForMotion;
        self.run_counter = 0;
        self.changed_count = 0;
    }

    fn is_change(&self, component: u8) -> bool {
        component > self.noise && component < 255 - self.noise
    }

    /// Count changed vector components over the unmasked macroblocks.
    pub fn count_changes(&self, vectors: &MotionVectors) -> u32 {
        let mask = self
            .mask
            .as_ref()
            .filter(|m| m.columns == vectors.columns && m.rows == vectors.rows);

        let mut changed = 0;
        for index in 0..vectors.macroblocks() {
            if mask.is_some_and(|m| !m.is_active(index)) {
                continue;
            }
            let (dx, dy) = vectors.vector(index);
            changed += self.is_change(dx) as u32 + self.is_change(dy) as u32;
        }
        changed
    }

    pub fn analyse(&mut self, vectors: &MotionVectors) -> Option<MotionEvent> {
        let changed = self.count_changes(vectors);
        self.update(changed)
    }

    /// Feed one frame's change count through the hysteresis.
    pub fn update(&mut self, changed: u32) -> Option<MotionEvent> {
        self.changed_count = changed;
        match self.phase {
            MotionPhase::WaitingForMotion => {
                if changed >= self.threshold {
                    self.run_counter += 1;
                } else {
                    self.run_counter = 0;
                }
                if self.run_counter >= self.start_frames {
                    self.run_counter = 0;
                    self.phase = MotionPhase::WaitingForQuiet;
                    info!(changed, "Motion detected");
                    return Some(MotionEvent::Start);
                }
            }
            MotionPhase::WaitingForQuiet => {
                if changed < self.threshold {
                    self.run_counter += 1;
                } else {
                    self.run_counter = 0;
                }
                if self.run_counter >= self.stop_frames {
                    self.run_counter = 0;
                    self.phase = MotionPhase::WaitingForMotion;
                    info!(changed, "Motion stopped");
                    return Some(MotionEvent::Stop);
                }
            }
        }
        debug!(changed, run = self.run_counter, phase = %self.phase, "Motion frame");
        None
    }
}
