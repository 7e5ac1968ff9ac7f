//! Control pipe command protocol
//!
//! One command per line: a two-letter opcode, then space-separated
//! parameters. Each command maps onto exactly one engine setter.

use std::fmt;
use std::str::FromStr;

use crate::error::{CaptureError, Result};

/// Longest accepted command line
pub const MAX_COMMAND_LEN: usize = 128;

/// Longest timed recording `ca 1 <secs>` accepts: one week
pub const MAX_RECORD_SECS: u64 = 7 * 24 * 60 * 60;

/// All supported commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `ca 1 [secs]` / `ca 0`
    Record(RecordParams),
    /// `bu ms`: pre-roll length, 0 disables buffering
    SetBuffer { millis: u32 },
    /// `bl bps`
    SetBitrate { bps: u32 },
    /// `ip frames`
    SetIntraPeriod { frames: u32 },
    /// `md 0|1`
    MotionDetection { enabled: bool },
    /// `mn n`
    MotionNoise { noise: u8 },
    /// `mt n`
    MotionThreshold { threshold: u32 },
    /// `ms n`
    MotionStartFrames { frames: u32 },
    /// `me n`
    MotionStopFrames { frames: u32 },
    /// `bo 0|1`
    Boxing { enabled: bool },
    /// `ru 0|1`: halt or resume everything
    Run { enabled: bool },
}

/// Parameters for recording control
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordParams {
    /// true = start recording, false = stop recording
    pub start: bool,
    /// Optional duration limit in seconds
    pub duration_secs: Option<u64>,
}

impl Command {
    /// Parse a full control line.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        if line.len() > MAX_COMMAND_LEN {
            return Err(CaptureError::Protocol(format!(
                "command longer than {MAX_COMMAND_LEN} bytes"
            )));
        }
        let (opcode, params) = match line.char_indices().nth(2) {
            Some((split, _)) => line.split_at(split),
            None => (line, ""),
        };
        Self::from_parts(opcode, params)
    }

    /// Build a command from an opcode and its raw parameter string.
    pub fn from_parts(opcode: &str, params: &str) -> Result<Self> {
        let args: Vec<&str> = params.split_whitespace().collect();
        let command = match opcode {
            "ca" => {
                let start = flag(opcode, &args, 0)?;
                let duration_secs = match args.get(1) {
                    Some(_) if start => Some(duration(opcode, &args, 1)?),
                    _ => None,
                };
                Command::Record(RecordParams {
                    start,
                    duration_secs,
                })
            }
            "bu" => Command::SetBuffer {
                millis: number(opcode, &args, 0)?,
            },
            "bl" => Command::SetBitrate {
                bps: number(opcode, &args, 0)?,
            },
            "ip" => Command::SetIntraPeriod {
                frames: number(opcode, &args, 0)?,
            },
            "md" => Command::MotionDetection {
                enabled: flag(opcode, &args, 0)?,
            },
            "mn" => Command::MotionNoise {
                noise: number(opcode, &args, 0)?,
            },
            "mt" => Command::MotionThreshold {
                threshold: number(opcode, &args, 0)?,
            },
            "ms" => Command::MotionStartFrames {
                frames: number(opcode, &args, 0)?,
            },
            "me" => Command::MotionStopFrames {
                frames: number(opcode, &args, 0)?,
            },
            "bo" => Command::Boxing {
                enabled: flag(opcode, &args, 0)?,
            },
            "ru" => Command::Run {
                enabled: flag(opcode, &args, 0)?,
            },
            other => {
                return Err(CaptureError::Protocol(format!("unknown opcode {other:?}")));
            }
        };
        Ok(command)
    }

    pub fn opcode(&self) -> &'static str {
        match self {
            Command::Record(_) => "ca",
            Command::SetBuffer { .. } => "bu",
            Command::SetBitrate { .. } => "bl",
            Command::SetIntraPeriod { .. } => "ip",
            Command::MotionDetection { .. } => "md",
            Command::MotionNoise { .. } => "mn",
            Command::MotionThreshold { .. } => "mt",
            Command::MotionStartFrames { .. } => "ms",
            Command::MotionStopFrames { .. } => "me",
            Command::Boxing { .. } => "bo",
            Command::Run { .. } => "ru",
        }
    }
}

impl FromStr for Command {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self> {
        Command::parse(s)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = self.opcode();
        match self {
            Command::Record(RecordParams {
                start,
                duration_secs,
            }) => match duration_secs {
                Some(secs) => write!(f, "{op} {} {secs}", *start as u8),
                None => write!(f, "{op} {}", *start as u8),
            },
            Command::SetBuffer { millis } => write!(f, "{op} {millis}"),
            Command::SetBitrate { bps } => write!(f, "{op} {bps}"),
            Command::SetIntraPeriod { frames }
            | Command::MotionStartFrames { frames }
            | Command::MotionStopFrames { frames } => write!(f, "{op} {frames}"),
            Command::MotionNoise { noise } => write!(f, "{op} {noise}"),
            Command::MotionThreshold { threshold } => write!(f, "{op} {threshold}"),
            Command::MotionDetection { enabled }
            | Command::Boxing { enabled }
            | Command::Run { enabled } => write!(f, "{op} {}", *enabled as u8),
        }
    }
}

fn arg<'a>(opcode: &str, args: &[&'a str], index: usize) -> Result<&'a str> {
    args.get(index).copied().ok_or_else(|| {
        CaptureError::Protocol(format!("{opcode}: missing parameter {}", index + 1))
    })
}

fn number<T: FromStr>(opcode: &str, args: &[&str], index: usize) -> Result<T> {
    let raw = arg(opcode, args, index)?;
    raw.parse()
        .map_err(|_| CaptureError::Protocol(format!("{opcode}: invalid number {raw:?}")))
}

fn duration(opcode: &str, args: &[&str], index: usize) -> Result<u64> {
    let secs: u64 = number(opcode, args, index)?;
    if secs > MAX_RECORD_SECS {
        return Err(CaptureError::Protocol(format!(
            "{opcode}: duration {secs}s exceeds {MAX_RECORD_SECS}s"
        )));
    }
    Ok(secs)
}

fn flag(opcode: &str, args: &[&str], index: usize) -> Result<bool> {
    match arg(opcode, args, index)? {
        "1" | "true" | "on" => Ok(true),
        "0" | "false" | "off" => Ok(false),
        raw => Err(CaptureError::Protocol(format!(
            "{opcode}: expected 0 or 1, got {raw:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_capture() {
        assert_eq!(
            Command::parse("ca 1").unwrap(),
            Command::Record(RecordParams {
                start: true,
                duration_secs: None
            })
        );
        assert_eq!(
            Command::parse("ca 1 30\n").unwrap(),
            Command::Record(RecordParams {
                start: true,
                duration_secs: Some(30)
            })
        );
        // Duration is meaningless on stop
        assert_eq!(
            Command::parse("ca 0 30").unwrap(),
            Command::Record(RecordParams {
                start: false,
                duration_secs: None
            })
        );
    }

    #[test]
    fn test_parse_setters() {
        assert_eq!(
            Command::parse("bu 3000").unwrap(),
            Command::SetBuffer { millis: 3000 }
        );
        assert_eq!(
            Command::parse("bl 17000000").unwrap(),
            Command::SetBitrate { bps: 17_000_000 }
        );
        assert_eq!(
            Command::parse("md 1").unwrap(),
            Command::MotionDetection { enabled: true }
        );
        assert_eq!(
            Command::parse("mn 3").unwrap(),
            Command::MotionNoise { noise: 3 }
        );
        assert_eq!(
            Command::parse("ru 0").unwrap(),
            Command::Run { enabled: false }
        );
    }

    #[test]
    fn test_from_parts_matches_parse() {
        assert_eq!(
            Command::from_parts("mt", "12").unwrap(),
            Command::parse("mt 12").unwrap()
        );
    }

    #[test]
    fn test_protocol_errors() {
        for line in ["zz 1", "ca", "bu x", "md 2", "mn 300", "", "b"] {
            let err = Command::parse(line).unwrap_err();
            assert!(matches!(err, CaptureError::Protocol(_)), "{line:?}");
        }
        let long = format!("bu {}", "1".repeat(MAX_COMMAND_LEN));
        assert!(Command::parse(&long).is_err());
    }

    #[test]
    fn test_recording_duration_is_capped() {
        assert_eq!(
            Command::parse(&format!("ca 1 {MAX_RECORD_SECS}")).unwrap(),
            Command::Record(RecordParams {
                start: true,
                duration_secs: Some(MAX_RECORD_SECS)
            })
        );
        for line in ["ca 1 604801", "ca 1 18446744073709551615"] {
            let err = Command::parse(line).unwrap_err();
            assert!(matches!(err, CaptureError::Protocol(_)), "{line:?}");
        }
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        for line in ["ca 1 10", "ca 0", "bu 500", "ip 30", "md 1", "me 150", "bo 0"] {
            let command: Command = line.parse().unwrap();
            assert_eq!(command.to_string(), line);
        }
    }
}
