//! Text protocol spoken by the T-962 controller firmware.
//!
//! Device output is one record per line:
//!
//! ```text
//! # Time,  Temp0, Temp1, Temp2, Temp3,  Set,Actual, Heat, Fan,  ColdJ, Mode
//!    0.0,   31.5,  44.1,   0.0,   0.0,   50,  37.8,    0,   0,   31.5, STANDBY
//! T-962-controller open source firmware (v0.5.2)
//! ```
use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::device::models::{OvenMode, TelemetryRecord};

const TELEMETRY_FIELDS: usize = 11;
const BANNER_MARKER: &str = "firmware (v";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionBanner {
    /// Tag as printed by the firmware, including the leading `v`.
    pub version: String,
}

/// Classification of a single line from the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum LineEvent {
    Blank,
    Comment(String),
    Telemetry(TelemetryRecord),
    /// Shaped like telemetry, but a numeric column did not parse.
    Malformed { line: String, reason: String },
    Version(VersionBanner),
    /// Anything else: command responses and boot chatter.
    Unclassified(String),
}

/// Classify a line. Comments win, then telemetry, then the version banner.
pub fn decode_line(line: &str) -> LineEvent {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return LineEvent::Blank;
    }
    if trimmed.starts_with('#') {
        return LineEvent::Comment(trimmed.to_string());
    }
    match parse_telemetry(trimmed) {
        Some(Ok(record)) => return LineEvent::Telemetry(record),
        Some(Err(reason)) => {
            return LineEvent::Malformed { line: trimmed.to_string(), reason };
        }
        None => {}
    }
    if let Some(banner) = parse_version_banner(trimmed) {
        return LineEvent::Version(banner);
    }
    LineEvent::Unclassified(line.to_string())
}

/// `None` when the line does not have the telemetry shape (eleven columns
/// ending in a known mode); `Some(Err)` when it does but a number is bad.
pub fn parse_telemetry(line: &str) -> Option<std::result::Result<TelemetryRecord, String>> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != TELEMETRY_FIELDS {
        return None;
    }
    if fields.iter().any(|f| f.is_empty() || f.contains(char::is_whitespace)) {
        return None;
    }
    let mode: OvenMode = fields[10].parse().ok()?;

    let mut values = [0f64; TELEMETRY_FIELDS - 1];
    for (slot, field) in values.iter_mut().zip(&fields) {
        match field.parse::<f64>() {
            Ok(v) if v.is_finite() => *slot = v,
            _ => return Some(Err(format!("non-numeric column '{}'", field))),
        }
    }
    let [time, temp0, temp1, temp2, temp3, setpoint, actual, heat, fan, cold_junction] = values;

    Some(Ok(TelemetryRecord {
        captured_at: Utc::now(),
        time,
        temp0,
        temp1,
        temp2,
        temp3,
        setpoint,
        actual,
        heat,
        fan,
        cold_junction,
        mode,
    }))
}

/// Extract the tag from `T-962-controller open source firmware (v0.5.2)`.
pub fn parse_version_banner(line: &str) -> Option<VersionBanner> {
    let start = line.find(BANNER_MARKER)? + BANNER_MARKER.len();
    let rest = &line[start..];
    let end = rest.find(')')?;
    let number = &rest[..end];
    semver::Version::parse(number).ok()?;
    Some(VersionBanner { version: format!("v{}", number) })
}

/// Commands understood by the controller's serial console.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    About,
    Help,
    ListProfiles,
    ListSettings,
    /// Toggles periodic telemetry while in standby.
    Quiet,
    Reflow,
    Stop,
    Values,
    Bake { setpoint: u32, seconds: Option<u32> },
    Setting { id: u32, value: f64 },
    SelectProfile(u32),
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::About => write!(f, "about"),
            Command::Help => write!(f, "help"),
            Command::ListProfiles => write!(f, "list profiles"),
            Command::ListSettings => write!(f, "list settings"),
            Command::Quiet => write!(f, "quiet"),
            Command::Reflow => write!(f, "reflow"),
            Command::Stop => write!(f, "stop"),
            Command::Values => write!(f, "values"),
            Command::Bake { setpoint, seconds: None } => write!(f, "bake {}", setpoint),
            Command::Bake { setpoint, seconds: Some(seconds) } => {
                write!(f, "bake {} {}", setpoint, seconds)
            }
            Command::Setting { id, value } => write!(f, "setting {} {}", id, value),
            Command::SelectProfile(id) => write!(f, "select profile {}", id),
        }
    }
}

/// Split an indexed listing line such as `3: CUSTOM #1` into `(3, "CUSTOM #1")`.
pub fn parse_indexed_line(line: &str) -> Option<(usize, &str)> {
    let (index, rest) = line.trim().split_once(':')?;
    let index = index.trim().parse().ok()?;
    Some((index, rest.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_literals() {
        assert_eq!(Command::ListProfiles.to_string(), "list profiles");
        assert_eq!(Command::Bake { setpoint: 120, seconds: None }.to_string(), "bake 120");
        assert_eq!(
            Command::Bake { setpoint: 120, seconds: Some(3600) }.to_string(),
            "bake 120 3600"
        );
        assert_eq!(Command::Setting { id: 2, value: 1.5 }.to_string(), "setting 2 1.5");
        assert_eq!(Command::SelectProfile(4).to_string(), "select profile 4");
    }

    #[test]
    fn header_is_a_comment() {
        let header = "# Time,  Temp0, Temp1, Temp2, Temp3,  Set,Actual, Heat, Fan,  ColdJ, Mode";
        assert!(matches!(decode_line(header), LineEvent::Comment(_)));
    }

    #[test]
    fn banner_requires_semver_tag() {
        assert_eq!(
            parse_version_banner("T-962-controller open source firmware (v0.5.2)"),
            Some(VersionBanner { version: "v0.5.2".into() })
        );
        assert_eq!(parse_version_banner("firmware (vX.Y)"), None);
        assert_eq!(parse_version_banner("Running on an LPC2134(/01) rev F"), None);
    }

    #[test]
    fn indexed_lines() {
        assert_eq!(parse_indexed_line(" 3: CUSTOM #1"), Some((3, "CUSTOM #1")));
        assert_eq!(parse_indexed_line("Reflow profiles available:"), None);
    }
}
