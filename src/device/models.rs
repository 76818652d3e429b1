use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Operating mode reported in the last telemetry column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OvenMode {
    Standby,
    Reflow,
    Bake,
}

impl OvenMode {
    pub const ALL: [OvenMode; 3] = [OvenMode::Standby, OvenMode::Reflow, OvenMode::Bake];

    pub fn as_str(&self) -> &'static str {
        match self {
            OvenMode::Standby => "STANDBY",
            OvenMode::Reflow => "REFLOW",
            OvenMode::Bake => "BAKE",
        }
    }
}

impl fmt::Display for OvenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OvenMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STANDBY" => Ok(OvenMode::Standby),
            "REFLOW" => Ok(OvenMode::Reflow),
            "BAKE" => Ok(OvenMode::Bake),
            other => Err(format!("unknown oven mode '{}'", other)),
        }
    }
}

/// One status sample from the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Host time at which the line was decoded.
    pub captured_at: DateTime<Utc>,
    /// Seconds since the controller started the current run.
    pub time: f64,
    pub temp0: f64,
    pub temp1: f64,
    pub temp2: f64,
    pub temp3: f64,
    pub setpoint: f64,
    pub actual: f64,
    pub heat: f64,
    pub fan: f64,
    pub cold_junction: f64,
    pub mode: OvenMode,
}

impl TelemetryRecord {
    /// Render in the controller's column order.
    pub fn to_csv_line(&self) -> String {
        format!(
            "{}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}",
            self.time,
            self.temp0,
            self.temp1,
            self.temp2,
            self.temp3,
            self.setpoint,
            self.actual,
            self.heat,
            self.fan,
            self.cold_junction,
            self.mode
        )
    }
}

/// One line of `list settings`, e.g. `2: Min fan speed    8`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingEntry {
    pub comment: String,
    pub value: String,
}

impl SettingEntry {
    /// Split the text after the index into description and trailing value.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let (comment, value) = text.rsplit_once(char::is_whitespace)?;
        Some(Self {
            comment: comment.trim().to_string(),
            value: value.to_string(),
        })
    }

    pub fn numeric_value(&self) -> Option<f64> {
        self.value.parse().ok()
    }
}
