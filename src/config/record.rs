use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const RECORD_FILE_NAME: &str = "toaster-firmware.json";

/// Last firmware version confirmed live on the oven.
///
/// Stored as `{"version": "v0.5.2"}`, or `{}` while a reset or flash is in
/// progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl RecoveryRecord {
    pub fn confirmed(version: impl Into<String>) -> Self {
        Self { version: Some(version.into()) }
    }

    pub fn invalidated() -> Self {
        Self { version: None }
    }
}

#[derive(Debug, Clone)]
pub struct RecordStore {
    path: PathBuf,
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new(Self::default_path())
    }
}

impl RecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_path() -> PathBuf {
        std::env::temp_dir().join(RECORD_FILE_NAME)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` when there is no usable record. Never fails.
    pub async fn load(&self) -> Option<RecoveryRecord> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::debug!("No recovery record at {}", self.path.display());
                return None;
            }
            Err(e) => {
                log::warn!("Failed to read recovery record {}: {}", self.path.display(), e);
                return None;
            }
        };
        match serde_json::from_str(&text) {
            Ok(record) => Some(record),
            Err(e) => {
                log::debug!("Ignoring unreadable recovery record {}: {}", self.path.display(), e);
                None
            }
        }
    }

    pub async fn store(&self, record: &RecoveryRecord) -> std::io::Result<()> {
        let json = serde_json::to_string(record)?;
        tokio::fs::write(&self.path, json).await?;
        log::debug!("Recovery record {} now {:?}", self.path.display(), record);
        Ok(())
    }
}
