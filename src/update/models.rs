use std::time::Duration;

use semver::Version;
use serde::{Deserialize, Serialize};

use super::image::HexError;
use crate::serial::SerialError;

pub const RELEASE_BASE_URL: &str =
    "https://github.com/UnifiedEngineering/T-962-improvements/releases/download";
pub const ARTIFACT_NAME: &str = "T-962-controller.hex";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareRelease {
    /// Tag as published, including the leading `v`.
    pub tag: String,
    pub version: Version,
    pub download_url: String,
    pub sha256_hash: Option<String>,
}

impl FirmwareRelease {
    /// Release published under `tag` (e.g. `v0.5.2`) at the default location.
    pub fn for_tag(tag: &str) -> UpdateResult<Self> {
        let url = format!("{}/{}/{}", RELEASE_BASE_URL, tag, ARTIFACT_NAME);
        Self::with_url(tag, url)
    }

    pub fn with_url(tag: &str, download_url: impl Into<String>) -> UpdateResult<Self> {
        let version = Version::parse(tag.strip_prefix('v').unwrap_or(tag))?;
        Ok(Self {
            tag: tag.to_string(),
            version,
            download_url: download_url.into(),
            sha256_hash: None,
        })
    }

    pub fn with_sha256(mut self, hash: Option<String>) -> Self {
        self.sha256_hash = hash.map(|h| h.to_lowercase());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Download of {url} failed with status {status}")]
    BadStatus { status: u16, url: String },

    #[error("Firmware download from {0} returned an empty body")]
    EmptyBody(String),

    #[error("Version parsing error: {0}")]
    Version(#[from] semver::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Firmware image error: {0}")]
    Hex(#[from] HexError),

    #[error("Firmware integrity check failed - expected {expected}, computed {computed}")]
    Integrity { expected: String, computed: String },

    #[error("Serial error: {0}")]
    Serial(#[from] SerialError),

    #[error("Bootloader error: {0}")]
    Isp(String),

    #[error("Segment {index} at 0x{address:08x} failed: {reason}")]
    Segment { index: usize, address: u32, reason: String },

    #[error("No telemetry within {0:?} of restart")]
    NotVerified(Duration),
}

pub type UpdateResult<T> = Result<T, UpdateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_release_url() {
        let release = FirmwareRelease::for_tag("v0.5.2").unwrap();
        assert_eq!(
            release.download_url,
            "https://github.com/UnifiedEngineering/T-962-improvements/releases/download/v0.5.2/T-962-controller.hex"
        );
        assert_eq!(release.version, Version::new(0, 5, 2));
    }

    #[test]
    fn rejects_non_semver_tags() {
        assert!(matches!(FirmwareRelease::for_tag("latest"), Err(UpdateError::Version(_))));
    }
}
