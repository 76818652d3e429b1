use async_trait::async_trait;
use log::{debug, error, info};
use reqwest::Client;
use sha2::{Digest, Sha256};

use super::models::{FirmwareRelease, UpdateError, UpdateResult};

/// Where firmware images come from.
#[async_trait]
pub trait FirmwareSource: Send + Sync {
    /// Intel HEX text of the release.
    async fn fetch(&self, release: &FirmwareRelease) -> UpdateResult<String>;
}

pub struct UpdateService {
    client: Client,
}

impl Default for UpdateService {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateService {
    pub fn new() -> Self {
        Self { client: Client::new() }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl FirmwareSource for UpdateService {
    async fn fetch(&self, release: &FirmwareRelease) -> UpdateResult<String> {
        info!("Downloading firmware {} from: {}", release.tag, release.download_url);

        let response = self
            .client
            .get(&release.download_url)
            .header("User-Agent", concat!("toaster/", env!("CARGO_PKG_VERSION")))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            error!("Download request failed with status: {}", status);
            return Err(UpdateError::BadStatus {
                status: status.as_u16(),
                url: release.download_url.clone(),
            });
        }

        let body = response.text().await?;
        if body.trim().is_empty() {
            return Err(UpdateError::EmptyBody(release.download_url.clone()));
        }
        verify_firmware(&body, release.sha256_hash.as_deref())?;

        info!("Firmware download completed: {} bytes", body.len());
        Ok(body)
    }
}

/// Check the downloaded text against an expected SHA-256, if one is known.
pub fn verify_firmware(body: &str, expected_hash: Option<&str>) -> UpdateResult<()> {
    let Some(expected) = expected_hash else {
        debug!("No hash provided, skipping verification");
        return Ok(());
    };

    let computed = hex::encode(Sha256::digest(body.as_bytes()));
    let expected = expected.to_lowercase();
    if computed == expected {
        info!("Firmware verification successful: {}", computed);
        Ok(())
    } else {
        error!(
            "Firmware verification failed - expected: {}, computed: {}",
            expected, computed
        );
        Err(UpdateError::Integrity { expected, computed })
    }
}
