//! Bring the oven to a known firmware version with telemetry flowing.
//!
//! ```text
//! START -> FAST_PATH_CHECK -> CONFIRMED
//!              |
//!              v
//!          FULL_RESET -> VERSION_PROBE -> FLASH | SKIP_FLASH -> RUNTIME_VERIFY -> CONFIRMED | FAILED
//! ```
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::Serialize;

use super::image::FirmwareImage;
use super::isp::Programmer;
use super::models::{FirmwareRelease, UpdateError, UpdateResult};
use super::service::FirmwareSource;
use crate::config::{OvenConfig, RecordStore, RecoveryRecord};
use crate::device::DeviceSession;
use crate::serial::protocol::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryState {
    Start,
    FastPathCheck,
    FullReset,
    VersionProbe,
    Flash,
    SkipFlash,
    RuntimeVerify,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct RecoverySettings {
    pub release: FirmwareRelease,
    pub fast_path_timeout: Duration,
    pub version_timeout: Duration,
    pub verify_timeout: Duration,
    pub boot_delay: Duration,
}

impl RecoverySettings {
    pub fn new(release: FirmwareRelease) -> Self {
        Self {
            release,
            fast_path_timeout: Duration::from_secs(5),
            version_timeout: Duration::from_secs(1),
            verify_timeout: Duration::from_secs(5),
            boot_delay: Duration::from_secs(1),
        }
    }

    pub fn from_config(config: &OvenConfig) -> UpdateResult<Self> {
        let firmware = &config.firmware;
        let release = match &firmware.url {
            Some(url) => FirmwareRelease::with_url(&firmware.target, url.clone())?,
            None => FirmwareRelease::for_tag(&firmware.target)?,
        }
        .with_sha256(firmware.sha256.clone());

        let recovery = &config.recovery;
        Ok(Self {
            release,
            fast_path_timeout: Duration::from_millis(recovery.fast_path_timeout_ms),
            version_timeout: Duration::from_millis(recovery.version_timeout_ms),
            verify_timeout: Duration::from_millis(recovery.verify_timeout_ms),
            boot_delay: Duration::from_millis(recovery.boot_delay_ms),
        })
    }

    pub fn target(&self) -> &str {
        &self.release.tag
    }
}

#[derive(Debug)]
pub struct RecoveryOutcome {
    pub state: RecoveryState,
    /// Version last reported by the firmware, if any.
    pub version: Option<String>,
    /// Every state entered, in order.
    pub trace: Vec<RecoveryState>,
    pub error: Option<UpdateError>,
}

impl RecoveryOutcome {
    pub fn is_confirmed(&self) -> bool {
        self.state == RecoveryState::Confirmed
    }

    pub fn visited(&self, state: RecoveryState) -> bool {
        self.trace.contains(&state)
    }
}

pub struct FirmwareRecovery {
    session: Arc<DeviceSession>,
    records: RecordStore,
    source: Box<dyn FirmwareSource>,
    programmer: Box<dyn Programmer>,
    settings: RecoverySettings,
    trace: Vec<RecoveryState>,
}

impl FirmwareRecovery {
    pub fn new(
        session: Arc<DeviceSession>,
        records: RecordStore,
        source: Box<dyn FirmwareSource>,
        programmer: Box<dyn Programmer>,
        settings: RecoverySettings,
    ) -> Self {
        Self {
            session,
            records,
            source,
            programmer,
            settings,
            trace: Vec::new(),
        }
    }

    pub fn state(&self) -> RecoveryState {
        self.trace.last().copied().unwrap_or(RecoveryState::Start)
    }

    /// Run once. Failures are reported in the outcome; there is no retry.
    pub async fn run(&mut self) -> RecoveryOutcome {
        self.trace.clear();
        self.enter(RecoveryState::Start);

        let error = match self.drive().await {
            Ok(()) => {
                self.enter(RecoveryState::Confirmed);
                let record = RecoveryRecord::confirmed(self.settings.target());
                if let Err(e) = self.records.store(&record).await {
                    warn!("Failed to persist recovery record: {}", e);
                }
                info!("Firmware {} confirmed, telemetry flowing", self.settings.target());
                None
            }
            Err(e) => {
                self.enter(RecoveryState::Failed);
                error!("Firmware recovery failed: {}", e);
                Some(e)
            }
        };

        RecoveryOutcome {
            state: self.state(),
            version: self.session.version().get(),
            trace: self.trace.clone(),
            error,
        }
    }

    async fn drive(&mut self) -> UpdateResult<()> {
        if self.fast_path_check().await {
            return Ok(());
        }

        self.full_reset().await?;
        let version = self.probe_version().await?;
        if version.as_deref() == Some(self.settings.target()) {
            self.enter(RecoveryState::SkipFlash);
        } else {
            self.enter(RecoveryState::Flash);
            info!(
                "Updating firmware from {} to {}",
                version.as_deref().unwrap_or("unknown"),
                self.settings.target()
            );
            self.flash().await?;
        }
        self.verify().await
    }

    fn enter(&mut self, state: RecoveryState) {
        debug!("Recovery state -> {:?}", state);
        self.trace.push(state);
    }

    /// Trust a matching record if telemetry shows up without touching hardware.
    async fn fast_path_check(&mut self) -> bool {
        self.enter(RecoveryState::FastPathCheck);
        let target = self.settings.target();
        let record = self.records.load().await;
        if record.as_ref().and_then(|r| r.version.as_deref()) != Some(target) {
            info!("No confirmed record for {}, resetting oven to known state", target);
            return false;
        }

        let live = self.session.outputting().next_value(true);
        self.session.set_decoding(true);
        match tokio::time::timeout(self.settings.fast_path_timeout, live).await {
            Ok(_) => {
                info!("Record says {} and telemetry is flowing, skipping reset", target);
                true
            }
            Err(_) => {
                warn!(
                    "No telemetry within {:?} despite record for {}",
                    self.settings.fast_path_timeout, target
                );
                false
            }
        }
    }

    async fn full_reset(&mut self) -> UpdateResult<()> {
        self.enter(RecoveryState::FullReset);
        if let Err(e) = self.records.store(&RecoveryRecord::invalidated()).await {
            warn!("Failed to invalidate recovery record: {}", e);
        }
        self.session.outputting().set(false);
        self.session.version().set(None);
        self.session.set_decoding(true);
        self.session.interface().reset(false).await?;
        // Telemetry queued before the pulse says nothing about the new boot.
        self.session.outputting().set(false);
        Ok(())
    }

    /// `None` when the firmware never identified itself in time.
    async fn probe_version(&mut self) -> UpdateResult<Option<String>> {
        self.enter(RecoveryState::VersionProbe);
        let target = Some(self.settings.target().to_string());
        let seen = self.session.version().next_value(target);
        self.session.interface().send_line(&Command::About.to_string()).await?;

        match tokio::time::timeout(self.settings.version_timeout, seen).await {
            Ok(version) => Ok(version),
            Err(_) => {
                let version = self.session.version().get();
                match &version {
                    Some(v) => info!("Firmware reports {}", v),
                    None => warn!("Timeout waiting for version"),
                }
                Ok(version)
            }
        }
    }

    async fn flash(&mut self) -> UpdateResult<()> {
        let session = self.session.clone();
        let interface = session.interface();
        session.set_decoding(false);

        let text = self.source.fetch(&self.settings.release).await?;
        let image = FirmwareImage::from_hex(&text)?;
        info!(
            "Firmware image has {} segment(s), {} bytes",
            image.segments().len(),
            image.total_bytes()
        );

        interface.disconnect().await?;
        interface.reset(true).await?;

        if let Err(e) = self.program_image(&image).await {
            if let Err(close_err) = self.programmer.close().await {
                debug!("Closing programmer after failure: {}", close_err);
            }
            return Err(e);
        }
        self.programmer.close().await?;

        interface.connect().await?;
        interface.reset(false).await?;
        // Only records from the freshly flashed firmware count as proof of life.
        session.outputting().set(false);
        session.set_decoding(true);
        info!("Done with flasher");
        Ok(())
    }

    async fn program_image(&mut self, image: &FirmwareImage) -> UpdateResult<()> {
        self.programmer.open().await?;
        self.programmer.handshake().await?;
        for (index, segment) in image.segments().iter().enumerate() {
            debug!(
                "Programming segment {}: {} bytes at 0x{:08x}",
                index,
                segment.data.len(),
                segment.address
            );
            self.programmer
                .program(segment.address, &segment.data)
                .await
                .map_err(|e| UpdateError::Segment {
                    index,
                    address: segment.address,
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }

    /// Turn on standby logging and wait for the first record.
    async fn verify(&mut self) -> UpdateResult<()> {
        self.enter(RecoveryState::RuntimeVerify);
        tokio::time::sleep(self.settings.boot_delay).await;

        let live = self.session.outputting().next_value(true);
        if self.session.outputting().get() {
            debug!("Telemetry already flowing, not toggling logging");
        } else {
            let response = self.session.quiet().await?;
            debug!("quiet -> {:?}", response.lines);
        }

        tokio::time::timeout(self.settings.verify_timeout, live)
            .await
            .map(|_| ())
            .map_err(|_| UpdateError::NotVerified(self.settings.verify_timeout))
    }
}
