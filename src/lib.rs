pub mod config;
pub mod device;
pub mod gpio;
pub mod serial;
pub mod sync;
pub mod update;

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;

use config::OvenConfig;
use device::DeviceSession;
use serial::{NativePortOpener, SerialInterface};
use update::{FirmwareRecovery, LpcIsp, RecoveryOutcome, RecoverySettings, UpdateService};

/// Bring the oven to the configured firmware, then log telemetry until Ctrl-C.
pub async fn run(config: OvenConfig) -> anyhow::Result<()> {
    let pins = gpio::create_pins(config.gpio.backend, config.gpio.assignment())
        .context("failed to claim control pins")?;
    let interface = SerialInterface::new(Box::new(NativePortOpener::new(&config.serial.path)), pins)
        .with_baud_rate(config.serial.runtime_baud)
        .with_reset_pulse(config.gpio.reset_pulse());
    let session = Arc::new(DeviceSession::open(interface, config.commands.timeouts()).await?);

    let programmer = LpcIsp::new(Box::new(NativePortOpener::new(&config.serial.path)))
        .with_baud_rate(config.serial.programming_baud)
        .with_crystal_khz(config.firmware.crystal_khz);
    let mut recovery = FirmwareRecovery::new(
        session.clone(),
        config.recovery.record_store(),
        Box::new(UpdateService::new()),
        Box::new(programmer),
        RecoverySettings::from_config(&config)?,
    );

    recover(&session, &mut recovery).await?;

    log::info!("Oven ready; streaming telemetry, press Ctrl-C to stop");
    let mut telemetry = session.subscribe_telemetry();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            record = telemetry.recv() => match record {
                Ok(record) => log::debug!("{}", record.to_csv_line()),
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Telemetry logger lagged, {} records skipped", skipped);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    session.close().await?;
    Ok(())
}

/// Run `recovery` once. On failure the session is closed and the recovery
/// error is returned; a failing close is only logged so it cannot mask it.
pub async fn recover(
    session: &DeviceSession,
    recovery: &mut FirmwareRecovery,
) -> anyhow::Result<RecoveryOutcome> {
    let mut outcome = recovery.run().await;
    let Some(error) = outcome.error.take() else {
        return Ok(outcome);
    };
    if let Err(e) = session.close().await {
        log::warn!("Closing session after failed recovery: {}", e);
    }
    Err(anyhow::Error::new(error).context("firmware recovery failed"))
}
