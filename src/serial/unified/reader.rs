//! Line dispatcher and the single-slot command correlator
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};

use super::types::*;
use crate::device::models::TelemetryRecord;
use crate::serial::protocol::{decode_line, Command, LineEvent};
use crate::serial::{Result, SerialError, SerialInterface};
use crate::sync::{Gate, Watchdog};

const TELEMETRY_CAPACITY: usize = 256;

struct PendingCommand {
    command: String,
    matcher: ResponseMatcher,
    lines: Vec<String>,
    watchdog: Watchdog,
    idle_timeout: Duration,
    satisfied: bool,
}

/// Routes decoded lines to the version/telemetry gates, the telemetry
/// broadcast and the active command, if any.
pub struct LineRouter {
    version: Gate<Option<String>>,
    outputting: Gate<bool>,
    decoding: AtomicBool,
    pending: StdMutex<Option<PendingCommand>>,
    telemetry_tx: broadcast::Sender<TelemetryRecord>,
    metrics_tx: watch::Sender<MetricsSnapshot>,
}

impl Default for LineRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl LineRouter {
    /// Decoding starts disabled; lines are discarded until it is switched on.
    pub fn new() -> Self {
        let (telemetry_tx, _) = broadcast::channel(TELEMETRY_CAPACITY);
        let (metrics_tx, _) = watch::channel(MetricsSnapshot::default());
        Self {
            version: Gate::new(None),
            outputting: Gate::new(false),
            decoding: AtomicBool::new(false),
            pending: StdMutex::new(None),
            telemetry_tx,
            metrics_tx,
        }
    }

    /// Last firmware tag seen in a banner, e.g. `v0.5.2`.
    pub fn version(&self) -> &Gate<Option<String>> {
        &self.version
    }

    /// Flips to `true` on the first telemetry record after being cleared.
    pub fn outputting(&self) -> &Gate<bool> {
        &self.outputting
    }

    pub fn set_decoding(&self, enabled: bool) {
        let was = self.decoding.swap(enabled, Ordering::SeqCst);
        if was != enabled {
            log::debug!("Line decoding {}", if enabled { "enabled" } else { "disabled" });
        }
    }

    pub fn is_decoding(&self) -> bool {
        self.decoding.load(Ordering::SeqCst)
    }

    pub fn subscribe_telemetry(&self) -> broadcast::Receiver<TelemetryRecord> {
        self.telemetry_tx.subscribe()
    }

    pub fn metrics_receiver(&self) -> watch::Receiver<MetricsSnapshot> {
        self.metrics_tx.subscribe()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics_tx.borrow().clone()
    }

    pub fn has_pending_command(&self) -> bool {
        self.pending_slot().is_some()
    }

    /// Classify one line and hand it to whoever claims it.
    pub fn route(&self, line: &str) {
        self.metrics_tx.send_modify(|m| m.lines_read += 1);
        if !self.is_decoding() {
            self.metrics_tx.send_modify(|m| m.dropped_while_paused += 1);
            log::debug!("(paused) {}", line);
            return;
        }

        match decode_line(line) {
            LineEvent::Blank | LineEvent::Comment(_) => {}
            LineEvent::Telemetry(record) => {
                self.metrics_tx.send_modify(|m| m.telemetry_records += 1);
                if !self.outputting.set(true) {
                    log::info!("Telemetry is flowing");
                }
                // No subscribers is fine.
                let _ = self.telemetry_tx.send(record);
            }
            LineEvent::Malformed { line, reason } => {
                self.metrics_tx.send_modify(|m| m.malformed_lines += 1);
                log::debug!("Dropping telemetry line '{}': {}", line, reason);
            }
            LineEvent::Version(banner) => {
                log::info!("Found firmware version {}", banner.version);
                self.version.set(Some(banner.version));
            }
            LineEvent::Unclassified(text) => self.offer_to_pending(text),
        }
    }

    /// A command stops claiming lines as soon as its watchdog is done, even
    /// though the waiting caller may not have collected the slot yet.
    fn offer_to_pending(&self, line: String) {
        let mut slot = self.pending_slot();
        let Some(pending) = slot.as_mut().filter(|p| !p.watchdog.is_done()) else {
            drop(slot);
            self.metrics_tx.send_modify(|m| m.unclassified_lines += 1);
            log::debug!("<- {}", line);
            return;
        };
        log::debug!("<- [{}] {}", pending.command, line);
        pending.lines.push(line);
        if pending.matcher.is_complete(&pending.lines) {
            pending.satisfied = true;
            pending.watchdog.complete();
        } else if !pending.watchdog.restart_unless_done(pending.idle_timeout) {
            log::debug!("'{}' finished while its last line arrived", pending.command);
        }
    }

    /// Write `command` and collect the lines that follow until the matcher is
    /// satisfied or the link stays quiet for the idle timeout.
    ///
    /// Fails with [`SerialError::CommandInFlight`] while another command is
    /// still collecting its response.
    pub async fn send_command(
        &self,
        interface: &SerialInterface,
        command: &Command,
        spec: CommandSpec,
    ) -> Result<CommandResponse> {
        let text = command.to_string();
        let watchdog = {
            let mut slot = self.pending_slot();
            if let Some(active) = slot.as_ref() {
                log::warn!("Rejecting '{}' while '{}' is in flight", text, active.command);
                return Err(SerialError::CommandInFlight(text));
            }
            let watchdog = Watchdog::new(spec.initial_timeout, true, None);
            *slot = Some(PendingCommand {
                command: text.clone(),
                matcher: spec.matcher,
                lines: Vec::new(),
                watchdog: watchdog.clone(),
                idle_timeout: spec.idle_timeout,
                satisfied: false,
            });
            watchdog
        };
        let _guard = SlotGuard { router: self };

        let done = watchdog.done();
        interface.send_line(&text).await?;
        done.await;

        let pending = self
            .pending_slot()
            .take()
            .ok_or_else(|| SerialError::ProtocolError(format!("response slot for '{}' vanished", text)))?;

        let finished_reason = if pending.satisfied {
            FinishReason::MatcherSatisfied
        } else if pending.lines.is_empty() {
            FinishReason::NoResponse
        } else {
            FinishReason::Idle
        };
        self.metrics_tx.send_modify(|m| match finished_reason {
            FinishReason::MatcherSatisfied => m.command_completed += 1,
            FinishReason::Idle => m.command_idle_finished += 1,
            FinishReason::NoResponse => m.command_no_response += 1,
        });
        if finished_reason == FinishReason::NoResponse {
            log::debug!("No response to '{}'", text);
        }

        Ok(CommandResponse { lines: pending.lines, finished_reason })
    }

    fn pending_slot(&self) -> MutexGuard<'_, Option<PendingCommand>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Clears the command slot however the caller leaves `send_command`,
/// including when its future is dropped mid-wait.
struct SlotGuard<'a> {
    router: &'a LineRouter,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if let Some(pending) = self.router.pending_slot().take() {
            pending.watchdog.stop();
        }
    }
}

/// Feed every line from the transport into the router until the stream ends.
pub async fn reader_task(router: Arc<LineRouter>, mut lines: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = lines.recv().await {
        router.route(&line);
    }
    log::debug!("Line stream ended, dispatcher exiting");
}
