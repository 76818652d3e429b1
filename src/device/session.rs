use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::models::{SettingEntry, TelemetryRecord};
use crate::serial::protocol::{parse_indexed_line, Command};
use crate::serial::unified::{
    reader_task, CommandResponse, CommandSpec, CommandTimeouts, LineRouter, MetricsSnapshot,
    ResponseMatcher,
};
use crate::serial::{Result, SerialError, SerialInterface};
use crate::sync::Gate;

/// Everything that belongs to one connected oven: transport, pins, the line
/// dispatcher, its gates and the command slot.
pub struct DeviceSession {
    interface: Arc<SerialInterface>,
    router: Arc<LineRouter>,
    dispatcher: StdMutex<Option<JoinHandle<()>>>,
    timeouts: CommandTimeouts,
}

impl DeviceSession {
    /// Claim the interface's line stream, start the dispatcher and connect.
    pub async fn open(interface: SerialInterface, timeouts: CommandTimeouts) -> Result<Self> {
        let lines = interface
            .take_lines()
            .ok_or_else(|| SerialError::ConnectionFailed("line stream already claimed".into()))?;
        let interface = Arc::new(interface);
        let router = Arc::new(LineRouter::new());
        let dispatcher = tokio::spawn(reader_task(router.clone(), lines));

        let session = Self {
            interface,
            router,
            dispatcher: StdMutex::new(Some(dispatcher)),
            timeouts,
        };
        session.interface.connect().await?;
        log::info!("Session open on {}", session.interface.describe());
        Ok(session)
    }

    pub fn interface(&self) -> &SerialInterface {
        &self.interface
    }

    pub fn router(&self) -> &LineRouter {
        &self.router
    }

    pub fn version(&self) -> &Gate<Option<String>> {
        self.router.version()
    }

    pub fn outputting(&self) -> &Gate<bool> {
        self.router.outputting()
    }

    pub fn set_decoding(&self, enabled: bool) {
        self.router.set_decoding(enabled);
    }

    pub fn subscribe_telemetry(&self) -> broadcast::Receiver<TelemetryRecord> {
        self.router.subscribe_telemetry()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.router.metrics()
    }

    pub fn timeouts(&self) -> CommandTimeouts {
        self.timeouts
    }

    pub async fn send_command_get_response(
        &self,
        command: &Command,
        spec: CommandSpec,
    ) -> Result<CommandResponse> {
        self.router.send_command(&self.interface, command, spec).await
    }

    async fn send_with(&self, command: Command, matcher: ResponseMatcher) -> Result<CommandResponse> {
        let spec = CommandSpec::new(matcher, self.timeouts);
        self.send_command_get_response(&command, spec).await
    }

    /// The banner in the reply updates [`DeviceSession::version`]; the
    /// remaining lines are returned.
    pub async fn about(&self) -> Result<CommandResponse> {
        self.send_with(Command::About, ResponseMatcher::IdleOnly).await
    }

    pub async fn help(&self) -> Result<CommandResponse> {
        self.send_with(Command::Help, ResponseMatcher::IdleOnly).await
    }

    pub async fn values(&self) -> Result<CommandResponse> {
        self.send_with(Command::Values, ResponseMatcher::Contains("Cold junction"))
            .await
    }

    /// Toggle periodic telemetry while in standby.
    pub async fn quiet(&self) -> Result<CommandResponse> {
        self.send_with(Command::Quiet, ResponseMatcher::Contains("standby logging"))
            .await
    }

    pub async fn reflow(&self) -> Result<CommandResponse> {
        self.send_with(Command::Reflow, ResponseMatcher::IdleOnly).await
    }

    pub async fn stop(&self) -> Result<CommandResponse> {
        self.send_with(Command::Stop, ResponseMatcher::IdleOnly).await
    }

    pub async fn bake(&self, setpoint: u32, seconds: Option<u32>) -> Result<CommandResponse> {
        self.send_with(Command::Bake { setpoint, seconds }, ResponseMatcher::IdleOnly)
            .await
    }

    pub async fn set_setting(&self, id: u32, value: f64) -> Result<CommandResponse> {
        self.send_with(Command::Setting { id, value }, ResponseMatcher::IdleOnly)
            .await
    }

    pub async fn select_profile(&self, id: u32) -> Result<CommandResponse> {
        self.send_with(Command::SelectProfile(id), ResponseMatcher::IdleOnly)
            .await
    }

    /// Profile names in index order.
    pub async fn list_profiles(&self) -> Result<Vec<String>> {
        let response = self.send_with(Command::ListProfiles, ResponseMatcher::IdleOnly).await?;
        Ok(collect_indexed(&response.lines, "profile", |name| {
            Some(name.to_string())
        }))
    }

    /// Settings in index order, each split into description and value.
    pub async fn list_settings(&self) -> Result<Vec<SettingEntry>> {
        let response = self.send_with(Command::ListSettings, ResponseMatcher::IdleOnly).await?;
        Ok(collect_indexed(&response.lines, "setting", SettingEntry::parse))
    }

    /// Stop dispatching and release the port.
    pub async fn close(&self) -> Result<()> {
        self.router.set_decoding(false);
        if let Some(task) = self.dispatcher_slot().take() {
            task.abort();
        }
        self.interface.disconnect().await?;
        log::info!("Session closed");
        Ok(())
    }

    fn dispatcher_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        if let Some(task) = self.dispatcher_slot().take() {
            task.abort();
        }
    }
}

/// Gather `N: text` lines, warning when indices are not 0, 1, 2, ...
/// Lines without an index (headers, blank separators) are skipped.
fn collect_indexed<T>(lines: &[String], what: &str, parse: impl Fn(&str) -> Option<T>) -> Vec<T> {
    let mut items = Vec::new();
    for line in lines {
        let Some((index, text)) = parse_indexed_line(line) else {
            continue;
        };
        if index != items.len() {
            log::warn!("Expected {} index {} but got {}", what, items.len(), index);
        }
        match parse(text) {
            Some(item) => items.push(item),
            None => log::warn!("Unparseable {} line '{}'", what, line),
        }
    }
    items
}
