mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FakeOven, TARGET};
use toaster_lib::device::DeviceSession;
use toaster_lib::serial::protocol::Command;
use toaster_lib::serial::unified::{CommandSpec, CommandTimeouts, FinishReason, ResponseMatcher};
use toaster_lib::serial::SerialError;

async fn open_session(oven: &Arc<FakeOven>) -> Arc<DeviceSession> {
    let session = DeviceSession::open(common::interface_for(oven), CommandTimeouts::default())
        .await
        .unwrap();
    session.set_decoding(true);
    Arc::new(session)
}

#[tokio::test(start_paused = true)]
async fn list_profiles_in_index_order() {
    let oven = FakeOven::new(TARGET);
    let session = open_session(&oven).await;

    let profiles = session.list_profiles().await.unwrap();
    assert_eq!(profiles, vec!["SYNTECH_LF", "NC31", "CUSTOM #1"]);
    assert_eq!(oven.received(), vec!["list profiles"]);
    assert_eq!(session.metrics().command_idle_finished, 1);
}

#[tokio::test(start_paused = true)]
async fn list_settings_splits_comment_and_value() {
    let oven = FakeOven::new(TARGET);
    let session = open_session(&oven).await;

    let settings = session.list_settings().await.unwrap();
    assert_eq!(settings.len(), 2);
    assert_eq!(settings[0].comment, "Heater cycles");
    assert_eq!(settings[0].value, "20");
    assert_eq!(settings[1].comment, "Min fan speed");
    assert_eq!(settings[1].numeric_value(), Some(8.0));
}

#[tokio::test(start_paused = true)]
async fn matcher_completes_without_waiting_for_idle() {
    let oven = FakeOven::new(TARGET);
    let session = open_session(&oven).await;

    let spec = CommandSpec {
        matcher: ResponseMatcher::UntilPrefix("Toggled"),
        initial_timeout: Duration::from_secs(1),
        idle_timeout: Duration::from_secs(30),
    };
    let started = tokio::time::Instant::now();
    let response = session.send_command_get_response(&Command::Quiet, spec).await.unwrap();

    assert_eq!(response.finished_reason, FinishReason::MatcherSatisfied);
    assert_eq!(response.lines, vec!["Toggled standby logging"]);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(oven.logging());
}

#[tokio::test(start_paused = true)]
async fn about_feeds_version_gate_and_returns_the_rest() {
    let oven = FakeOven::new(TARGET);
    let session = open_session(&oven).await;

    let response = session.about().await.unwrap();
    assert_eq!(response.finished_reason, FinishReason::Idle);
    assert_eq!(session.version().get().as_deref(), Some(TARGET));
    assert!(response.lines.iter().all(|l| !l.contains("firmware (v")));
    assert_eq!(response.lines.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn silent_command_reports_no_response() {
    let oven = FakeOven::new(TARGET);
    let session = open_session(&oven).await;

    let started = tokio::time::Instant::now();
    let response = session.reflow().await.unwrap();
    assert_eq!(response.finished_reason, FinishReason::NoResponse);
    assert!(response.lines.is_empty());
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(session.metrics().command_no_response, 1);
}

#[tokio::test(start_paused = true)]
async fn second_command_fails_fast_while_first_is_pending() {
    let oven = FakeOven::new(TARGET);
    let session = open_session(&oven).await;

    let first = tokio::spawn({
        let session = session.clone();
        async move { session.reflow().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(session.router().has_pending_command());

    let started = tokio::time::Instant::now();
    let second = session.list_profiles().await;
    assert!(matches!(second, Err(SerialError::CommandInFlight(ref c)) if c == "list profiles"));
    assert_eq!(started.elapsed(), Duration::ZERO);

    let first = first.await.unwrap().unwrap();
    assert_eq!(first.finished_reason, FinishReason::NoResponse);
    assert_eq!(oven.received(), vec!["reflow"]);

    // Slot is free again.
    assert_eq!(session.list_profiles().await.unwrap().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn abandoned_wait_frees_the_slot() {
    let oven = FakeOven::new(TARGET);
    let session = open_session(&oven).await;

    let abandoned = tokio::time::timeout(Duration::from_millis(50), session.reflow()).await;
    assert!(abandoned.is_err());
    assert!(!session.router().has_pending_command());

    let response = session.quiet().await.unwrap();
    assert_eq!(response.finished_reason, FinishReason::MatcherSatisfied);
}

#[tokio::test(start_paused = true)]
async fn telemetry_bypasses_the_active_matcher() {
    let oven = FakeOven::new(TARGET);
    oven.set_logging(true);
    let session = open_session(&oven).await;
    let mut telemetry = session.subscribe_telemetry();

    let response = session.values().await.unwrap();
    assert_eq!(response.finished_reason, FinishReason::MatcherSatisfied);
    assert!(response.lines.iter().all(|l| !l.contains("STANDBY")));

    let record = telemetry.recv().await.unwrap();
    assert_eq!(record.setpoint, 50.0);
    assert!(session.outputting().get());
}

#[tokio::test(start_paused = true)]
async fn paused_decoding_drops_responses() {
    let oven = FakeOven::new(TARGET);
    let session = open_session(&oven).await;
    session.set_decoding(false);

    let response = session.help().await.unwrap();
    assert_eq!(response.finished_reason, FinishReason::NoResponse);
    assert!(session.metrics().dropped_while_paused >= 2);
}

#[tokio::test(start_paused = true)]
async fn lines_after_completion_are_left_unclaimed() {
    let oven = FakeOven::new(TARGET);
    let session = open_session(&oven).await;

    let spec = CommandSpec {
        matcher: ResponseMatcher::Contains("Left"),
        initial_timeout: Duration::from_secs(1),
        idle_timeout: Duration::from_millis(250),
    };
    let response = session.send_command_get_response(&Command::Values, spec).await.unwrap();
    assert_eq!(response.finished_reason, FinishReason::MatcherSatisfied);
    assert_eq!(response.lines, vec!["Sensor values:", "         Left: 31.0degC"]);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(session.metrics().unclassified_lines, 2);
    assert!(!session.router().has_pending_command());
}

#[tokio::test(start_paused = true)]
async fn custom_matcher_is_not_rearmed_after_idle_finish() {
    let oven = FakeOven::new(TARGET);
    let session = open_session(&oven).await;

    let spec = CommandSpec {
        matcher: ResponseMatcher::Custom(|lines| lines.len() > 10),
        initial_timeout: Duration::from_secs(1),
        idle_timeout: Duration::from_millis(100),
    };
    let started = tokio::time::Instant::now();
    let pending = tokio::spawn({
        let session = session.clone();
        async move { session.send_command_get_response(&Command::Help, spec).await }
    });
    tokio::time::sleep(Duration::from_millis(150)).await;
    // The idle timeout has fired; late chatter must not extend the wait.
    oven.emit("late line");
    let response = pending.await.unwrap().unwrap();

    assert_eq!(response.finished_reason, FinishReason::Idle);
    assert_eq!(response.lines.len(), 2);
    assert!(started.elapsed() < Duration::from_millis(200));
}
