//! Command/response correlation types
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Decides when the lines collected for a command form a complete response.
///
/// Evaluated after every line; the firmware has no end-of-response marker, so
/// commands that cannot be recognised by content use `IdleOnly` and finish
/// when the link goes quiet.
#[derive(Debug, Clone)]
pub enum ResponseMatcher {
    UntilPrefix(&'static str),
    FixedLines(usize),
    Contains(&'static str),
    Custom(fn(&[String]) -> bool),
    IdleOnly,
}

impl ResponseMatcher {
    pub fn is_complete(&self, lines: &[String]) -> bool {
        match self {
            ResponseMatcher::UntilPrefix(p) => lines.iter().any(|l| l.starts_with(p)),
            ResponseMatcher::FixedLines(n) => lines.len() >= *n,
            ResponseMatcher::Contains(s) => lines.iter().any(|l| l.contains(s)),
            ResponseMatcher::Custom(f) => f(lines),
            ResponseMatcher::IdleOnly => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub matcher: ResponseMatcher,
    /// Wait for the first line.
    pub initial_timeout: Duration,
    /// Allowed silence between later lines.
    pub idle_timeout: Duration,
}

impl CommandSpec {
    pub fn new(matcher: ResponseMatcher, timeouts: CommandTimeouts) -> Self {
        Self {
            matcher,
            initial_timeout: timeouts.initial,
            idle_timeout: timeouts.idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandTimeouts {
    pub initial: Duration,
    pub idle: Duration,
}

impl Default for CommandTimeouts {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(1000),
            idle: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandResponse {
    pub lines: Vec<String>,
    pub finished_reason: FinishReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    MatcherSatisfied,
    /// Lines arrived, then the link went quiet.
    Idle,
    /// Nothing arrived before the initial timeout.
    NoResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub lines_read: u64,
    pub telemetry_records: u64,
    pub malformed_lines: u64,
    pub unclassified_lines: u64,
    pub dropped_while_paused: u64,
    pub command_completed: u64,
    pub command_idle_finished: u64,
    pub command_no_response: u64,
}
