pub mod reader;
pub mod types;

pub use reader::{reader_task, LineRouter};
pub use types::{
    CommandResponse, CommandSpec, CommandTimeouts, FinishReason, MetricsSnapshot, ResponseMatcher,
};
