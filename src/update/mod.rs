pub mod image;
pub mod isp;
pub mod models;
pub mod recovery;
pub mod service;

pub use image::{FirmwareImage, HexError, Segment};
pub use isp::{LpcIsp, Programmer};
pub use models::{FirmwareRelease, UpdateError, UpdateResult};
pub use recovery::{FirmwareRecovery, RecoveryOutcome, RecoverySettings, RecoveryState};
pub use service::{FirmwareSource, UpdateService};
