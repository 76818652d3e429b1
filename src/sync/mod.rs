//! Small async coordination primitives shared by the serial session and the
//! firmware recovery sequence.
pub mod gate;
pub mod watchdog;

pub use gate::Gate;
pub use watchdog::{ArmOptions, Watchdog, WatchdogState};
