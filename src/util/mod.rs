//! Small shared utilities.

pub mod clock;
pub mod telemetry;
