//! Dispatch-path policy: throttling, retry classification, replica races.

pub mod race;
pub mod retry;
pub mod throttle;
