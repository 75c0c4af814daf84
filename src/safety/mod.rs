//! Fire, toxic gas and power-loss interlock.
//!
//! - [`interlock`]: the phase state machine and the UPS latch
//! - [`monitor`]: the task that feeds it from the latest-value cache

pub mod interlock;
pub mod monitor;

pub use interlock::{hazard_phase, shutdown_requests, SafetyInterlock, SafetyPhase, SafetyReport};
pub use monitor::{SafetyMonitor, SAFETY_INPUTS};
