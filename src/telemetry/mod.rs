//! In-memory telemetry: bounded history per channel and the latest decoded
//! reading per device.
//!
//! - [`ring_buffer`]: arena-backed circular buffer with NaN gap marking
//! - [`store`]: [`TelemetryStore`], the lock-guarded collection of buffers plus the latest-value cache
//! - [`channels`]: channel keys, columns and capacities
//! - [`reading`]: decoded device readings

pub mod channels;
pub mod reading;
pub mod ring_buffer;
pub mod store;

pub use channels::{ChannelSpec, Resolution};
pub use reading::DeviceReading;
pub use ring_buffer::{RingBuffer, Snapshot};
pub use store::{epoch_seconds, LatestEntry, SeriesSnapshot, TelemetryStore};
