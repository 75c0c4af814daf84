//! # Lab Monitor Core Library
//!
//! Headless core of a laboratory environment monitor. Each enabled device is
//! polled by its own task; readings land in an in-memory [`TelemetryStore`]
//! for live views, are averaged over rolling windows and queued for batched
//! storage in a relational database. The HV crate and the networked PDU
//! accept control commands, and a safety interlock watches the fire, VOC and
//! UPS readings.
//!
//! ## Crate Structure
//!
//! - **`app`**: [`MonitorApp`], startup wiring and the ordered shutdown.
//! - **`config`**: [`MonitorConfig`], loaded once from TOML plus `LABMON_`
//!   environment variables and validated before use.
//! - **`control`**: control requests, the [`CommandDispatcher`] that hands
//!   them to the owning poller, and the [`CommandSink`] seam.
//! - **`error`**: [`MonitorError`], [`DeviceError`] and [`CommandError`].
//! - **`hardware`**: one capability trait per device family, the Modbus,
//!   serial and apcaccess drivers, mock drivers and the [`DriverRegistry`].
//! - **`logging`**: tracing subscriber setup.
//! - **`persistence`**: the persistence queue, schema and migrations, storage
//!   backends and the [`BatchPersistenceWriter`].
//! - **`pollers`**: the [`DevicePoller`] trait, the shared task loop and one
//!   poller per device family.
//! - **`safety`**: the NORMAL / WARNING / EMERGENCY interlock and the UPS
//!   shutdown latch.
//! - **`telemetry`**: ring buffers, the latest-value cache and decoded
//!   readings.
//!
//! [`TelemetryStore`]: telemetry::TelemetryStore
//! [`MonitorConfig`]: config::MonitorConfig
//! [`MonitorApp`]: app::MonitorApp
//! [`CommandDispatcher`]: control::CommandDispatcher
//! [`CommandSink`]: control::CommandSink
//! [`MonitorError`]: error::MonitorError
//! [`DeviceError`]: error::DeviceError
//! [`CommandError`]: error::CommandError
//! [`DriverRegistry`]: hardware::DriverRegistry
//! [`BatchPersistenceWriter`]: persistence::BatchPersistenceWriter
//! [`DevicePoller`]: pollers::DevicePoller

pub mod app;
pub mod config;
pub mod control;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod persistence;
pub mod pollers;
pub mod safety;
pub mod telemetry;
