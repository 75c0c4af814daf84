//! Hardware layer: driver capability traits, built-in drivers and mocks.
//!
//! - [`capabilities`]: one connector/handle trait pair per device family
//! - [`registry`]: [`DeviceKind`] and the [`DriverRegistry`] pollers open devices through
//! - [`modbus`]: Modbus TCP/RTU register buses
//! - [`serial_line`]: line-oriented serial instruments (`instrument_serial` feature)
//! - [`apcaccess`]: UPS status from apcupsd
//! - [`mock`]: simulated drivers for every family

pub mod apcaccess;
pub mod capabilities;
pub mod mock;
pub mod modbus;
pub mod registry;
#[cfg(feature = "instrument_serial")]
pub mod serial_line;

pub use capabilities::{
    AcquisitionPlan, AnalogConnector, AnalogTask, BusConnector, DaqModuleInfo, HvConnector,
    HvCrate, LineConnector, LineInstrument, ParamValue, RegisterBus, TaskCloser, UpsConnector,
    UpsSource,
};
pub use registry::{DeviceKind, DriverFactory, DriverRegistry};
