//! Driver capabilities, one per device family.
//!
//! Each family gets a small connector/handle pair:
//!
//! - the **connector** (`*Connector`) is the `Open(config)` half. It is cheap,
//!   `Send + Sync`, built once from configuration and kept by the poller so a
//!   dropped handle can be reopened on the next cycle;
//! - the **handle** (`AnalogTask`, `LineInstrument`, `RegisterBus`, `HvCrate`,
//!   `UpsSource`) is owned by exactly one poller and never shared.
//!
//! | Family | Connector | Handle | Built-in driver |
//! |--------|-----------|--------|-----------------|
//! | multi-channel analog DAQ | [`AnalogConnector`] | [`AnalogTask`] | registered by the embedding application |
//! | radon monitor, magnetometer | [`LineConnector`] | [`LineInstrument`] | serial line |
//! | TH/O2, fire, VOC, PDU | [`BusConnector`] | [`RegisterBus`] | Modbus RTU / TCP |
//! | HV crate | [`HvConnector`] | [`HvCrate`] | registered by the embedding application |
//! | UPS | [`UpsConnector`] | [`UpsSource`] | `apcaccess` |
//!
//! Async handles use `#[async_trait]`. The analog task is the exception: its
//! read blocks for a whole acquisition block, so it is a plain blocking trait
//! run on a blocking thread, and it hands out a [`TaskCloser`] that another
//! thread can use to force the read to return.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::DeviceResult;

// =============================================================================
// Analog acquisition
// =============================================================================

/// A module found on the acquisition bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaqModuleInfo {
    /// Serial number printed on the module.
    pub serial_number: u64,
    /// Driver-level device name used to build channel paths, e.g. `cDAQ1Mod2`.
    pub device_name: String,
}

/// Channels and rate of one continuous acquisition task.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionPlan {
    /// Full physical channel paths, e.g. `cDAQ1Mod1/ai0`.
    pub rtd_channels: Vec<String>,
    /// Voltage channel paths, read after the RTD channels.
    pub volt_channels: Vec<String>,
    /// Samples per second and channel.
    pub sampling_rate: u32,
}

impl AcquisitionPlan {
    /// Number of channels across both kinds.
    pub fn channel_count(&self) -> usize {
        self.rtd_channels.len() + self.volt_channels.len()
    }
}

/// Forces a blocked [`AnalogTask::read`] to return.
pub trait TaskCloser: Send + Sync {
    /// Close the task. Safe to call more than once.
    fn close(&self);
}

/// Running continuous-acquisition task.
pub trait AnalogTask: Send {
    /// Block until `samples_per_channel` samples are available for every channel.
    ///
    /// Returns one vector per channel, RTD channels first. After the task was
    /// closed this returns [`crate::error::DeviceError::Closed`].
    fn read(&mut self, samples_per_channel: usize) -> DeviceResult<Vec<Vec<f64>>>;

    /// Handle that closes this task from another thread.
    fn closer(&self) -> Arc<dyn TaskCloser>;
}

/// Opens acquisition tasks on the analog chassis.
pub trait AnalogConnector: Send + Sync {
    /// List the modules currently present.
    fn discover(&self) -> DeviceResult<Vec<DaqModuleInfo>>;

    /// Create and start a task for `plan`.
    fn open(&self, plan: &AcquisitionPlan) -> DeviceResult<Box<dyn AnalogTask>>;
}

// =============================================================================
// Line-oriented instruments (serial, SCPI)
// =============================================================================

/// Instrument speaking a newline-terminated text protocol.
#[async_trait]
pub trait LineInstrument: Send {
    /// Send `command` followed by the line terminator.
    async fn write_line(&mut self, command: &str) -> DeviceResult<()>;

    /// Read one line with the terminator stripped.
    async fn read_line(&mut self) -> DeviceResult<String>;

    /// Write `command` and read the reply line.
    async fn query(&mut self, command: &str) -> DeviceResult<String> {
        self.write_line(command).await?;
        self.read_line().await
    }
}

/// Opens a [`LineInstrument`] session.
#[async_trait]
pub trait LineConnector: Send + Sync {
    /// Open a session.
    async fn open(&self) -> DeviceResult<Box<dyn LineInstrument>>;
}

// =============================================================================
// Register buses (Modbus)
// =============================================================================

/// Modbus-style register access. `unit` is the slave/unit identifier.
#[async_trait]
pub trait RegisterBus: Send {
    /// Read `count` holding registers from `address`.
    async fn read_holding_registers(&mut self, unit: u8, address: u16, count: u16)
        -> DeviceResult<Vec<u16>>;

    /// Read `count` input registers from `address`.
    async fn read_input_registers(&mut self, unit: u8, address: u16, count: u16)
        -> DeviceResult<Vec<u16>>;

    /// Read `count` coils from `address`.
    async fn read_coils(&mut self, unit: u8, address: u16, count: u16) -> DeviceResult<Vec<bool>>;

    /// Set one coil.
    async fn write_coil(&mut self, unit: u8, address: u16, value: bool) -> DeviceResult<()>;
}

/// Opens a [`RegisterBus`] session.
#[async_trait]
pub trait BusConnector: Send + Sync {
    /// Open a session.
    async fn open(&self) -> DeviceResult<Box<dyn RegisterBus>>;
}

// =============================================================================
// HV crate
// =============================================================================

/// Value of a crate parameter. Parameter names are passed through untouched.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamValue {
    /// Floating-point parameter such as `VMon`.
    Float(f64),
    /// Integer parameter such as `Pw` or `Status`.
    Int(i64),
}

impl ParamValue {
    /// Value as a float.
    pub fn as_f64(self) -> f64 {
        match self {
            ParamValue::Float(v) => v,
            ParamValue::Int(v) => v as f64,
        }
    }

    /// Value rounded to an integer.
    pub fn as_i64(self) -> i64 {
        match self {
            ParamValue::Float(v) => v.round() as i64,
            ParamValue::Int(v) => v,
        }
    }
}

/// Channel parameter access on a high-voltage crate.
#[async_trait]
pub trait HvCrate: Send {
    /// One value per requested channel, in request order.
    async fn get_channel_param(
        &mut self,
        slot: u16,
        channels: &[u16],
        param: &str,
    ) -> DeviceResult<Vec<ParamValue>>;

    /// Write `value` to `param` on every listed channel.
    async fn set_channel_param(
        &mut self,
        slot: u16,
        channels: &[u16],
        param: &str,
        value: ParamValue,
    ) -> DeviceResult<()>;
}

/// Opens an [`HvCrate`] session.
#[async_trait]
pub trait HvConnector: Send + Sync {
    /// Open a session.
    async fn open(&self) -> DeviceResult<Box<dyn HvCrate>>;
}

// =============================================================================
// UPS
// =============================================================================

/// Source of UPS status reports.
#[async_trait]
pub trait UpsSource: Send {
    /// Raw `KEY : value` status report.
    async fn query_status(&mut self) -> DeviceResult<String>;
}

/// Opens an [`UpsSource`] session.
#[async_trait]
pub trait UpsConnector: Send + Sync {
    /// Open a session.
    async fn open(&self) -> DeviceResult<Box<dyn UpsSource>>;
}
