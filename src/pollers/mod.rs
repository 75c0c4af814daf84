//! Device pollers.
//!
//! Every device family implements [`DevicePoller`]; the shared
//! [`runner::PollerRunner`] drives it: startup attempts, the poll cadence,
//! backoff and cooldown, reconnects, control requests and cooperative stop.
//! The family modules only decode readings and decide what to publish.
//!
//! Each successful poll does two independent things:
//!
//! - **Dashboard path**: the decoded reading goes into the latest-value cache
//!   and out as a [`DashboardEvent`] with [`EventStage::Raw`]. Once the
//!   family's [`window::RollingWindow`] fills, its mean is written to the ring
//!   buffer and sent as [`EventStage::Averaged`].
//! - **Storage path**: the raw sample that completed the window is queued for
//!   the batch writer. Storage keeps an instantaneous reading, not the mean.
//!
//! | Module | Device |
//! |--------|--------|
//! | [`analog`] | multi-channel analog DAQ (RTD + distance) |
//! | [`radon`] | radon monitor |
//! | [`magnetometer`] | three-axis fluxgate |
//! | [`modbus_sensors`] | TH/O2 transmitter, fire detector, VOC detector |
//! | [`ups`] | UPS through `apcaccess` |
//! | [`hv`] | HV crate |
//! | [`pdu`] | networked power distribution unit |

pub mod analog;
pub mod hv;
pub mod magnetometer;
pub mod modbus_sensors;
pub mod pdu;
pub mod radon;
pub mod runner;
pub mod ups;
pub mod window;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::config::MonitorConfig;
use crate::control::command::{CommandOutcome, CommandRequest, Scope, Setpoints};
use crate::error::{AppResult, CommandError, DeviceResult, MonitorError};
use crate::hardware::{DeviceKind, DriverFactory, DriverRegistry};
use crate::persistence::{PersistenceItem, PersistenceSender};
use crate::telemetry::{epoch_seconds, DeviceReading, TelemetryStore};

pub use runner::{spawn_poller, ControlMessage, ErrorPolicy, PollerHandle, StopSignal};
pub use window::RollingWindow;

/// Capacity of the dashboard event channel.
pub const EVENT_CAPACITY: usize = 256;

/// Whether an event carries a raw sample or a window mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStage {
    /// Every decoded sample.
    Raw,
    /// Mean of a full rolling window.
    Averaged,
}

/// Live update for dashboards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardEvent {
    /// Source device.
    pub device: DeviceKind,
    /// Raw or averaged.
    pub stage: EventStage,
    /// Time of the sample.
    pub timestamp: DateTime<Local>,
    /// Decoded sample or window mean.
    pub reading: DeviceReading,
}

/// Shared collaborators of one poller.
#[derive(Clone)]
pub struct PollContext {
    /// Ring buffers and latest readings.
    pub store: Arc<TelemetryStore>,
    /// `None` when persistence is disabled.
    pub persistence: Option<PersistenceSender>,
    /// Dashboard event channel.
    pub events: broadcast::Sender<DashboardEvent>,
    /// Stop signal of the owning runner.
    pub stop: StopSignal,
}

impl PollContext {
    /// Context with a fresh stop signal.
    pub fn new(
        store: Arc<TelemetryStore>,
        persistence: Option<PersistenceSender>,
        events: broadcast::Sender<DashboardEvent>,
    ) -> Self {
        Self {
            store,
            persistence,
            events,
            stop: StopSignal::new(),
        }
    }

    /// Same collaborators, fresh stop signal. Used once per spawned poller.
    pub fn for_poller(&self) -> Self {
        Self {
            stop: StopSignal::new(),
            ..self.clone()
        }
    }

    /// Cache the reading and send it to dashboards.
    pub fn publish_raw(&self, device: DeviceKind, timestamp: DateTime<Local>, reading: DeviceReading) {
        self.store.update_latest(device, reading.clone());
        self.emit(device, EventStage::Raw, timestamp, reading);
    }

    /// Append a window mean to `channel` and send it to dashboards.
    pub fn publish_average(
        &self,
        device: DeviceKind,
        channel: &str,
        timestamp: DateTime<Local>,
        values: &[f64],
        reading: DeviceReading,
    ) {
        if let Err(err) = self
            .store
            .update_channel(channel, epoch_seconds(timestamp), values)
        {
            warn!(device = %device, channel, error = %err, "Ring buffer update failed");
        }
        self.emit(device, EventStage::Averaged, timestamp, reading);
    }

    /// Queue one item for the batch writer. Dropped when persistence is off.
    pub fn persist(&self, item: PersistenceItem) {
        let Some(queue) = &self.persistence else {
            return;
        };
        let kind = item.kind;
        if !queue.push(item) {
            warn!(kind = %kind, "Persistence queue closed, sample dropped");
        }
    }

    fn emit(
        &self,
        device: DeviceKind,
        stage: EventStage,
        timestamp: DateTime<Local>,
        reading: DeviceReading,
    ) {
        let event = DashboardEvent {
            device,
            stage,
            timestamp,
            reading,
        };
        // No subscriber is fine.
        if self.events.send(event).is_err() {
            debug!(device = %device, "No dashboard subscribers");
        }
    }
}

/// One device family's acquisition and control.
///
/// All methods are called from the poller's own task only.
#[async_trait]
pub trait DevicePoller: Send {
    /// Device this poller drives.
    fn kind(&self) -> DeviceKind;

    /// Pause between the start of two polls. Zero for pollers whose read
    /// blocks for the whole cycle.
    fn poll_interval(&self) -> Duration;

    /// Whether a device handle is open.
    fn is_connected(&self) -> bool;

    /// Whether commands are tried while the last poll left the device
    /// disconnected. Pollers that open a session per command return true.
    fn accepts_commands_offline(&self) -> bool {
        false
    }

    /// Open the device handle.
    async fn connect(&mut self, ctx: &PollContext) -> DeviceResult<()>;

    /// One acquisition: read, decode, publish.
    async fn poll_once(&mut self, ctx: &PollContext) -> DeviceResult<()>;

    /// Drop the device handle. Idempotent.
    async fn disconnect(&mut self);

    /// Run a control request. Unsupported by default.
    async fn execute(&mut self, request: &CommandRequest) -> Result<CommandOutcome, CommandError> {
        Err(CommandError::Unsupported {
            device: self.kind().label().to_string(),
            action: request.action.name().to_string(),
        })
    }

    /// Current setpoints of `scope`. Unsupported by default.
    async fn fetch_setpoints(&mut self, _scope: &Scope) -> Result<Setpoints, CommandError> {
        Err(CommandError::Unsupported {
            device: self.kind().label().to_string(),
            action: "fetch_setpoints".to_string(),
        })
    }

    /// Ring-buffer channels marked with a gap when the poller pauses.
    fn gap_channels(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Build the poller of `kind` from its configuration and registered driver.
pub fn build_poller(
    kind: DeviceKind,
    config: &MonitorConfig,
    registry: &DriverRegistry,
) -> AppResult<Box<dyn DevicePoller>> {
    let factory = registry
        .get(kind)
        .ok_or_else(|| MonitorError::DriverMissing(kind.to_string()))?;

    let poller: Box<dyn DevicePoller> = match (kind, factory) {
        (DeviceKind::Daq, DriverFactory::Analog(connector)) => Box::new(
            analog::AnalogPoller::new(config.daq.clone(), connector.clone()),
        ),
        (DeviceKind::Radon, DriverFactory::Line(connector)) => Box::new(
            radon::RadonPoller::new(config.radon.clone(), connector.clone()),
        ),
        (DeviceKind::Magnetometer, DriverFactory::Line(connector)) => Box::new(
            magnetometer::MagnetometerPoller::new(config.magnetometer.clone(), connector.clone()),
        ),
        (DeviceKind::ThO2, DriverFactory::Bus(connector)) => Box::new(
            modbus_sensors::ModbusSensorPoller::new(
                modbus_sensors::SensorProfile::th_o2(&config.th_o2),
                connector.clone(),
            ),
        ),
        (DeviceKind::Fire, DriverFactory::Bus(connector)) => Box::new(
            modbus_sensors::ModbusSensorPoller::new(
                modbus_sensors::SensorProfile::fire(&config.fire),
                connector.clone(),
            ),
        ),
        (DeviceKind::Voc, DriverFactory::Bus(connector)) => Box::new(
            modbus_sensors::ModbusSensorPoller::new(
                modbus_sensors::SensorProfile::voc(&config.voc),
                connector.clone(),
            ),
        ),
        (DeviceKind::Ups, DriverFactory::Ups(connector)) => {
            Box::new(ups::UpsPoller::new(config.ups.clone(), connector.clone()))
        }
        (DeviceKind::CaenHv, DriverFactory::Hv(connector)) => {
            Box::new(hv::HvPoller::new(config.caen_hv.clone(), connector.clone()))
        }
        (DeviceKind::Pdu, DriverFactory::Bus(connector)) => {
            Box::new(pdu::PduPoller::new(config.pdu.clone(), connector.clone()))
        }
        (kind, factory) => {
            return Err(MonitorError::DriverMissing(format!(
                "{kind} (registered driver is '{}')",
                factory.capability()
            )))
        }
    };
    Ok(poller)
}
