//! Driver Registry
//!
//! Static mapping from device name to the connector that opens it. Pollers
//! never look drivers up by reflection: the application builds one
//! [`DriverRegistry`] at startup and each poller asks it for the connector of
//! its family.
//!
//! # Built-in drivers
//!
//! | Device | Driver |
//! |--------|--------|
//! | `pdu` | Modbus TCP |
//! | `th_o2`, `fire`, `voc` | Modbus RTU (`instrument_serial` feature) |
//! | `radon` | serial line (`instrument_serial` feature) |
//! | `ups` | `apcaccess` subprocess |
//! | `daq`, `magnetometer`, `caen_hv` | none, registered by the embedding application |
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use lab_monitor::hardware::registry::{DriverFactory, DriverRegistry};
//! use lab_monitor::hardware::DeviceKind;
//!
//! let mut registry = DriverRegistry::with_builtin(&config);
//! registry.register(DeviceKind::CaenHv, DriverFactory::Hv(Arc::new(MyCaenBinding::new())));
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{seconds, MonitorConfig};
use crate::hardware::apcaccess::ApcAccessConnector;
use crate::hardware::capabilities::{
    AnalogConnector, BusConnector, DaqModuleInfo, HvConnector, LineConnector, UpsConnector,
};
use crate::hardware::mock::{
    MockAnalogConnector, MockBusConnector, MockHvConnector, MockLineConnector, MockUpsConnector,
};
use crate::hardware::modbus::ModbusTcpConnector;

// =============================================================================
// Device Identification
// =============================================================================

/// Every device family the monitor knows how to poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Analog acquisition chassis.
    Daq,
    /// Radon monitor.
    Radon,
    /// Fluxgate magnetometer.
    Magnetometer,
    /// Temperature, humidity and oxygen transmitter.
    ThO2,
    /// Fire detector panel.
    Fire,
    /// VOC transmitter.
    Voc,
    /// Uninterruptible power supply.
    Ups,
    /// High-voltage crate.
    CaenHv,
    /// Power distribution unit.
    Pdu,
}

impl DeviceKind {
    /// Every device, in display order.
    pub const ALL: [DeviceKind; 9] = [
        DeviceKind::Daq,
        DeviceKind::Radon,
        DeviceKind::Magnetometer,
        DeviceKind::ThO2,
        DeviceKind::Fire,
        DeviceKind::Voc,
        DeviceKind::Ups,
        DeviceKind::CaenHv,
        DeviceKind::Pdu,
    ];

    /// Configuration section name, also used in logs.
    pub fn name(self) -> &'static str {
        match self {
            DeviceKind::Daq => "daq",
            DeviceKind::Radon => "radon",
            DeviceKind::Magnetometer => "magnetometer",
            DeviceKind::ThO2 => "th_o2",
            DeviceKind::Fire => "fire",
            DeviceKind::Voc => "voc",
            DeviceKind::Ups => "ups",
            DeviceKind::CaenHv => "caen_hv",
            DeviceKind::Pdu => "pdu",
        }
    }

    /// Short name used in operator messages.
    pub fn label(self) -> &'static str {
        match self {
            DeviceKind::Daq => "DAQ",
            DeviceKind::Radon => "Radon",
            DeviceKind::Magnetometer => "Magnetometer",
            DeviceKind::ThO2 => "TH/O2",
            DeviceKind::Fire => "Fire detector",
            DeviceKind::Voc => "VOC detector",
            DeviceKind::Ups => "UPS",
            DeviceKind::CaenHv => "HV",
            DeviceKind::Pdu => "PDU",
        }
    }

    /// Device whose [`DeviceKind::name`] is `name`.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Whether the device accepts control requests.
    pub fn is_controllable(self) -> bool {
        matches!(self, DeviceKind::CaenHv | DeviceKind::Pdu)
    }

    /// `enabled` flag of the device's configuration section.
    pub fn is_enabled(self, config: &MonitorConfig) -> bool {
        match self {
            DeviceKind::Daq => config.daq.enabled,
            DeviceKind::Radon => config.radon.enabled,
            DeviceKind::Magnetometer => config.magnetometer.enabled,
            DeviceKind::ThO2 => config.th_o2.enabled,
            DeviceKind::Fire => config.fire.enabled,
            DeviceKind::Voc => config.voc.enabled,
            DeviceKind::Ups => config.ups.enabled,
            DeviceKind::CaenHv => config.caen_hv.enabled,
            DeviceKind::Pdu => config.pdu.enabled,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Driver Factories
// =============================================================================

/// Connector for one device, tagged by capability.
#[derive(Clone)]
pub enum DriverFactory {
    /// Analog acquisition.
    Analog(Arc<dyn AnalogConnector>),
    /// Line-oriented text instrument.
    Line(Arc<dyn LineConnector>),
    /// Modbus register bus.
    Bus(Arc<dyn BusConnector>),
    /// HV crate.
    Hv(Arc<dyn HvConnector>),
    /// UPS status source.
    Ups(Arc<dyn UpsConnector>),
}

impl DriverFactory {
    /// Short capability label for logs.
    pub fn capability(&self) -> &'static str {
        match self {
            DriverFactory::Analog(_) => "analog",
            DriverFactory::Line(_) => "line",
            DriverFactory::Bus(_) => "bus",
            DriverFactory::Hv(_) => "hv",
            DriverFactory::Ups(_) => "ups",
        }
    }
}

impl fmt::Debug for DriverFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DriverFactory::{}", self.capability())
    }
}

// =============================================================================
// DriverRegistry
// =============================================================================

/// Connectors keyed by device.
#[derive(Debug, Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<DeviceKind, DriverFactory>,
}

impl DriverRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the drivers shipped with this crate for every enabled device.
    pub fn with_builtin(config: &MonitorConfig) -> Self {
        let mut registry = Self::new();

        if config.pdu.enabled {
            registry.register(
                DeviceKind::Pdu,
                DriverFactory::Bus(Arc::new(ModbusTcpConnector::new(
                    config.pdu.ip_address.clone(),
                    config.pdu.port,
                    seconds(config.pdu.timeout_s),
                ))),
            );
        }

        if config.ups.enabled {
            registry.register(
                DeviceKind::Ups,
                DriverFactory::Ups(Arc::new(ApcAccessConnector::new(
                    config.ups.command.clone(),
                    config.ups.host.clone(),
                    Duration::from_secs(5),
                ))),
            );
        }

        #[cfg(feature = "instrument_serial")]
        {
            use crate::hardware::modbus::ModbusRtuConnector;
            use crate::hardware::serial_line::SerialLineConnector;

            let serial_timeout = Duration::from_secs(1);
            if config.th_o2.enabled {
                registry.register(
                    DeviceKind::ThO2,
                    DriverFactory::Bus(Arc::new(ModbusRtuConnector::new(
                        config.th_o2.port.clone(),
                        config.th_o2.baudrate,
                        serial_timeout,
                    ))),
                );
            }
            if config.fire.enabled {
                registry.register(
                    DeviceKind::Fire,
                    DriverFactory::Bus(Arc::new(ModbusRtuConnector::new(
                        config.fire.port.clone(),
                        config.fire.baudrate,
                        serial_timeout,
                    ))),
                );
            }
            if config.voc.enabled {
                registry.register(
                    DeviceKind::Voc,
                    DriverFactory::Bus(Arc::new(ModbusRtuConnector::new(
                        config.voc.port.clone(),
                        config.voc.baudrate,
                        serial_timeout,
                    ))),
                );
            }
            if config.radon.enabled {
                registry.register(
                    DeviceKind::Radon,
                    DriverFactory::Line(Arc::new(SerialLineConnector::new(
                        config.radon.port.clone(),
                        config.radon.baudrate,
                        Duration::from_secs(2),
                    ))),
                );
            }
        }

        registry
    }

    /// Mock drivers for every device family, with plausible readings.
    pub fn simulated(config: &MonitorConfig) -> Self {
        let mut registry = Self::new();

        let modules = config
            .daq
            .modules
            .iter()
            .enumerate()
            .filter_map(|(index, module)| {
                crate::config::parse_serial_number(&module.serial_number).map(|serial_number| {
                    DaqModuleInfo {
                        serial_number,
                        device_name: format!("SimDAQ1Mod{}", index + 1),
                    }
                })
            })
            .collect();
        let analog = MockAnalogConnector::new(modules, Duration::from_secs(1));
        analog.set_levels(vec![22.4, 22.9, 2.5, 3.1]);
        registry.register(DeviceKind::Daq, DriverFactory::Analog(Arc::new(analog)));

        registry.register(
            DeviceKind::Radon,
            DriverFactory::Line(Arc::new(MockLineConnector::radon(18.5, 2.1))),
        );
        registry.register(
            DeviceKind::Magnetometer,
            DriverFactory::Line(Arc::new(MockLineConnector::magnetometer(
                2.1e-5, -0.4e-5, 4.3e-5,
            ))),
        );
        registry.register(
            DeviceKind::ThO2,
            DriverFactory::Bus(Arc::new(MockBusConnector::th_o2(config.th_o2.modbus_id))),
        );
        registry.register(
            DeviceKind::Fire,
            DriverFactory::Bus(Arc::new(MockBusConnector::fire_detector(
                config.fire.slave_id,
            ))),
        );
        registry.register(
            DeviceKind::Voc,
            DriverFactory::Bus(Arc::new(MockBusConnector::voc_detector(
                config.voc.slave_id,
                0.8,
                config.voc.scale_factor,
            ))),
        );
        registry.register(
            DeviceKind::Ups,
            DriverFactory::Ups(Arc::new(MockUpsConnector::online())),
        );
        registry.register(
            DeviceKind::CaenHv,
            DriverFactory::Hv(Arc::new(MockHvConnector::new(&config.caen_hv.slots()))),
        );
        registry.register(
            DeviceKind::Pdu,
            DriverFactory::Bus(Arc::new(MockBusConnector::netio_pdu(
                config.pdu.unit_id,
                config.pdu.port_count,
            ))),
        );

        registry
    }

    /// Add or replace the driver of a device.
    pub fn register(&mut self, kind: DeviceKind, factory: DriverFactory) -> &mut Self {
        self.drivers.insert(kind, factory);
        self
    }

    /// Driver of `kind`.
    pub fn get(&self, kind: DeviceKind) -> Option<&DriverFactory> {
        self.drivers.get(&kind)
    }

    /// Whether `kind` has a driver.
    pub fn contains(&self, kind: DeviceKind) -> bool {
        self.drivers.contains_key(&kind)
    }

    /// Registered devices in declaration order.
    pub fn kinds(&self) -> Vec<DeviceKind> {
        let mut kinds: Vec<DeviceKind> = self.drivers.keys().copied().collect();
        kinds.sort();
        kinds
    }
}
