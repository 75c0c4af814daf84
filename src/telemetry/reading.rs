//! Decoded device readings held in the latest-value cache.

use serde::Serialize;

/// Per-cycle mean of every analog channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalogReading {
    /// Temperature channels, in acquisition order.
    pub rtd: Vec<f64>,
    /// Raw voltage channels.
    pub volt: Vec<f64>,
    /// Voltage channels converted to millimeters.
    pub distance_mm: Vec<f64>,
}

/// Progress of the radon monitor's measurement cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RadonPhase {
    /// Waiting out the settling time after the first connect.
    Stabilizing,
    /// At least one measurement taken.
    Measuring,
}

/// Radon monitor state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RadonReading {
    /// Last measured mean, NaN before the first measurement.
    pub mu: f64,
    /// Standard deviation of `mu`.
    pub sigma: f64,
    /// Idle or measuring.
    pub phase: RadonPhase,
    /// Seconds until the next measurement.
    pub countdown_s: u64,
}

/// Flux density in milligauss.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FluxReading {
    /// X component.
    pub bx: f64,
    /// Y component.
    pub by: f64,
    /// Z component.
    pub bz: f64,
    /// Euclidean norm of the three components.
    pub magnitude: f64,
}

impl FluxReading {
    /// Reading with the magnitude computed from the components.
    pub fn from_components(bx: f64, by: f64, bz: f64) -> Self {
        Self {
            bx,
            by,
            bz,
            magnitude: (bx * bx + by * by + bz * bz).sqrt(),
        }
    }
}

/// Windowed temperature, humidity and oxygen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThO2Reading {
    /// Degrees Celsius.
    pub temperature_c: f64,
    /// Relative humidity in percent.
    pub humidity_pct: f64,
    /// Oxygen in percent by volume.
    pub oxygen_pct: f64,
}

/// Decoded fire detector status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FireStatus {
    /// Raw register value.
    pub status_code: u16,
    /// An alarm stage bit is set.
    pub is_fire: bool,
    /// The fault bit is set.
    pub is_fault: bool,
}

impl FireStatus {
    /// Bit 0 is the fault flag, bits 2 and 3 are the two alarm stages.
    pub fn decode(status_code: u16) -> Self {
        Self {
            status_code,
            is_fire: status_code & 0x0C != 0,
            is_fault: status_code & 0x01 != 0,
        }
    }

    /// Operator text for the status.
    pub fn message(&self) -> &'static str {
        if self.is_fire {
            "FIRE ALARM"
        } else if self.is_fault {
            "FAULT"
        } else {
            "NORMAL"
        }
    }
}

/// VOC transmitter sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VocReading {
    /// Concentration after the configured scale factor.
    pub concentration_ppm: f64,
    /// Non-zero when the detector's own alarm is raised.
    pub alarm: u16,
}

/// Parsed `apcaccess` status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpsStatus {
    /// Raw `STATUS` field, e.g. `ONLINE` or `ONBATT`.
    pub status: String,
    /// Input line voltage.
    pub line_voltage: f64,
    /// Battery charge in percent.
    pub battery_charge_pct: f64,
    /// Runtime left on battery, NaN when the UPS did not report it.
    pub time_left_min: f64,
}

impl UpsStatus {
    /// `ONBATT` (apcupsd) or "on battery" in free text.
    pub fn is_on_battery(&self) -> bool {
        let compact: String = self
            .status
            .to_uppercase()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        compact.contains("ONBATT")
    }

    /// Whether the status reports line power.
    pub fn is_online(&self) -> bool {
        self.status.to_uppercase().contains("ONLINE")
    }
}

/// One HV channel as reported by the crate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HvChannelReading {
    /// Crate slot.
    pub slot: u16,
    /// Channel within the slot.
    pub channel: u16,
    /// Whether the channel is powered.
    pub power: bool,
    /// Monitored voltage.
    pub vmon: f64,
    /// Monitored current.
    pub imon: f64,
    /// Voltage setpoint.
    pub v0set: f64,
    /// Current limit.
    pub i0set: f64,
    /// Raw channel status bits.
    pub status: i64,
}

/// Every configured HV channel from one poll.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HvSnapshot {
    /// Channels in configuration order.
    pub channels: Vec<HvChannelReading>,
}

impl HvSnapshot {
    /// Reading of `slot`/`channel`, if polled.
    pub fn channel(&self, slot: u16, channel: u16) -> Option<&HvChannelReading> {
        self.channels
            .iter()
            .find(|c| c.slot == slot && c.channel == channel)
    }
}

/// One PDU outlet.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PduPortReading {
    /// Outlet number, starting at 1.
    pub port: u16,
    /// Relay state.
    pub on: bool,
    /// Active power in watts.
    pub power_w: f64,
    /// Current in milliamps.
    pub current_ma: f64,
    /// Energy counter in watt-hours.
    pub energy_wh: f64,
}

/// PDU totals and per-outlet readings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PduStatus {
    /// Line frequency.
    pub frequency_hz: f64,
    /// Line voltage.
    pub voltage_v: f64,
    /// Total power reported by the unit.
    pub total_power_w: f64,
    /// Configured outlets in port order.
    pub ports: Vec<PduPortReading>,
}

/// Latest decoded value of one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "family", content = "reading")]
pub enum DeviceReading {
    /// Analog chassis block.
    Analog(AnalogReading),
    /// Radon monitor.
    Radon(RadonReading),
    /// Magnetometer.
    Magnetometer(FluxReading),
    /// TH/O2 transmitter.
    ThO2(ThO2Reading),
    /// Fire panel.
    Fire(FireStatus),
    /// VOC transmitter.
    Voc(VocReading),
    /// UPS.
    Ups(UpsStatus),
    /// HV crate.
    Hv(HvSnapshot),
    /// PDU.
    Pdu(PduStatus),
}
