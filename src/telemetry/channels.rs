//! Catalog of ring-buffer channels.
//!
//! Every series kept in memory is declared here with its column names and
//! resolution. Capacity is `retention_days * samples_per_day`, fixed at startup.

use crate::config::MonitorConfig;

/// Analog RTD and voltage channels.
pub const LS: &str = "LS";
/// Radon mean and sigma.
pub const RADON: &str = "RADON";
/// Flux components and magnitude.
pub const MAGNETOMETER: &str = "MAG";
/// Temperature, humidity and oxygen.
pub const TH_O2: &str = "TH_O2";
/// UPS line voltage and battery.
pub const UPS: &str = "UPS";
/// Fire panel status code.
pub const FIRE: &str = "FIRE";
/// VOC concentration.
pub const VOC: &str = "VOC";
/// PDU totals.
pub const PDU: &str = "PDU";

/// Sample period class of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// One row per minute.
    Fast,
    /// One row per ten minutes.
    Slow,
}

impl Resolution {
    /// Rows per day at this resolution.
    pub fn samples_per_day(self) -> usize {
        match self {
            Resolution::Fast => 1440,
            Resolution::Slow => 144,
        }
    }
}

/// Declaration of one ring-buffer channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSpec {
    /// Key used by [`crate::telemetry::TelemetryStore::snapshot`].
    pub key: String,
    /// Value column names, timestamp excluded.
    pub columns: Vec<String>,
    /// Sample period class.
    pub resolution: Resolution,
}

impl ChannelSpec {
    /// Channel `key` with `columns`.
    pub fn new(key: impl Into<String>, columns: &[&str], resolution: Resolution) -> Self {
        Self {
            key: key.into(),
            columns: columns.iter().map(|c| (*c).to_string()).collect(),
            resolution,
        }
    }

    /// Rows kept for `retention_days`.
    pub fn capacity(&self, retention_days: u32) -> usize {
        self.resolution.samples_per_day() * retention_days as usize
    }
}

/// Key of the minute-resolution buffer for one HV board.
pub fn hv_slot_key(slot: u16) -> String {
    format!("HV.slot{slot}")
}

/// `ch{n}.VMon`, `ch{n}.IMon` for every channel of a board.
pub fn hv_columns(channels: u16) -> Vec<String> {
    (0..channels)
        .flat_map(|ch| [format!("ch{ch}.VMon"), format!("ch{ch}.IMon")])
        .collect()
}

/// Channels for every enabled device.
pub fn catalog(config: &MonitorConfig) -> Vec<ChannelSpec> {
    let mut specs = Vec::new();
    if config.daq.enabled {
        specs.push(ChannelSpec::new(
            LS,
            &["RTD_1", "RTD_2", "DIST_1", "DIST_2"],
            Resolution::Fast,
        ));
    }
    if config.radon.enabled {
        specs.push(ChannelSpec::new(RADON, &["mu", "sigma"], Resolution::Slow));
    }
    if config.magnetometer.enabled {
        specs.push(ChannelSpec::new(
            MAGNETOMETER,
            &["Bx", "By", "Bz", "B_mag"],
            Resolution::Fast,
        ));
    }
    if config.th_o2.enabled {
        specs.push(ChannelSpec::new(
            TH_O2,
            &["temperature", "humidity", "oxygen"],
            Resolution::Fast,
        ));
    }
    if config.ups.enabled {
        specs.push(ChannelSpec::new(
            UPS,
            &["LINEV", "BCHARGE", "TIMELEFT"],
            Resolution::Fast,
        ));
    }
    if config.fire.enabled {
        specs.push(ChannelSpec::new(FIRE, &["status_code"], Resolution::Fast));
    }
    if config.voc.enabled {
        specs.push(ChannelSpec::new(VOC, &["concentration"], Resolution::Fast));
    }
    if config.pdu.enabled {
        specs.push(ChannelSpec::new(
            PDU,
            &["frequency", "voltage", "total_power"],
            Resolution::Fast,
        ));
    }
    if config.caen_hv.enabled {
        for (slot, channels) in config.caen_hv.slots() {
            specs.push(ChannelSpec {
                key: hv_slot_key(slot),
                columns: hv_columns(channels),
                resolution: Resolution::Fast,
            });
        }
    }
    specs
}
