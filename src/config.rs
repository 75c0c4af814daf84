//! Configuration loaded with Figment.
//!
//! Configuration is loaded once at startup from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `LABMON_`, nested keys split on `__`
//!    (for example `LABMON_DATABASE__HOST=db.lab`)
//!
//! The resulting [`MonitorConfig`] is immutable: it is validated, wrapped in an
//! `Arc` and handed to each component's constructor.
//!
//! # Example
//! ```no_run
//! use lab_monitor::config::MonitorConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MonitorConfig::load_from("config/monitor.toml")?;
//! config.validate()?;
//! println!("Retention: {} days", config.retention.days);
//! # Ok(())
//! # }
//! ```

use crate::error::{AppResult, MonitorError};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Name and log output.
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Ring buffer history length.
    #[serde(default)]
    pub retention: RetentionConfig,
    /// Database connection and batch writer.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Retry and cooldown policy of every poller.
    #[serde(default)]
    pub polling: PollingPolicyConfig,
    /// Interlock thresholds.
    #[serde(default)]
    pub safety: SafetyConfig,
    /// Shutdown timing and the HV sampler period.
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    /// Multi-channel analog DAQ.
    #[serde(default)]
    pub daq: DaqConfig,
    /// Radon monitor.
    #[serde(default)]
    pub radon: RadonConfig,
    /// Fluxgate magnetometer.
    #[serde(default)]
    pub magnetometer: MagnetometerConfig,
    /// Temperature, humidity and oxygen transmitter.
    #[serde(default)]
    pub th_o2: ThO2Config,
    /// Fire detector.
    #[serde(default)]
    pub fire: FireConfig,
    /// VOC (PID) detector.
    #[serde(default)]
    pub voc: VocConfig,
    /// UPS read through apcaccess.
    #[serde(default)]
    pub ups: UpsConfig,
    /// CAEN HV crate.
    #[serde(default)]
    pub caen_hv: CaenHvConfig,
    /// Networked PDU.
    #[serde(default)]
    pub pdu: PduConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// In-memory history retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Days of history kept in every ring buffer.
    #[serde(default = "default_retention_days")]
    pub days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            days: default_retention_days(),
        }
    }
}

/// MariaDB/MySQL connection and batch writer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Store samples when true.
    #[serde(default)]
    pub enabled: bool,
    /// Server host name.
    #[serde(default = "default_db_host")]
    pub host: String,
    /// Server TCP port.
    #[serde(default = "default_db_port")]
    pub port: u16,
    /// Takes precedence over host/port when set.
    #[serde(default)]
    pub unix_socket: Option<PathBuf>,
    /// Login user.
    #[serde(default)]
    pub user: String,
    /// Login password.
    #[serde(default)]
    pub password: String,
    /// Schema name.
    #[serde(default = "default_db_name")]
    pub database: String,
    /// Connections kept in the pool.
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    /// Batch flush period.
    #[serde(with = "humantime_serde", default = "default_flush_interval")]
    pub flush_interval: Duration,
    /// Delay before retrying a failed schema setup.
    #[serde(with = "humantime_serde", default = "default_setup_retry")]
    pub setup_retry: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_db_host(),
            port: default_db_port(),
            unix_socket: None,
            user: String::new(),
            password: String::new(),
            database: default_db_name(),
            pool_size: default_pool_size(),
            flush_interval: default_flush_interval(),
            setup_retry: default_setup_retry(),
        }
    }
}

/// Error policy shared by every poller loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingPolicyConfig {
    /// Consecutive failures tolerated before the cooldown kicks in.
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
    /// Pause after too many consecutive errors.
    #[serde(default = "default_cooldown_s")]
    pub cooldown_s: f64,
    /// Cap for the exponential retry delay.
    #[serde(default = "default_max_backoff_s")]
    pub max_backoff_s: f64,
    /// Connection attempts at startup before the device is disabled.
    #[serde(default = "default_startup_attempts")]
    pub startup_attempts: u32,
}

impl Default for PollingPolicyConfig {
    fn default() -> Self {
        Self {
            error_threshold: default_error_threshold(),
            cooldown_s: default_cooldown_s(),
            max_backoff_s: default_max_backoff_s(),
            startup_attempts: default_startup_attempts(),
        }
    }
}

/// Interlock thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// VOC concentration (ppm) that raises WARNING.
    #[serde(default = "default_warning_ppm")]
    pub warning_ppm: f64,
    /// VOC concentration (ppm) that raises EMERGENCY.
    #[serde(default = "default_critical_ppm")]
    pub critical_ppm: f64,
    /// UPS time-left (minutes) below which HV is switched off while on battery.
    #[serde(default = "default_shutdown_threshold_min")]
    pub shutdown_threshold_min: f64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            warning_ppm: default_warning_ppm(),
            critical_ppm: default_critical_ppm(),
            shutdown_threshold_min: default_shutdown_threshold_min(),
        }
    }
}

/// Shutdown timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Bounded wait for each poller task to exit.
    #[serde(with = "humantime_serde", default = "default_join_timeout")]
    pub join_timeout: Duration,
    /// Period of the HV cross-section sampler.
    #[serde(with = "humantime_serde", default = "default_hv_sample_period")]
    pub hv_sample_period: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            join_timeout: default_join_timeout(),
            hv_sample_period: default_hv_sample_period(),
        }
    }
}

/// Channel type of one DAQ module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaqTaskType {
    /// Resistance thermometers, read in degrees Celsius.
    Rtd,
    /// Voltage inputs, converted to distance.
    Volt,
}

/// Linear voltage to distance calibration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistanceMapping {
    /// `[v_min, v_max]` in volts.
    pub volt_range: [f64; 2],
    /// `[d_min, d_max]` in millimetres.
    pub dist_range_mm: [f64; 2],
}

impl DistanceMapping {
    /// `d = d_min + (v - v_min) / (v_max - v_min) * (d_max - d_min)`
    pub fn convert(&self, voltage: f64) -> f64 {
        let [v_min, v_max] = self.volt_range;
        let [d_min, d_max] = self.dist_range_mm;
        let span = v_max - v_min;
        if span == 0.0 {
            return f64::NAN;
        }
        d_min + (voltage - v_min) / span * (d_max - d_min)
    }
}

/// One analog acquisition module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaqModuleConfig {
    /// Free-form label, `rtd` or `distance`.
    pub role: String,
    /// Hex serial number, with or without `0x`.
    pub serial_number: String,
    /// Channel type of the module.
    pub task_type: DaqTaskType,
    /// Physical channel names, e.g. `ai0`.
    pub channels: Vec<String>,
    /// One mapping per channel for `volt` modules.
    #[serde(default)]
    pub mapping: Vec<DistanceMapping>,
}

/// Multi-channel analog acquisition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaqConfig {
    /// Poll this device when true.
    #[serde(default)]
    pub enabled: bool,
    /// Samples per second per channel.
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: u32,
    /// Reads averaged into one stored row.
    #[serde(default = "default_window_samples")]
    pub window_samples: usize,
    /// Modules opened as one task.
    #[serde(default)]
    pub modules: Vec<DaqModuleConfig>,
}

impl Default for DaqConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sampling_rate: default_sampling_rate(),
            window_samples: default_window_samples(),
            modules: Vec::new(),
        }
    }
}

/// Radon monitor on a serial line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadonConfig {
    /// Poll this device when true.
    #[serde(default)]
    pub enabled: bool,
    /// Serial port path.
    #[serde(default)]
    pub port: String,
    /// Serial baud rate.
    #[serde(default = "default_radon_baud")]
    pub baudrate: u32,
    /// Seconds between measurements.
    #[serde(default = "default_radon_interval")]
    pub interval_s: f64,
    /// Warm-up before the first measurement.
    #[serde(default = "default_radon_interval")]
    pub stabilization_s: f64,
    /// Pause between sending the query and reading the answer.
    #[serde(default = "default_radon_response_delay")]
    pub response_delay_ms: u64,
}

impl Default for RadonConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: String::new(),
            baudrate: default_radon_baud(),
            interval_s: default_radon_interval(),
            stabilization_s: default_radon_interval(),
            response_delay_ms: default_radon_response_delay(),
        }
    }
}

/// SCPI magnetometer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MagnetometerConfig {
    /// Poll this device when true.
    #[serde(default)]
    pub enabled: bool,
    /// Serial port or VISA resource of the instrument.
    #[serde(default)]
    pub resource_name: String,
    /// Seconds between reads.
    #[serde(default = "default_one_second")]
    pub interval_s: f64,
    /// Seconds averaged into one stored row.
    #[serde(default = "default_minute_window")]
    pub window_s: f64,
    /// Settling time after `*RST`.
    #[serde(default = "default_reset_delay")]
    pub reset_delay_ms: u64,
}

impl Default for MagnetometerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            resource_name: String::new(),
            interval_s: default_one_second(),
            window_s: default_minute_window(),
            reset_delay_ms: default_reset_delay(),
        }
    }
}

/// Temperature, humidity and oxygen transmitter on Modbus RTU.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThO2Config {
    /// Poll this device when true.
    #[serde(default)]
    pub enabled: bool,
    /// Serial port path.
    #[serde(default)]
    pub port: String,
    /// Serial baud rate.
    #[serde(default = "default_th_o2_baud")]
    pub baudrate: u32,
    /// Modbus unit id.
    #[serde(default = "default_unit_one")]
    pub modbus_id: u8,
    /// Seconds between reads.
    #[serde(default = "default_one_second")]
    pub interval_s: f64,
    /// Seconds averaged into one stored row.
    #[serde(default = "default_th_o2_window")]
    pub window_s: f64,
}

impl Default for ThO2Config {
    fn default() -> Self {
        Self {
            enabled: false,
            port: String::new(),
            baudrate: default_th_o2_baud(),
            modbus_id: default_unit_one(),
            interval_s: default_one_second(),
            window_s: default_th_o2_window(),
        }
    }
}

/// Fire detector on Modbus RTU.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FireConfig {
    /// Poll this device when true.
    #[serde(default)]
    pub enabled: bool,
    /// Serial port path.
    #[serde(default)]
    pub port: String,
    /// Serial baud rate.
    #[serde(default = "default_fire_baud")]
    pub baudrate: u32,
    /// Modbus unit id.
    #[serde(default = "default_unit_one")]
    pub slave_id: u8,
    /// Modbus reference number (4xxxx) of the status word.
    #[serde(default = "default_fire_status_register")]
    pub status_register: u16,
    /// Poll period. Every sample is stored.
    #[serde(default = "default_one_second")]
    pub interval_s: f64,
}

impl Default for FireConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: String::new(),
            baudrate: default_fire_baud(),
            slave_id: default_unit_one(),
            status_register: default_fire_status_register(),
            interval_s: default_one_second(),
        }
    }
}

/// VOC (PID) detector on Modbus RTU.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VocConfig {
    /// Poll this device when true.
    #[serde(default)]
    pub enabled: bool,
    /// Serial port path.
    #[serde(default)]
    pub port: String,
    /// Serial baud rate.
    #[serde(default = "default_voc_baud")]
    pub baudrate: u32,
    /// Modbus unit id.
    #[serde(default = "default_voc_slave")]
    pub slave_id: u8,
    /// Raw counts per ppm.
    #[serde(default = "default_voc_scale")]
    pub scale_factor: f64,
    /// Poll period. Every sample is stored.
    #[serde(default = "default_voc_interval")]
    pub interval_s: f64,
}

impl Default for VocConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: String::new(),
            baudrate: default_voc_baud(),
            slave_id: default_voc_slave(),
            scale_factor: default_voc_scale(),
            interval_s: default_voc_interval(),
        }
    }
}

/// UPS status source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsConfig {
    /// Poll this device when true.
    #[serde(default)]
    pub enabled: bool,
    /// Status command, `apcaccess` unless overridden.
    #[serde(default = "default_ups_command")]
    pub command: String,
    /// Optional `host:port` of a remote apcupsd.
    #[serde(default)]
    pub host: Option<String>,
    /// Seconds between status reads.
    #[serde(default = "default_ups_interval")]
    pub interval_s: f64,
    /// Seconds averaged into one dashboard value.
    #[serde(default = "default_minute_window")]
    pub window_s: f64,
}

impl Default for UpsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: default_ups_command(),
            host: None,
            interval_s: default_ups_interval(),
            window_s: default_minute_window(),
        }
    }
}

/// One HV board.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HvBoardConfig {
    /// Output channels on the board.
    pub channels: u16,
    /// Free-form label.
    #[serde(default)]
    pub description: String,
}

/// CAEN HV mainframe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaenHvConfig {
    /// Poll this device when true.
    #[serde(default)]
    pub enabled: bool,
    /// Mainframe model, e.g. `SY4527`.
    #[serde(default)]
    pub system_type: String,
    /// Link type, e.g. `TCPIP`.
    #[serde(default)]
    pub link_type: String,
    /// Mainframe address.
    #[serde(default)]
    pub ip_address: String,
    /// Login user.
    #[serde(default)]
    pub username: String,
    /// Login password.
    #[serde(default)]
    pub password: String,
    /// Milliseconds between parameter polls.
    #[serde(default = "default_hv_poll_ms")]
    pub polling_interval_ms: u64,
    /// Polls between two persisted snapshots.
    #[serde(default = "default_hv_persist_every")]
    pub persist_every_polls: u32,
    /// Slot number (as a string key) to board layout.
    #[serde(default)]
    pub crate_map: BTreeMap<String, HvBoardConfig>,
}

impl Default for CaenHvConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            system_type: String::new(),
            link_type: String::new(),
            ip_address: String::new(),
            username: String::new(),
            password: String::new(),
            polling_interval_ms: default_hv_poll_ms(),
            persist_every_polls: default_hv_persist_every(),
            crate_map: BTreeMap::new(),
        }
    }
}

impl CaenHvConfig {
    /// `(slot, channel count)` pairs in slot order. Keys that are not numbers
    /// are skipped here and rejected by [`MonitorConfig::validate`].
    pub fn slots(&self) -> Vec<(u16, u16)> {
        let mut slots: Vec<(u16, u16)> = self
            .crate_map
            .iter()
            .filter_map(|(key, board)| key.trim().parse().ok().map(|slot| (slot, board.channels)))
            .collect();
        slots.sort_unstable();
        slots
    }

    /// Pause between two parameter polls.
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }
}

/// Networked PDU reached over Modbus TCP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PduConfig {
    /// Poll this device when true.
    #[serde(default)]
    pub enabled: bool,
    /// PDU address.
    #[serde(default)]
    pub ip_address: String,
    /// Modbus TCP port.
    #[serde(default = "default_modbus_port")]
    pub port: u16,
    /// Modbus unit id.
    #[serde(default = "default_unit_one")]
    pub unit_id: u8,
    /// Per-request timeout in seconds.
    #[serde(default = "default_pdu_timeout")]
    pub timeout_s: f64,
    /// Seconds between status polls.
    #[serde(default = "default_pdu_interval")]
    pub polling_interval_s: f64,
    /// Switchable outputs.
    #[serde(default = "default_pdu_port_count")]
    pub port_count: u16,
    /// Delay between ports when switching all outputs.
    #[serde(default = "default_pdu_step_ms")]
    pub all_ports_step_ms: u64,
    /// Seconds averaged into one dashboard value.
    #[serde(default = "default_minute_window")]
    pub window_s: f64,
    /// Port number (as a string key) to label.
    #[serde(default)]
    pub outlets: BTreeMap<String, String>,
}

impl Default for PduConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ip_address: String::new(),
            port: default_modbus_port(),
            unit_id: default_unit_one(),
            timeout_s: default_pdu_timeout(),
            polling_interval_s: default_pdu_interval(),
            port_count: default_pdu_port_count(),
            all_ports_step_ms: default_pdu_step_ms(),
            window_s: default_minute_window(),
            outlets: BTreeMap::new(),
        }
    }
}

// Default value functions
fn default_app_name() -> String {
    "Lab Monitor".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_retention_days() -> u32 {
    31
}

fn default_db_host() -> String {
    "127.0.0.1".to_string()
}

fn default_db_port() -> u16 {
    3306
}

fn default_db_name() -> String {
    "lab_monitor".to_string()
}

fn default_pool_size() -> u32 {
    3
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_setup_retry() -> Duration {
    Duration::from_secs(10)
}

fn default_error_threshold() -> u32 {
    3
}

fn default_cooldown_s() -> f64 {
    30.0
}

fn default_max_backoff_s() -> f64 {
    60.0
}

fn default_startup_attempts() -> u32 {
    3
}

fn default_warning_ppm() -> f64 {
    10.0
}

fn default_critical_ppm() -> f64 {
    50.0
}

fn default_shutdown_threshold_min() -> f64 {
    15.0
}

fn default_join_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_hv_sample_period() -> Duration {
    Duration::from_secs(60)
}

fn default_sampling_rate() -> u32 {
    1000
}

fn default_window_samples() -> usize {
    60
}

fn default_radon_baud() -> u32 {
    19200
}

fn default_radon_interval() -> f64 {
    600.0
}

fn default_radon_response_delay() -> u64 {
    500
}

fn default_one_second() -> f64 {
    1.0
}

fn default_minute_window() -> f64 {
    60.0
}

fn default_reset_delay() -> u64 {
    1500
}

fn default_th_o2_baud() -> u32 {
    4800
}

fn default_th_o2_window() -> f64 {
    30.0
}

fn default_unit_one() -> u8 {
    1
}

fn default_fire_baud() -> u32 {
    19200
}

fn default_fire_status_register() -> u16 {
    40001
}

fn default_voc_baud() -> u32 {
    9600
}

fn default_voc_slave() -> u8 {
    2
}

fn default_voc_scale() -> f64 {
    1000.0
}

fn default_voc_interval() -> f64 {
    2.0
}

fn default_ups_command() -> String {
    "apcaccess".to_string()
}

fn default_ups_interval() -> f64 {
    5.0
}

fn default_hv_poll_ms() -> u64 {
    1000
}

fn default_hv_persist_every() -> u32 {
    60
}

fn default_modbus_port() -> u16 {
    502
}

fn default_pdu_timeout() -> f64 {
    3.0
}

fn default_pdu_interval() -> f64 {
    5.0
}

fn default_pdu_port_count() -> u16 {
    8
}

fn default_pdu_step_ms() -> u64 {
    150
}

/// Seconds to `Duration`, clamping negative and NaN input to zero.
pub fn seconds(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}

impl MonitorConfig {
    /// Load configuration from a TOML file and `LABMON_` environment variables
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LABMON_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(MonitorError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(MonitorError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.retention.days == 0 {
            return Err(MonitorError::Configuration(
                "retention.days must be at least 1".to_string(),
            ));
        }

        if self.database.enabled && self.database.pool_size == 0 {
            return Err(MonitorError::Configuration(
                "database.pool_size must be at least 1".to_string(),
            ));
        }

        if self.safety.warning_ppm >= self.safety.critical_ppm {
            return Err(MonitorError::Configuration(format!(
                "safety.warning_ppm ({}) must be below safety.critical_ppm ({})",
                self.safety.warning_ppm, self.safety.critical_ppm
            )));
        }

        let intervals = [
            ("daq.sampling_rate", self.daq.enabled, f64::from(self.daq.sampling_rate)),
            ("radon.interval_s", self.radon.enabled, self.radon.interval_s),
            ("magnetometer.interval_s", self.magnetometer.enabled, self.magnetometer.interval_s),
            ("th_o2.interval_s", self.th_o2.enabled, self.th_o2.interval_s),
            ("fire.interval_s", self.fire.enabled, self.fire.interval_s),
            ("voc.interval_s", self.voc.enabled, self.voc.interval_s),
            ("ups.interval_s", self.ups.enabled, self.ups.interval_s),
            ("pdu.polling_interval_s", self.pdu.enabled, self.pdu.polling_interval_s),
        ];
        for (name, enabled, value) in intervals {
            if enabled && !(value.is_finite() && value > 0.0) {
                return Err(MonitorError::Configuration(format!(
                    "{name} must be a positive number, got {value}"
                )));
            }
        }

        if self.caen_hv.enabled && self.caen_hv.polling_interval_ms == 0 {
            return Err(MonitorError::Configuration(
                "caen_hv.polling_interval_ms must be positive".to_string(),
            ));
        }

        self.validate_daq()?;
        self.validate_hv()?;
        self.validate_pdu()?;
        Ok(())
    }

    fn validate_daq(&self) -> AppResult<()> {
        if !self.daq.enabled {
            return Ok(());
        }
        for module in &self.daq.modules {
            if parse_serial_number(&module.serial_number).is_none() {
                return Err(MonitorError::Configuration(format!(
                    "DAQ module '{}' has an invalid serial number '{}'",
                    module.role, module.serial_number
                )));
            }
            if module.task_type == DaqTaskType::Volt {
                if module.mapping.len() < module.channels.len() {
                    return Err(MonitorError::Configuration(format!(
                        "DAQ module '{}' needs one distance mapping per channel",
                        module.role
                    )));
                }
                if let Some(bad) = module
                    .mapping
                    .iter()
                    .find(|m| m.volt_range[0] == m.volt_range[1])
                {
                    return Err(MonitorError::Configuration(format!(
                        "DAQ module '{}' has a degenerate voltage range {:?}",
                        module.role, bad.volt_range
                    )));
                }
            }
        }
        Ok(())
    }

    fn validate_hv(&self) -> AppResult<()> {
        if !self.caen_hv.enabled {
            return Ok(());
        }
        for (key, board) in &self.caen_hv.crate_map {
            if key.trim().parse::<u16>().is_err() {
                return Err(MonitorError::Configuration(format!(
                    "caen_hv.crate_map key '{key}' is not a slot number"
                )));
            }
            if board.channels == 0 {
                return Err(MonitorError::Configuration(format!(
                    "caen_hv.crate_map slot {key} has no channels"
                )));
            }
        }
        Ok(())
    }

    fn validate_pdu(&self) -> AppResult<()> {
        if !self.pdu.enabled {
            return Ok(());
        }
        if self.pdu.port_count == 0 {
            return Err(MonitorError::Configuration(
                "pdu.port_count must be at least 1".to_string(),
            ));
        }
        for key in self.pdu.outlets.keys() {
            match key.trim().parse::<u16>() {
                Ok(port) if (1..=self.pdu.port_count).contains(&port) => {}
                _ => {
                    return Err(MonitorError::Configuration(format!(
                        "pdu.outlets key '{key}' is not a port in 1..={}",
                        self.pdu.port_count
                    )))
                }
            }
        }
        Ok(())
    }
}

/// Parse a hex serial number such as `0x1F2E3D4C` or `1F2E3D4C`.
pub fn parse_serial_number(text: &str) -> Option<u64> {
    let trimmed = text.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    u64::from_str_radix(digits, 16).ok()
}
