//! Log subscriber setup.
//!
//! Components log through the `tracing` macros with structured fields such
//! as `device = %kind` and `error = %err`. The subscriber installed here
//! writes them as pretty, compact or JSON lines. `RUST_LOG` takes precedence
//! over `[application] log_level`.
//!
//! ```no_run
//! use lab_monitor::{config::MonitorConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MonitorConfig::load_from("config/monitor.toml")?;
//! logging::init_from_config(&config)?;
//! tracing::info!(device = "PDU", "Poller started");
//! # Ok(())
//! # }
//! ```

use crate::config::MonitorConfig;
use crate::error::{AppResult, MonitorError};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Line format of the log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line and colored, for a terminal.
    Pretty,
    /// One plain line per event, for service logs.
    Compact,
    /// One JSON object per event.
    Json,
}

impl OutputFormat {
    fn parse(name: &str) -> AppResult<Self> {
        match name.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(MonitorError::Configuration(format!(
                "application.log_format '{name}' is not one of pretty, compact, json"
            ))),
        }
    }
}

/// Subscriber options.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Default level when `RUST_LOG` is unset.
    pub level: Level,
    /// Line format.
    pub format: OutputFormat,
    /// Log span open and close.
    pub with_span_events: bool,
    /// Source file and line of each event.
    pub with_file_and_line: bool,
    /// Thread name of each event.
    pub with_thread_names: bool,
    /// Colors, honored by the pretty format only.
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_span_events: false,
            with_file_and_line: false,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// Options from the `[application]` section.
    pub fn from_monitor_config(config: &MonitorConfig) -> AppResult<Self> {
        Ok(Self {
            level: parse_log_level(&config.application.log_level)?,
            format: OutputFormat::parse(&config.application.log_format)?,
            ..Default::default()
        })
    }

    /// Defaults at `level`.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Use `format` for every line.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Toggle span open/close events.
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Toggle colors.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }

    fn layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let span_events = if self.with_span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let base = fmt::layer()
            .with_span_events(span_events)
            .with_file(self.with_file_and_line)
            .with_line_number(self.with_file_and_line)
            .with_thread_names(self.with_thread_names);
        match self.format {
            OutputFormat::Pretty => base.pretty().with_ansi(self.with_ansi).boxed(),
            OutputFormat::Compact => base.compact().with_ansi(false).boxed(),
            OutputFormat::Json => base.json().boxed(),
        }
    }
}

/// Install the subscriber described by the `[application]` section.
pub fn init_from_config(config: &MonitorConfig) -> AppResult<()> {
    init(TracingConfig::from_monitor_config(config)?)
}

/// Install the global subscriber.
///
/// Does nothing when one is already installed, e.g. by a test or an
/// embedding application.
pub fn init(config: TracingConfig) -> AppResult<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    tracing_subscriber::registry()
        .with(config.layer().with_filter(filter))
        .try_init()
        .or_else(|err| {
            if tracing::dispatcher::has_been_set() {
                Ok(())
            } else {
                Err(MonitorError::Configuration(format!(
                    "log subscriber not installed: {err}"
                )))
            }
        })
}

fn parse_log_level(level: &str) -> AppResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(MonitorError::Configuration(format!(
            "application.log_level '{level}' is not one of trace, debug, info, warn, error"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_levels_are_case_insensitive() {
        assert_eq!(parse_log_level("trace").unwrap(), Level::TRACE);
        assert_eq!(parse_log_level("INFO").unwrap(), Level::INFO);
        assert_eq!(parse_log_level("Debug").unwrap(), Level::DEBUG);
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn application_section_selects_level_and_format() {
        let mut config = MonitorConfig::default();
        config.application.log_level = "debug".to_string();
        config.application.log_format = "json".to_string();

        let tracing_config = TracingConfig::from_monitor_config(&config).unwrap();
        assert_eq!(tracing_config.level, Level::DEBUG);
        assert_eq!(tracing_config.format, OutputFormat::Json);

        config.application.log_format = "xml".to_string();
        let err = TracingConfig::from_monitor_config(&config).unwrap_err();
        assert!(err.to_string().contains("xml"));
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = TracingConfig::new(Level::WARN)
            .with_format(OutputFormat::Compact)
            .with_span_events(true)
            .with_ansi(false);

        assert_eq!(config.level, Level::WARN);
        assert_eq!(config.format, OutputFormat::Compact);
        assert!(config.with_span_events);
        assert!(!config.with_ansi);
    }

    #[test]
    fn init_twice_is_ok() {
        assert!(init(TracingConfig::new(Level::INFO).with_ansi(false)).is_ok());
        assert!(init(TracingConfig::new(Level::DEBUG).with_format(OutputFormat::Json)).is_ok());
    }
}
