//! UPS status from apcupsd.

use async_trait::async_trait;
use chrono::Local;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{seconds, UpsConfig};
use crate::error::{DeviceError, DeviceResult};
use crate::hardware::{DeviceKind, UpsConnector, UpsSource};
use crate::persistence::record::second_timestamp;
use crate::persistence::{PersistenceItem, RecordKind, SqlValue};
use crate::pollers::window::RollingWindow;
use crate::pollers::{DevicePoller, PollContext};
use crate::telemetry::channels::UPS;
use crate::telemetry::reading::UpsStatus;
use crate::telemetry::DeviceReading;

/// Parse an `apcaccess` report.
///
/// Only the first token of each value is used, so units are dropped
/// (`LINEV    : 230.0 Volts` is 230.0). Missing numbers are NaN and a
/// missing `STATUS` is `N/A`.
pub fn parse_apcaccess(report: &str) -> DeviceResult<UpsStatus> {
    let fields: HashMap<&str, &str> = report
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim(), value.trim()))
        .collect();
    if fields.is_empty() {
        return Err(DeviceError::Malformed("empty apcaccess report".to_string()));
    }
    let number = |key: &str| {
        fields
            .get(key)
            .and_then(|value| value.split_whitespace().next())
            .and_then(|token| token.parse::<f64>().ok())
            .unwrap_or(f64::NAN)
    };
    Ok(UpsStatus {
        status: fields
            .get("STATUS")
            .map_or_else(|| "N/A".to_string(), |s| (*s).to_string()),
        line_voltage: number("LINEV"),
        battery_charge_pct: number("BCHARGE"),
        time_left_min: number("TIMELEFT"),
    })
}

/// UPS status from `apcaccess`.
pub struct UpsPoller {
    config: UpsConfig,
    connector: Arc<dyn UpsConnector>,
    source: Option<Box<dyn UpsSource>>,
    window: RollingWindow,
}

impl UpsPoller {
    /// Poller reading reports from `connector`.
    pub fn new(config: UpsConfig, connector: Arc<dyn UpsConnector>) -> Self {
        let window = RollingWindow::covering(seconds(config.window_s), seconds(config.interval_s));
        Self {
            config,
            connector,
            source: None,
            window,
        }
    }
}

#[async_trait]
impl DevicePoller for UpsPoller {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Ups
    }

    fn poll_interval(&self) -> Duration {
        seconds(self.config.interval_s)
    }

    fn is_connected(&self) -> bool {
        self.source.is_some()
    }

    async fn connect(&mut self, _ctx: &PollContext) -> DeviceResult<()> {
        self.source = Some(self.connector.open().await?);
        Ok(())
    }

    async fn poll_once(&mut self, ctx: &PollContext) -> DeviceResult<()> {
        let source = self.source.as_mut().ok_or(DeviceError::NotConnected)?;
        let timestamp = Local::now();
        let status = parse_apcaccess(&source.query_status().await?)?;
        ctx.publish_raw(DeviceKind::Ups, timestamp, DeviceReading::Ups(status.clone()));

        let values = [
            status.line_voltage,
            status.battery_charge_pct,
            status.time_left_min,
        ];
        if let Some(mean) = self.window.push(&values) {
            let averaged = UpsStatus {
                status: status.status.clone(),
                line_voltage: mean[0],
                battery_charge_pct: mean[1],
                time_left_min: mean[2],
            };
            ctx.publish_average(DeviceKind::Ups, UPS, timestamp, &mean, DeviceReading::Ups(averaged));
            ctx.persist(PersistenceItem::single(
                RecordKind::Ups,
                vec![
                    SqlValue::from(second_timestamp(timestamp)),
                    SqlValue::from(status.status),
                    SqlValue::from(status.line_voltage),
                    SqlValue::from(status.battery_charge_pct),
                    SqlValue::from(status.time_left_min),
                ],
            ));
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.source = None;
    }

    fn gap_channels(&self) -> Vec<String> {
        vec![UPS.to_string()]
    }
}
