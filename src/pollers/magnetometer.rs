//! Three-axis fluxgate magnetometer over SCPI.

use async_trait::async_trait;
use chrono::Local;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::{seconds, MagnetometerConfig};
use crate::error::{DeviceError, DeviceResult};
use crate::hardware::{DeviceKind, LineConnector, LineInstrument};
use crate::persistence::record::{round_to, second_timestamp};
use crate::persistence::{PersistenceItem, RecordKind, SqlValue};
use crate::pollers::window::RollingWindow;
use crate::pollers::{DevicePoller, PollContext};
use crate::telemetry::channels::MAGNETOMETER;
use crate::telemetry::reading::FluxReading;
use crate::telemetry::DeviceReading;

const AXES: [&str; 3] = [
    ":MEASure:SCALar:FLUX:X?",
    ":MEASure:SCALar:FLUX:Y?",
    ":MEASure:SCALar:FLUX:Z?",
];

/// Milligauss per tesla.
const MILLIGAUSS_PER_TESLA: f64 = 1e7;

/// First token of a flux response, tesla to milligauss.
pub fn parse_flux(response: &str) -> DeviceResult<f64> {
    response
        .split_whitespace()
        .next()
        .and_then(|token| token.parse::<f64>().ok())
        .map(|tesla| tesla * MILLIGAUSS_PER_TESLA)
        .ok_or_else(|| DeviceError::Malformed(format!("flux response '{response}'")))
}

/// Fluxgate magnetometer read over SCPI.
pub struct MagnetometerPoller {
    config: MagnetometerConfig,
    connector: Arc<dyn LineConnector>,
    line: Option<Box<dyn LineInstrument>>,
    window: RollingWindow,
}

impl MagnetometerPoller {
    /// Poller for the instrument opened by `connector`.
    pub fn new(config: MagnetometerConfig, connector: Arc<dyn LineConnector>) -> Self {
        let window = RollingWindow::covering(seconds(config.window_s), seconds(config.interval_s));
        Self {
            config,
            connector,
            line: None,
            window,
        }
    }
}

#[async_trait]
impl DevicePoller for MagnetometerPoller {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Magnetometer
    }

    fn poll_interval(&self) -> Duration {
        seconds(self.config.interval_s)
    }

    fn is_connected(&self) -> bool {
        self.line.is_some()
    }

    async fn connect(&mut self, _ctx: &PollContext) -> DeviceResult<()> {
        let mut line = self.connector.open().await?;
        line.write_line("*RST").await?;
        tokio::time::sleep(Duration::from_millis(self.config.reset_delay_ms)).await;
        info!(resource = %self.config.resource_name, "Magnetometer reset");
        self.line = Some(line);
        self.window.clear();
        Ok(())
    }

    async fn poll_once(&mut self, ctx: &PollContext) -> DeviceResult<()> {
        let line = self.line.as_mut().ok_or(DeviceError::NotConnected)?;
        let timestamp = Local::now();
        let mut components = [0.0; 3];
        for (value, command) in components.iter_mut().zip(AXES) {
            *value = parse_flux(&line.query(command).await?)?;
        }
        let flux = FluxReading::from_components(components[0], components[1], components[2]);
        ctx.publish_raw(DeviceKind::Magnetometer, timestamp, DeviceReading::Magnetometer(flux));

        let raw = [flux.bx, flux.by, flux.bz, flux.magnitude];
        if let Some(mean) = self.window.push(&raw) {
            let averaged = FluxReading {
                bx: mean[0],
                by: mean[1],
                bz: mean[2],
                magnitude: mean[3],
            };
            ctx.publish_average(
                DeviceKind::Magnetometer,
                MAGNETOMETER,
                timestamp,
                &mean,
                DeviceReading::Magnetometer(averaged),
            );
            let mut row = vec![SqlValue::from(second_timestamp(timestamp))];
            row.extend(raw.iter().map(|v| SqlValue::from(round_to(*v, 2))));
            ctx.persist(PersistenceItem::single(RecordKind::Magnetometer, row));
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.line = None;
    }

    fn gap_channels(&self) -> Vec<String> {
        vec![MAGNETOMETER.to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::hardware::mock::MockLineConnector;
    use crate::persistence::{persistence_queue, Payload};
    use crate::telemetry::channels::catalog;
    use crate::telemetry::TelemetryStore;
    use tokio::sync::broadcast;

    #[test]
    fn converts_tesla_to_milligauss() {
        assert!((parse_flux("2.5e-5 T").unwrap() - 250.0).abs() < 1e-9);
        assert!(parse_flux("").unwrap_err().is_malformed());
        assert!(parse_flux("OVERRANGE").unwrap_err().is_malformed());
    }

    #[tokio::test(start_paused = true)]
    async fn resets_then_persists_one_row_per_window() {
        let mut config = MonitorConfig::default();
        config.magnetometer.enabled = true;
        config.magnetometer.interval_s = 1.0;
        config.magnetometer.window_s = 3.0;

        let connector = MockLineConnector::magnetometer(3e-5, 4e-5, 0.0);
        let mut poller =
            MagnetometerPoller::new(config.magnetometer.clone(), Arc::new(connector.clone()));
        let store = Arc::new(TelemetryStore::new(&catalog(&config), 1).unwrap());
        let (tx, mut rx) = persistence_queue();
        let (events, _) = broadcast::channel(16);
        let ctx = PollContext::new(store, Some(tx), events);

        poller.connect(&ctx).await.unwrap();
        assert_eq!(connector.written(), vec!["*RST".to_string()]);

        for _ in 0..3 {
            poller.poll_once(&ctx).await.unwrap();
        }
        let items = rx.drain_available();
        assert_eq!(items.len(), 1);
        match &items[0].payload {
            Payload::Single(row) => {
                assert_eq!(row.len(), 5);
                assert_eq!(row[1], SqlValue::Float(300.0));
                assert_eq!(row[4], SqlValue::Float(500.0));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
