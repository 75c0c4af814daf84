//! Radon monitor on a serial line.
//!
//! The instrument integrates for minutes, so the poller ticks once a second
//! only to drive the countdown shown on dashboards. After the stabilization
//! period it sends `VALUE?` every `interval_s`. A failed measurement still
//! restarts the countdown; the instrument is never queried back to back.

use async_trait::async_trait;
use chrono::Local;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::{seconds, RadonConfig};
use crate::error::{DeviceError, DeviceResult};
use crate::hardware::{DeviceKind, LineConnector, LineInstrument};
use crate::persistence::record::{round_to, second_timestamp};
use crate::persistence::{PersistenceItem, RecordKind, SqlValue};
use crate::pollers::{DevicePoller, PollContext};
use crate::telemetry::channels::RADON;
use crate::telemetry::reading::{RadonPhase, RadonReading};
use crate::telemetry::DeviceReading;

const TICK: Duration = Duration::from_secs(1);

/// Parse `VALUE: <mu> <unit>: <sigma> <unit>`.
pub fn parse_value(response: &str) -> DeviceResult<(f64, f64)> {
    if !response.contains("VALUE") {
        return Err(DeviceError::Malformed(format!(
            "radon monitor returned '{response}'"
        )));
    }
    let mut parts = response.split(':').skip(1);
    let mut field = |name: &str| -> DeviceResult<f64> {
        parts
            .next()
            .and_then(|part| part.split_whitespace().next())
            .and_then(|token| token.parse::<f64>().ok())
            .ok_or_else(|| DeviceError::Malformed(format!("no {name} in '{response}'")))
    };
    let mu = field("mean")?;
    let sigma = field("sigma")?;
    Ok((mu, sigma))
}

/// Radon monitor queried with `VALUE?` once per interval.
pub struct RadonPoller {
    config: RadonConfig,
    connector: Arc<dyn LineConnector>,
    line: Option<Box<dyn LineInstrument>>,
    /// When the next `VALUE?` is due. Set on the first connect only.
    next_measurement: Option<Instant>,
    phase: RadonPhase,
    last: (f64, f64),
}

impl RadonPoller {
    /// Poller for the monitor opened by `connector`.
    pub fn new(config: RadonConfig, connector: Arc<dyn LineConnector>) -> Self {
        Self {
            config,
            connector,
            line: None,
            next_measurement: None,
            phase: RadonPhase::Stabilizing,
            last: (f64::NAN, f64::NAN),
        }
    }

    fn reading(&self, now: Instant) -> RadonReading {
        let countdown_s = self
            .next_measurement
            .map(|due| due.saturating_duration_since(now).as_secs())
            .unwrap_or(0);
        RadonReading {
            mu: self.last.0,
            sigma: self.last.1,
            phase: self.phase,
            countdown_s,
        }
    }

    async fn measure(&mut self) -> DeviceResult<(f64, f64)> {
        let line = self.line.as_mut().ok_or(DeviceError::NotConnected)?;
        line.write_line("VALUE?").await?;
        tokio::time::sleep(Duration::from_millis(self.config.response_delay_ms)).await;
        let response = line.read_line().await?;
        parse_value(response.trim())
    }
}

#[async_trait]
impl DevicePoller for RadonPoller {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Radon
    }

    fn poll_interval(&self) -> Duration {
        TICK
    }

    fn is_connected(&self) -> bool {
        self.line.is_some()
    }

    async fn connect(&mut self, _ctx: &PollContext) -> DeviceResult<()> {
        self.line = Some(self.connector.open().await?);
        if self.next_measurement.is_none() {
            let stabilization = seconds(self.config.stabilization_s);
            info!(?stabilization, "Radon monitor stabilizing");
            self.next_measurement = Some(Instant::now() + stabilization);
        }
        Ok(())
    }

    async fn poll_once(&mut self, ctx: &PollContext) -> DeviceResult<()> {
        let now = Instant::now();
        let due = self.next_measurement.map_or(true, |due| due <= now);
        if !due {
            ctx.publish_raw(
                DeviceKind::Radon,
                Local::now(),
                DeviceReading::Radon(self.reading(now)),
            );
            return Ok(());
        }

        self.phase = RadonPhase::Measuring;
        self.next_measurement = Some(now + seconds(self.config.interval_s));
        let (mu, sigma) = self.measure().await?;
        self.last = (mu, sigma);
        debug!(mu, sigma, "Radon measured");

        let timestamp = Local::now();
        let reading = self.reading(Instant::now());
        ctx.publish_raw(DeviceKind::Radon, timestamp, DeviceReading::Radon(reading.clone()));
        ctx.publish_average(
            DeviceKind::Radon,
            RADON,
            timestamp,
            &[mu, sigma],
            DeviceReading::Radon(reading),
        );
        ctx.persist(PersistenceItem::single(
            RecordKind::Radon,
            vec![
                SqlValue::from(second_timestamp(timestamp)),
                SqlValue::from(round_to(mu, 2)),
                SqlValue::from(round_to(sigma, 2)),
            ],
        ));
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.line = None;
    }

    fn gap_channels(&self) -> Vec<String> {
        vec![RADON.to_string()]
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
    fn parses_value_response() {
        let (mu, sigma) = parse_value("VALUE: 18.52 Bq/m3: 2.10 Bq/m3").unwrap();
        assert_eq!(mu, 18.52);
        assert_eq!(sigma, 2.10);
        assert!(parse_value("ERR").unwrap_err().is_malformed());
        assert!(parse_value("VALUE: n/a").unwrap_err().is_malformed());
    }

    fn setup(stabilization_s: f64) -> (RadonPoller, PollContext, crate::persistence::PersistenceReceiver, MockLineConnector) {
        let mut config = MonitorConfig::default();
        config.radon.enabled = true;
        config.radon.stabilization_s = stabilization_s;
        config.radon.response_delay_ms = 0;
        let connector = MockLineConnector::radon(18.5, 2.25);
        let poller = RadonPoller::new(config.radon.clone(), Arc::new(connector.clone()));
        let store = Arc::new(TelemetryStore::new(&catalog(&config), 1).unwrap());
        let (tx, rx) = persistence_queue();
        let (events, _) = broadcast::channel(16);
        (poller, PollContext::new(store, Some(tx), events), rx, connector)
    }

    #[tokio::test]
    async fn measures_after_stabilization() {
        let (mut poller, ctx, mut rx, connector) = setup(0.0);
        poller.connect(&ctx).await.unwrap();
        poller.poll_once(&ctx).await.unwrap();

        assert_eq!(connector.written(), vec!["VALUE?".to_string()]);
        let items = rx.drain_available();
        assert_eq!(items.len(), 1);
        match &items[0].payload {
            Payload::Single(row) => {
                assert_eq!(row[1], SqlValue::Float(18.5));
                assert_eq!(row[2], SqlValue::Float(2.25));
            }
            other => panic!("unexpected payload {other:?}"),
        }

        // Next measurement is a full interval away.
        poller.poll_once(&ctx).await.unwrap();
        assert_eq!(connector.written().len(), 1);
        match ctx.store.latest(DeviceKind::Radon) {
            Some(DeviceReading::Radon(reading)) => {
                assert_eq!(reading.phase, RadonPhase::Measuring);
                assert!(reading.countdown_s > 590);
                assert_eq!(reading.mu, 18.5);
            }
            other => panic!("unexpected reading {other:?}"),
        }
    }

    #[tokio::test]
    async fn stabilizing_does_not_query() {
        let (mut poller, ctx, mut rx, connector) = setup(600.0);
        poller.connect(&ctx).await.unwrap();
        poller.poll_once(&ctx).await.unwrap();
        assert!(connector.written().is_empty());
        assert!(rx.drain_available().is_empty());
        match ctx.store.latest(DeviceKind::Radon) {
            Some(DeviceReading::Radon(reading)) => {
                assert_eq!(reading.phase, RadonPhase::Stabilizing);
                assert!(reading.mu.is_nan());
            }
            other => panic!("unexpected reading {other:?}"),
        }
    }
}
