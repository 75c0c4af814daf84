//! Single-register Modbus RTU sensors: TH/O2 transmitter, fire detector and
//! VOC (PID) detector.
//!
//! The three share one poller; a [`SensorProfile`] holds what differs:
//! slave id, cadence, register map and the row written to storage.
//! TH/O2 readings are averaged over a window before storage. Fire and VOC
//! samples are stored as read so that short alarms are never lost.

use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{seconds, FireConfig, ThO2Config, VocConfig};
use crate::error::{DeviceError, DeviceResult};
use crate::hardware::modbus::{signed_register, u32_from_registers};
use crate::hardware::{BusConnector, DeviceKind, RegisterBus};
use crate::persistence::record::{round_to, second_timestamp};
use crate::persistence::{PersistenceItem, RecordKind, Row, SqlValue};
use crate::pollers::window::RollingWindow;
use crate::pollers::{DevicePoller, PollContext};
use crate::telemetry::channels::{FIRE, TH_O2, VOC};
use crate::telemetry::reading::{FireStatus, ThO2Reading, VocReading};
use crate::telemetry::DeviceReading;

/// First holding register reference number.
const HOLDING_BASE: u16 = 40001;
const VOC_CONCENTRATION: u16 = 8;
const VOC_ALARM: u16 = 34;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Model {
    ThO2,
    Fire { address: u16 },
    Voc { scale: f64 },
}

/// Register map and cadence of one sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorProfile {
    kind: DeviceKind,
    unit: u8,
    interval: Duration,
    /// `None` stores every sample.
    window: Option<Duration>,
    model: Model,
}

impl SensorProfile {
    /// Temperature, humidity and oxygen transmitter, windowed.
    pub fn th_o2(config: &ThO2Config) -> Self {
        Self {
            kind: DeviceKind::ThO2,
            unit: config.modbus_id,
            interval: seconds(config.interval_s),
            window: Some(seconds(config.window_s)),
            model: Model::ThO2,
        }
    }

    /// Fire panel status word, stored as read.
    pub fn fire(config: &FireConfig) -> Self {
        Self {
            kind: DeviceKind::Fire,
            unit: config.slave_id,
            interval: seconds(config.interval_s),
            window: None,
            model: Model::Fire {
                address: config.status_register.saturating_sub(HOLDING_BASE),
            },
        }
    }

    /// VOC transmitter, stored as read.
    pub fn voc(config: &VocConfig) -> Self {
        Self {
            kind: DeviceKind::Voc,
            unit: config.slave_id,
            interval: seconds(config.interval_s),
            window: None,
            model: Model::Voc {
                scale: config.scale_factor,
            },
        }
    }

    /// Device described by this profile.
    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    fn channel(&self) -> &'static str {
        match self.model {
            Model::ThO2 => TH_O2,
            Model::Fire { .. } => FIRE,
            Model::Voc { .. } => VOC,
        }
    }

    fn record_kind(&self) -> RecordKind {
        match self.model {
            Model::ThO2 => RecordKind::ThO2,
            Model::Fire { .. } => RecordKind::Fire,
            Model::Voc { .. } => RecordKind::Voc,
        }
    }

    /// Read and decode one sample.
    async fn read(&self, bus: &mut dyn RegisterBus) -> DeviceResult<DeviceReading> {
        match self.model {
            Model::ThO2 => {
                let regs = bus.read_holding_registers(self.unit, 0, 3).await?;
                let &[humidity, temperature, oxygen] = regs.as_slice() else {
                    return Err(short_read(3, regs.len()));
                };
                Ok(DeviceReading::ThO2(ThO2Reading {
                    temperature_c: f64::from(signed_register(temperature)) / 10.0,
                    humidity_pct: f64::from(humidity) / 10.0,
                    oxygen_pct: f64::from(oxygen) / 10.0,
                }))
            }
            Model::Fire { address } => {
                let regs = bus.read_holding_registers(self.unit, address, 1).await?;
                let code = *regs.first().ok_or_else(|| short_read(1, 0))?;
                Ok(DeviceReading::Fire(FireStatus::decode(code)))
            }
            Model::Voc { scale } => {
                let conc = bus
                    .read_holding_registers(self.unit, VOC_CONCENTRATION, 2)
                    .await?;
                let alarm_regs = bus.read_holding_registers(self.unit, VOC_ALARM, 1).await?;
                let (&[high, low], Some(&alarm)) = (conc.as_slice(), alarm_regs.first()) else {
                    return Err(short_read(3, conc.len() + alarm_regs.len()));
                };
                if scale == 0.0 {
                    return Err(DeviceError::Malformed("VOC scale factor is zero".to_string()));
                }
                Ok(DeviceReading::Voc(VocReading {
                    concentration_ppm: f64::from(u32_from_registers(high, low)) / scale,
                    alarm,
                }))
            }
        }
    }
}

fn short_read(expected: usize, actual: usize) -> DeviceError {
    DeviceError::Malformed(format!("expected {expected} registers, got {actual}"))
}

/// Ring-buffer values of a reading.
fn values(reading: &DeviceReading) -> Vec<f64> {
    match reading {
        DeviceReading::ThO2(r) => vec![r.temperature_c, r.humidity_pct, r.oxygen_pct],
        DeviceReading::Fire(s) => vec![f64::from(s.status_code)],
        DeviceReading::Voc(r) => vec![r.concentration_ppm],
        _ => Vec::new(),
    }
}

/// Dashboard reading of a TH/O2 window mean.
fn averaged(latest: &DeviceReading, mean: &[f64]) -> DeviceReading {
    let at = |i: usize| mean.get(i).copied().unwrap_or(f64::NAN);
    match latest {
        DeviceReading::ThO2(_) => DeviceReading::ThO2(ThO2Reading {
            temperature_c: at(0),
            humidity_pct: at(1),
            oxygen_pct: at(2),
        }),
        other => other.clone(),
    }
}

/// Storage row of a raw sample.
fn row(timestamp: DateTime<Local>, reading: &DeviceReading) -> Row {
    let mut row = vec![SqlValue::from(second_timestamp(timestamp))];
    match reading {
        DeviceReading::ThO2(r) => row.extend([
            SqlValue::from(round_to(r.temperature_c, 2)),
            SqlValue::from(round_to(r.humidity_pct, 2)),
            SqlValue::from(round_to(r.oxygen_pct, 2)),
        ]),
        DeviceReading::Fire(s) => row.extend([
            SqlValue::from(s.status_code),
            SqlValue::from(s.is_fire),
            SqlValue::from(s.is_fault),
        ]),
        DeviceReading::Voc(r) => row.extend([
            SqlValue::from(round_to(r.concentration_ppm, 3)),
            SqlValue::from(r.alarm),
            SqlValue::from("ppm"),
        ]),
        _ => {}
    }
    row
}

/// Poller for one Modbus RTU sensor described by a [`SensorProfile`].
pub struct ModbusSensorPoller {
    profile: SensorProfile,
    connector: Arc<dyn BusConnector>,
    bus: Option<Box<dyn RegisterBus>>,
    window: Option<RollingWindow>,
}

impl ModbusSensorPoller {
    /// Poller for `profile` on the bus opened by `connector`.
    pub fn new(profile: SensorProfile, connector: Arc<dyn BusConnector>) -> Self {
        let window = profile
            .window
            .map(|span| RollingWindow::covering(span, profile.interval));
        Self {
            profile,
            connector,
            bus: None,
            window,
        }
    }
}

#[async_trait]
impl DevicePoller for ModbusSensorPoller {
    fn kind(&self) -> DeviceKind {
        self.profile.kind
    }

    fn poll_interval(&self) -> Duration {
        self.profile.interval
    }

    fn is_connected(&self) -> bool {
        self.bus.is_some()
    }

    async fn connect(&mut self, _ctx: &PollContext) -> DeviceResult<()> {
        self.bus = Some(self.connector.open().await?);
        if let Some(window) = self.window.as_mut() {
            window.clear();
        }
        Ok(())
    }

    async fn poll_once(&mut self, ctx: &PollContext) -> DeviceResult<()> {
        let bus = self.bus.as_mut().ok_or(DeviceError::NotConnected)?;
        let timestamp = Local::now();
        let reading = self.profile.read(bus.as_mut()).await?;
        let kind = self.profile.kind;
        ctx.publish_raw(kind, timestamp, reading.clone());

        let raw = values(&reading);
        let (series, shown) = match self.window.as_mut() {
            Some(window) => match window.push(&raw) {
                Some(mean) => {
                    let shown = averaged(&reading, &mean);
                    (mean, shown)
                }
                None => return Ok(()),
            },
            None => (raw, reading.clone()),
        };
        ctx.publish_average(kind, self.profile.channel(), timestamp, &series, shown);
        ctx.persist(PersistenceItem::single(
            self.profile.record_kind(),
            row(timestamp, &reading),
        ));
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.bus = None;
    }

    fn gap_channels(&self) -> Vec<String> {
        vec![self.profile.channel().to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::hardware::mock::MockBusConnector;
    use crate::persistence::{persistence_queue, Payload, PersistenceReceiver};
    use crate::telemetry::channels::catalog;
    use crate::telemetry::TelemetryStore;
    use tokio::sync::broadcast;

    fn context(config: &MonitorConfig) -> (PollContext, PersistenceReceiver) {
        let store = Arc::new(TelemetryStore::new(&catalog(config), 1).unwrap());
        let (tx, rx) = persistence_queue();
        let (events, _) = broadcast::channel(16);
        (PollContext::new(store, Some(tx), events), rx)
    }

    fn single_row(rx: &mut PersistenceReceiver) -> Row {
        let mut items = rx.drain_available();
        assert_eq!(items.len(), 1);
        match items.remove(0).payload {
            Payload::Single(row) => row,
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn th_o2_decodes_signed_temperature() {
        let mut config = MonitorConfig::default();
        config.th_o2.enabled = true;
        config.th_o2.window_s = 1.0;
        let bus = MockBusConnector::th_o2(1);
        bus.set_holding(1, 0, &[450, 0xFF38, 209]);
        let mut poller =
            ModbusSensorPoller::new(SensorProfile::th_o2(&config.th_o2), Arc::new(bus));
        let (ctx, mut rx) = context(&config);

        poller.connect(&ctx).await.unwrap();
        poller.poll_once(&ctx).await.unwrap();

        let row = single_row(&mut rx);
        assert_eq!(row[1], SqlValue::Float(-20.0));
        assert_eq!(row[2], SqlValue::Float(45.0));
        assert_eq!(row[3], SqlValue::Float(20.9));
    }

    #[tokio::test]
    async fn fire_reads_configured_register() {
        let mut config = MonitorConfig::default();
        config.fire.enabled = true;
        config.fire.status_register = 40003;
        let bus = MockBusConnector::new();
        bus.set_holding(1, 2, &[0x05]);
        let mut poller = ModbusSensorPoller::new(SensorProfile::fire(&config.fire), Arc::new(bus));
        let (ctx, mut rx) = context(&config);

        poller.connect(&ctx).await.unwrap();
        poller.poll_once(&ctx).await.unwrap();

        let row = single_row(&mut rx);
        assert_eq!(
            row[1..],
            [SqlValue::Int(5), SqlValue::Bool(true), SqlValue::Bool(true)]
        );
        assert_eq!(
            ctx.store.latest(DeviceKind::Fire),
            Some(DeviceReading::Fire(FireStatus::decode(5)))
        );
    }

    #[tokio::test]
    async fn short_fire_alarm_is_stored() {
        let mut config = MonitorConfig::default();
        config.fire.enabled = true;
        let bus = MockBusConnector::new();
        let mut poller =
            ModbusSensorPoller::new(SensorProfile::fire(&config.fire), Arc::new(bus.clone()));
        let (ctx, mut rx) = context(&config);
        poller.connect(&ctx).await.unwrap();

        bus.set_holding(1, 0, &[0x04]);
        for _ in 0..3 {
            poller.poll_once(&ctx).await.unwrap();
        }
        bus.set_holding(1, 0, &[0x00]);
        for _ in 0..30 {
            poller.poll_once(&ctx).await.unwrap();
        }

        let rows: Vec<Row> = rx
            .drain_available()
            .into_iter()
            .map(|item| match item.payload {
                Payload::Single(row) => row,
                other => panic!("unexpected payload {other:?}"),
            })
            .collect();
        assert_eq!(rows.len(), 33);
        let alarms = rows
            .iter()
            .filter(|row| row[1] == SqlValue::Int(4) && row[2] == SqlValue::Bool(true))
            .count();
        assert_eq!(alarms, 3);

        let codes = ctx.store.snapshot(FIRE).unwrap();
        let codes: Vec<f64> = codes
            .column("status_code")
            .unwrap()
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .collect();
        assert_eq!(codes.len(), 33);
        assert!(codes.iter().all(|&c| c == 4.0 || c == 0.0));
        assert_eq!(codes.last(), Some(&0.0));
    }

    #[tokio::test]
    async fn voc_stores_every_sample() {
        let mut config = MonitorConfig::default();
        config.voc.enabled = true;
        config.voc.interval_s = 1.0;
        let bus = MockBusConnector::voc_detector(2, 1.0, 1000.0);
        let mut poller =
            ModbusSensorPoller::new(SensorProfile::voc(&config.voc), Arc::new(bus.clone()));
        let (ctx, mut rx) = context(&config);

        poller.connect(&ctx).await.unwrap();
        poller.poll_once(&ctx).await.unwrap();
        let row = single_row(&mut rx);
        assert_eq!(row[1], SqlValue::Float(1.0));
        assert_eq!(row[2], SqlValue::Int(0));

        bus.set_voc(2, 70.5, 1000.0, 1);
        poller.poll_once(&ctx).await.unwrap();

        let row = single_row(&mut rx);
        assert_eq!(row[1], SqlValue::Float(70.5));
        assert_eq!(row[2], SqlValue::Int(1));
        assert_eq!(row[3], SqlValue::Text("ppm".into()));

        let snapshot = ctx.store.snapshot(VOC).unwrap();
        let conc = snapshot.column("concentration").unwrap();
        assert!(conc.contains(&1.0));
        assert!(conc.contains(&70.5));
    }

    #[tokio::test]
    async fn missing_register_is_reported() {
        let config = MonitorConfig::default();
        let mut poller = ModbusSensorPoller::new(
            SensorProfile::voc(&config.voc),
            Arc::new(MockBusConnector::new()),
        );
        let (ctx, _rx) = context(&config);
        poller.connect(&ctx).await.unwrap();
        let err = poller.poll_once(&ctx).await.unwrap_err();
        assert!(matches!(err, DeviceError::Rejected(_)));
    }
}
