//! Multi-channel analog acquisition: RTD temperatures and distance sensors.
//!
//! One continuous task covers every configured module. Each poll blocks on a
//! blocking thread for one second of samples (`sampling_rate` per channel),
//! so the poll interval is zero and the hardware sets the cadence. Stopping
//! the poller closes the task through its [`TaskCloser`], which makes the
//! pending read return at once.

use async_trait::async_trait;
use chrono::Local;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{parse_serial_number, DaqConfig, DaqTaskType, DistanceMapping};
use crate::error::{DeviceError, DeviceResult};
use crate::hardware::{
    AcquisitionPlan, AnalogConnector, AnalogTask, DaqModuleInfo, DeviceKind, TaskCloser,
};
use crate::persistence::record::{round_to, second_timestamp};
use crate::persistence::{PersistenceItem, RecordKind, SqlValue};
use crate::pollers::window::{finite_mean, RollingWindow};
use crate::pollers::{DevicePoller, PollContext};
use crate::telemetry::channels::LS;
use crate::telemetry::reading::AnalogReading;
use crate::telemetry::DeviceReading;

/// Channel layout of an open task.
#[derive(Debug, Clone, Default)]
struct Layout {
    rtd: usize,
    /// One mapping per voltage channel, `None` when uncalibrated.
    mappings: Vec<Option<DistanceMapping>>,
}

/// Continuous RTD and voltage acquisition on the analog chassis.
pub struct AnalogPoller {
    config: DaqConfig,
    connector: Arc<dyn AnalogConnector>,
    task: Option<Box<dyn AnalogTask>>,
    closer: Option<Arc<dyn TaskCloser>>,
    layout: Layout,
    window: RollingWindow,
}

impl AnalogPoller {
    /// Poller for the modules in `config`.
    pub fn new(config: DaqConfig, connector: Arc<dyn AnalogConnector>) -> Self {
        let window = RollingWindow::new(config.window_samples);
        Self {
            config,
            connector,
            task: None,
            closer: None,
            layout: Layout::default(),
            window,
        }
    }

    /// Match configured modules against the discovered ones by serial number.
    fn plan(&self, found: &[DaqModuleInfo]) -> DeviceResult<(AcquisitionPlan, Layout)> {
        let mut plan = AcquisitionPlan {
            rtd_channels: Vec::new(),
            volt_channels: Vec::new(),
            sampling_rate: self.config.sampling_rate,
        };
        let mut mappings = Vec::new();

        for module in &self.config.modules {
            let serial = parse_serial_number(&module.serial_number);
            let Some(info) = found.iter().find(|m| Some(m.serial_number) == serial) else {
                warn!(
                    role = %module.role,
                    serial = %module.serial_number,
                    "Configured DAQ module not found"
                );
                continue;
            };
            let paths = module
                .channels
                .iter()
                .map(|ch| format!("{}/{}", info.device_name, ch));
            match module.task_type {
                DaqTaskType::Rtd => plan.rtd_channels.extend(paths),
                DaqTaskType::Volt => {
                    plan.volt_channels.extend(paths);
                    mappings.extend(
                        (0..module.channels.len()).map(|i| module.mapping.get(i).copied()),
                    );
                }
            }
        }

        if plan.channel_count() == 0 {
            return Err(DeviceError::Open(
                "No DAQ modules specified in the config were found".to_string(),
            ));
        }
        let layout = Layout {
            rtd: plan.rtd_channels.len(),
            mappings,
        };
        Ok((plan, layout))
    }
}

/// Split one sample row into the dashboard reading.
fn reading_from(layout: &Layout, values: &[f64]) -> AnalogReading {
    let (rtd, volt) = values.split_at(layout.rtd.min(values.len()));
    let distance_mm = volt
        .iter()
        .zip(layout.mappings.iter())
        .map(|(v, mapping)| mapping.map_or(f64::NAN, |m| m.convert(*v)))
        .collect();
    AnalogReading {
        rtd: rtd.to_vec(),
        volt: volt.to_vec(),
        distance_mm,
    }
}

fn nth(values: &[f64], index: usize) -> f64 {
    values.get(index).copied().unwrap_or(f64::NAN)
}

/// `[RTD_1, RTD_2, DIST_1, DIST_2]` of the `LS` channel.
fn ls_row(reading: &AnalogReading) -> [f64; 4] {
    [
        nth(&reading.rtd, 0),
        nth(&reading.rtd, 1),
        nth(&reading.distance_mm, 0),
        nth(&reading.distance_mm, 1),
    ]
}

#[async_trait]
impl DevicePoller for AnalogPoller {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Daq
    }

    fn poll_interval(&self) -> Duration {
        Duration::ZERO
    }

    fn is_connected(&self) -> bool {
        self.task.is_some()
    }

    async fn connect(&mut self, ctx: &PollContext) -> DeviceResult<()> {
        let connector = Arc::clone(&self.connector);
        let found = tokio::task::spawn_blocking(move || connector.discover())
            .await
            .map_err(|e| DeviceError::Open(e.to_string()))??;
        let (plan, layout) = self.plan(&found)?;

        let connector = Arc::clone(&self.connector);
        let open_plan = plan.clone();
        let task = tokio::task::spawn_blocking(move || connector.open(&open_plan))
            .await
            .map_err(|e| DeviceError::Open(e.to_string()))??;

        let closer = task.closer();
        ctx.stop.set_closer(Arc::clone(&closer));
        info!(
            rtd = plan.rtd_channels.len(),
            volt = plan.volt_channels.len(),
            rate = plan.sampling_rate,
            "DAQ task started"
        );
        self.task = Some(task);
        self.closer = Some(closer);
        self.layout = layout;
        self.window.clear();
        Ok(())
    }

    async fn poll_once(&mut self, ctx: &PollContext) -> DeviceResult<()> {
        let mut task = self.task.take().ok_or(DeviceError::NotConnected)?;
        let samples = self.config.sampling_rate.max(1) as usize;
        let (task, result) = tokio::task::spawn_blocking(move || {
            let result = task.read(samples);
            (task, result)
        })
        .await
        .map_err(|e| DeviceError::Transport(format!("acquisition thread failed: {e}")))?;
        self.task = Some(task);
        let blocks = result?;

        let now = Local::now();
        let means: Vec<f64> = blocks
            .iter()
            .map(|block| finite_mean(block.iter().copied()))
            .collect();
        let raw = reading_from(&self.layout, &means);
        let raw_row = ls_row(&raw);
        ctx.publish_raw(DeviceKind::Daq, now, DeviceReading::Analog(raw));

        if let Some(averaged) = self.window.push(&means) {
            let reading = reading_from(&self.layout, &averaged);
            let row = ls_row(&reading);
            ctx.publish_average(DeviceKind::Daq, LS, now, &row, DeviceReading::Analog(reading));
            ctx.persist(PersistenceItem::single(
                RecordKind::Daq,
                vec![
                    SqlValue::from(second_timestamp(now)),
                    SqlValue::from(round_to(raw_row[0], 2)),
                    SqlValue::from(round_to(raw_row[1], 2)),
                    SqlValue::from(round_to(raw_row[2], 1)),
                    SqlValue::from(round_to(raw_row[3], 1)),
                ],
            ));
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(closer) = self.closer.take() {
            closer.close();
        }
        if self.task.take().is_some() {
            info!("DAQ task closed");
        }
        self.window.clear();
    }

    fn gap_channels(&self) -> Vec<String> {
        vec![LS.to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaqModuleConfig;
    use crate::hardware::mock::MockAnalogConnector;
    use crate::persistence::{persistence_queue, Payload};
    use crate::telemetry::channels::catalog;
    use crate::telemetry::TelemetryStore;
    use tokio::sync::broadcast;

    fn daq_config() -> DaqConfig {
        DaqConfig {
            enabled: true,
            sampling_rate: 10,
            window_samples: 2,
            modules: vec![
                DaqModuleConfig {
                    role: "rtd".into(),
                    serial_number: "0x1A2B".into(),
                    task_type: DaqTaskType::Rtd,
                    channels: vec!["ai0".into(), "ai1".into()],
                    mapping: Vec::new(),
                },
                DaqModuleConfig {
                    role: "distance".into(),
                    serial_number: "3C4D".into(),
                    task_type: DaqTaskType::Volt,
                    channels: vec!["ai0".into(), "ai1".into()],
                    mapping: vec![
                        DistanceMapping {
                            volt_range: [0.0, 10.0],
                            dist_range_mm: [0.0, 100.0],
                        },
                        DistanceMapping {
                            volt_range: [1.0, 5.0],
                            dist_range_mm: [10.0, 50.0],
                        },
                    ],
                },
            ],
        }
    }

    fn modules() -> Vec<DaqModuleInfo> {
        vec![
            DaqModuleInfo {
                serial_number: 0x1A2B,
                device_name: "cDAQ1Mod1".into(),
            },
            DaqModuleInfo {
                serial_number: 0x3C4D,
                device_name: "cDAQ1Mod2".into(),
            },
        ]
    }

    fn context() -> (PollContext, crate::persistence::PersistenceReceiver) {
        let mut config = crate::config::MonitorConfig::default();
        config.daq.enabled = true;
        let store = Arc::new(TelemetryStore::new(&catalog(&config), 1).unwrap());
        let (tx, rx) = persistence_queue();
        let (events, _) = broadcast::channel(16);
        (PollContext::new(store, Some(tx), events), rx)
    }

    #[tokio::test]
    async fn converts_and_persists_raw_sample_per_window() {
        let connector = MockAnalogConnector::new(modules(), Duration::from_millis(5));
        connector.set_levels(vec![21.25, 22.0, 2.5, 3.0]);
        let mut poller = AnalogPoller::new(daq_config(), Arc::new(connector.clone()));
        let (ctx, mut rx) = context();

        poller.connect(&ctx).await.unwrap();
        assert!(poller.is_connected());
        poller.poll_once(&ctx).await.unwrap();
        assert!(rx.is_empty());

        match ctx.store.latest(DeviceKind::Daq) {
            Some(DeviceReading::Analog(reading)) => {
                assert_eq!(reading.rtd, vec![21.25, 22.0]);
                assert_eq!(reading.distance_mm, vec![25.0, 30.0]);
            }
            other => panic!("unexpected reading {other:?}"),
        }

        poller.poll_once(&ctx).await.unwrap();
        let items = rx.drain_available();
        assert_eq!(items.len(), 1);
        match &items[0].payload {
            Payload::Single(row) => {
                assert_eq!(row[1], SqlValue::Float(21.25));
                assert_eq!(row[3], SqlValue::Float(25.0));
            }
            other => panic!("unexpected payload {other:?}"),
        }
        let snapshot = ctx.store.snapshot(LS).unwrap();
        assert!(snapshot.column("DIST_2").unwrap().contains(&30.0));
    }

    #[tokio::test]
    async fn connect_fails_when_no_module_matches() {
        let connector = MockAnalogConnector::new(Vec::new(), Duration::from_millis(5));
        let mut poller = AnalogPoller::new(daq_config(), Arc::new(connector));
        let (ctx, _rx) = context();
        let err = poller.connect(&ctx).await.unwrap_err();
        assert!(matches!(err, DeviceError::Open(_)));
        assert!(!poller.is_connected());
    }

    #[tokio::test]
    async fn stop_unblocks_pending_read() {
        let connector = MockAnalogConnector::new(modules(), Duration::from_secs(30));
        let mut poller = AnalogPoller::new(daq_config(), Arc::new(connector));
        let (ctx, _rx) = context();
        poller.connect(&ctx).await.unwrap();

        let stop = ctx.stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            stop.stop();
        });
        let result = tokio::time::timeout(Duration::from_secs(5), poller.poll_once(&ctx))
            .await
            .expect("read should return once the task is closed");
        assert_eq!(result, Err(DeviceError::Closed));
    }
}
