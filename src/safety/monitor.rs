//! Task that re-evaluates the interlock whenever a fire, VOC or UPS reading
//! lands in the latest cache.

use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::control::CommandSink;
use crate::hardware::DeviceKind;
use crate::pollers::{DashboardEvent, EventStage};
use crate::safety::interlock::{shutdown_requests, SafetyInterlock, SafetyReport};
use crate::telemetry::{DeviceReading, TelemetryStore};

/// Devices whose readings feed the interlock.
pub const SAFETY_INPUTS: [DeviceKind; 3] = [DeviceKind::Fire, DeviceKind::Voc, DeviceKind::Ups];

/// Re-evaluates the interlock whenever a fire, VOC or UPS reading lands.
pub struct SafetyMonitor {
    interlock: SafetyInterlock,
    store: Arc<TelemetryStore>,
    sink: Arc<dyn CommandSink>,
    hv_slots: Vec<(u16, u16)>,
    reports: watch::Sender<SafetyReport>,
}

impl SafetyMonitor {
    /// Monitor sending HV shutdown commands for `hv_slots` through `sink`,
    /// with a receiver of its reports.
    pub fn new(
        interlock: SafetyInterlock,
        store: Arc<TelemetryStore>,
        sink: Arc<dyn CommandSink>,
        hv_slots: Vec<(u16, u16)>,
    ) -> (Self, watch::Receiver<SafetyReport>) {
        let (reports, rx) = watch::channel(SafetyReport::initial());
        (
            Self {
                interlock,
                store,
                sink,
                hv_slots,
                reports,
            },
            rx,
        )
    }

    /// Evaluate against the latest cache, switch HV off if the latch just
    /// set, and publish the report.
    pub async fn evaluate(&mut self) -> SafetyReport {
        let fire = match self.store.latest(DeviceKind::Fire) {
            Some(DeviceReading::Fire(status)) => Some(status),
            _ => None,
        };
        let voc = match self.store.latest(DeviceKind::Voc) {
            Some(DeviceReading::Voc(reading)) => Some(reading),
            _ => None,
        };
        let ups = match self.store.latest(DeviceKind::Ups) {
            Some(DeviceReading::Ups(status)) => Some(status),
            _ => None,
        };

        let report = self
            .interlock
            .observe(fire.as_ref(), voc.as_ref(), ups.as_ref());
        if report.trigger_shutdown {
            self.shutdown_hv().await;
        }
        self.reports.send_replace(report.clone());
        report
    }

    async fn shutdown_hv(&self) {
        let requests = shutdown_requests(&self.hv_slots);
        if requests.is_empty() {
            warn!("UPS shutdown latched but no HV channels are configured");
            return;
        }
        for request in requests {
            let scope = request.scope.to_string();
            match self.sink.dispatch(request).await {
                Ok(outcome) => info!(%scope, ack = %outcome.ack, "HV shutdown applied"),
                Err(err) => error!(%scope, error = %err, "HV shutdown failed"),
            }
        }
    }

    /// Run until `stop` fires or the event channel closes.
    pub async fn run(
        mut self,
        mut events: broadcast::Receiver<DashboardEvent>,
        mut stop: oneshot::Receiver<()>,
    ) {
        info!("Safety monitor started");
        loop {
            tokio::select! {
                _ = &mut stop => break,
                event = events.recv() => match event {
                    Ok(event) if event.stage == EventStage::Raw
                        && SAFETY_INPUTS.contains(&event.device) =>
                    {
                        self.evaluate().await;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Safety monitor lagged, re-evaluating from cache");
                        self.evaluate().await;
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        info!(phase = %self.interlock.phase(), "Safety monitor stopped");
    }

    /// Spawn [`run`](Self::run) on the runtime.
    pub fn spawn(
        self,
        events: broadcast::Receiver<DashboardEvent>,
    ) -> (oneshot::Sender<()>, JoinHandle<()>) {
        let (stop_tx, stop_rx) = oneshot::channel();
        (stop_tx, tokio::spawn(self.run(events, stop_rx)))
    }
}
