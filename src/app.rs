//! Application wiring: startup of every task and the ordered shutdown.
//!
//! ```text
//!   pollers ──> TelemetryStore <── HV sampler
//!      │  └───> broadcast<DashboardEvent> ──> SafetyMonitor ──> CommandDispatcher
//!      └──────> PersistenceQueue ──> BatchPersistenceWriter ──> backend
//! ```
//!
//! Shutdown order: background tasks, then every poller is signalled and
//! joined with a bounded timeout, then the writer flushes once more and
//! closes the pool, and only then are device handles closed.

use chrono::Local;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::MonitorConfig;
use crate::control::{CommandDispatcher, CommandSink, ControlLayout};
use crate::error::{AppResult, MonitorError};
use crate::hardware::{DeviceKind, DriverRegistry};
use crate::persistence::{
    persistence_queue, BatchPersistenceWriter, FlushReport, MySqlBackend, PersistenceBackend,
};
use crate::pollers::{
    build_poller, spawn_poller, DashboardEvent, ErrorPolicy, PollContext, PollerHandle,
    EVENT_CAPACITY,
};
use crate::safety::{SafetyInterlock, SafetyMonitor, SafetyReport};
use crate::telemetry::{epoch_seconds, TelemetryStore};

/// A spawned helper task with its stop trigger.
struct BackgroundTask<T> {
    name: &'static str,
    stop: oneshot::Sender<()>,
    task: JoinHandle<T>,
}

impl<T> BackgroundTask<T> {
    async fn stop_and_join(self, timeout: Duration) -> AppResult<T> {
        let _ = self.stop.send(());
        let abort = self.task.abort_handle();
        match tokio::time::timeout(timeout, self.task).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(join_err)) => Err(MonitorError::TaskFailed {
                task: self.name.to_string(),
                reason: join_err.to_string(),
            }),
            Err(_) => {
                abort.abort();
                Err(MonitorError::TaskFailed {
                    task: self.name.to_string(),
                    reason: format!("did not stop within {timeout:?}"),
                })
            }
        }
    }
}

/// What a clean shutdown did.
#[derive(Debug, Default)]
pub struct ShutdownSummary {
    /// Pollers joined and closed, in start order.
    pub stopped: Vec<DeviceKind>,
    /// Result of the writer's final flush, when persistence was on.
    pub final_flush: Option<FlushReport>,
}

/// A running monitor: pollers, writer, sampler and safety monitor.
pub struct MonitorApp {
    config: Arc<MonitorConfig>,
    store: Arc<TelemetryStore>,
    events: broadcast::Sender<DashboardEvent>,
    dispatcher: Arc<CommandDispatcher>,
    safety: watch::Receiver<SafetyReport>,
    pollers: Vec<PollerHandle>,
    writer: Option<BackgroundTask<AppResult<FlushReport>>>,
    sampler: Option<BackgroundTask<()>>,
    monitor: BackgroundTask<()>,
}

impl MonitorApp {
    /// Open the database pool when persistence is enabled.
    ///
    /// A pool that cannot be opened disables persistence instead of failing
    /// the whole process.
    pub async fn connect_backend(config: &MonitorConfig) -> Option<Arc<dyn PersistenceBackend>> {
        if !config.database.enabled {
            info!("Database disabled, samples will not be stored");
            return None;
        }
        match MySqlBackend::connect(&config.database).await {
            Ok(backend) => Some(Arc::new(backend)),
            Err(err) => {
                error!(error = %err, "Database unavailable, persistence disabled");
                None
            }
        }
    }

    /// Connect the database and start everything.
    pub async fn start(config: Arc<MonitorConfig>, registry: &DriverRegistry) -> AppResult<Self> {
        let backend = Self::connect_backend(&config).await;
        Self::start_with_backend(config, registry, backend)
    }

    /// Start with an explicit persistence backend, `None` to run without one.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start_with_backend(
        config: Arc<MonitorConfig>,
        registry: &DriverRegistry,
        backend: Option<Arc<dyn PersistenceBackend>>,
    ) -> AppResult<Self> {
        config.validate()?;
        info!(app = %config.application.name, "Starting monitor");

        let store = Arc::new(TelemetryStore::from_config(&config)?);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let safety_events = events.subscribe();

        let (persistence, writer) = match backend {
            Some(backend) => {
                let (tx, rx) = persistence_queue();
                let writer = BatchPersistenceWriter::new(backend, rx, &config.database);
                let (stop, stop_rx) = oneshot::channel();
                let task = tokio::spawn(writer.run(stop_rx));
                (
                    Some(tx),
                    Some(BackgroundTask {
                        name: "db-writer",
                        stop,
                        task,
                    }),
                )
            }
            None => (None, None),
        };

        let base = PollContext::new(Arc::clone(&store), persistence, events.clone());
        let policy = ErrorPolicy::from_config(&config.polling);
        let mut dispatcher = CommandDispatcher::new(ControlLayout::from_config(&config));
        let mut pollers = Vec::new();

        for kind in DeviceKind::ALL {
            if !kind.is_enabled(&config) {
                continue;
            }
            match build_poller(kind, &config, registry) {
                Ok(poller) => {
                    let handle = spawn_poller(poller, base.for_poller(), policy.clone());
                    if kind.is_controllable() {
                        dispatcher.register(kind, handle.control());
                    }
                    info!(device = %kind, "Poller started");
                    pollers.push(handle);
                }
                Err(err) => warn!(device = %kind, error = %err, "Device disabled"),
            }
        }
        drop(base);

        let dispatcher = Arc::new(dispatcher);
        let hv_slots = if config.caen_hv.enabled {
            config.caen_hv.slots()
        } else {
            Vec::new()
        };

        let sampler = (!hv_slots.is_empty()).then(|| {
            spawn_hv_sampler(
                Arc::clone(&store),
                hv_slots.clone(),
                config.shutdown.hv_sample_period,
            )
        });

        let sink: Arc<dyn CommandSink> = dispatcher.clone();
        let (monitor, safety) = SafetyMonitor::new(
            SafetyInterlock::new(config.safety.clone()),
            Arc::clone(&store),
            sink,
            hv_slots,
        );
        let (stop, task) = monitor.spawn(safety_events);

        info!(pollers = pollers.len(), "Monitor running");
        Ok(Self {
            config,
            store,
            events,
            dispatcher,
            safety,
            pollers,
            writer,
            sampler,
            monitor: BackgroundTask {
                name: "safety-monitor",
                stop,
                task,
            },
        })
    }

    /// The validated configuration the app was started with.
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Shared handle to the live telemetry.
    pub fn store(&self) -> Arc<TelemetryStore> {
        Arc::clone(&self.store)
    }

    /// Live dashboard updates.
    pub fn subscribe(&self) -> broadcast::Receiver<DashboardEvent> {
        self.events.subscribe()
    }

    /// Entry point for control requests.
    pub fn dispatcher(&self) -> Arc<CommandDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Latest safety report.
    pub fn safety(&self) -> watch::Receiver<SafetyReport> {
        self.safety.clone()
    }

    /// Devices with a running poller.
    pub fn running_devices(&self) -> Vec<DeviceKind> {
        self.pollers.iter().map(PollerHandle::kind).collect()
    }

    /// Whether a database writer is running.
    pub fn is_persisting(&self) -> bool {
        self.writer.is_some()
    }

    /// Stop everything in order. Every step runs even when an earlier one
    /// failed; the failures are returned together.
    pub async fn shutdown(self) -> AppResult<ShutdownSummary> {
        let join_timeout = self.config.shutdown.join_timeout;
        let mut failures = Vec::new();
        let mut summary = ShutdownSummary::default();
        info!("Shutting down");

        if let Some(sampler) = self.sampler {
            if let Err(err) = sampler.stop_and_join(join_timeout).await {
                failures.push(err);
            }
        }
        if let Err(err) = self.monitor.stop_and_join(join_timeout).await {
            failures.push(err);
        }

        for handle in &self.pollers {
            handle.stop();
        }
        let joined = join_all(self.pollers.into_iter().map(|h| h.join(join_timeout))).await;
        let mut stopped = Vec::with_capacity(joined.len());
        for result in joined {
            match result {
                Ok(poller) => stopped.push(poller),
                Err(err) => failures.push(err),
            }
        }

        if let Some(writer) = self.writer {
            match writer.stop_and_join(join_timeout).await {
                Ok(Ok(report)) => {
                    info!(items = report.items, rows = report.rows, "Final flush done");
                    summary.final_flush = Some(report);
                }
                Ok(Err(err)) | Err(err) => failures.push(err),
            }
        }

        for mut poller in stopped {
            let kind = poller.kind();
            poller.disconnect().await;
            debug!(device = %kind, "Device closed");
            summary.stopped.push(kind);
        }

        if failures.is_empty() {
            info!("Shutdown complete");
            Ok(summary)
        } else {
            error!(failures = failures.len(), "Shutdown finished with errors");
            Err(MonitorError::ShutdownFailed(failures))
        }
    }
}

/// Copy the cached HV readings into the per-board history every `period`.
fn spawn_hv_sampler(
    store: Arc<TelemetryStore>,
    slots: Vec<(u16, u16)>,
    period: Duration,
) -> BackgroundTask<()> {
    let (stop, mut stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                _ = ticker.tick() => {
                    let rows = store.sample_cross_section(&slots, epoch_seconds(Local::now()));
                    debug!(rows, "HV cross-section sampled");
                }
            }
        }
    });
    BackgroundTask {
        name: "hv-sampler",
        stop,
        task,
    }
}
