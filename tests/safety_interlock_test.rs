//! End-to-end interlock tests: real pollers on mock drivers, the dispatcher
//! and the safety monitor wired the way the app wires them.

use lab_monitor::config::MonitorConfig;
use lab_monitor::control::{CommandDispatcher, CommandRequest, ControlLayout};
use lab_monitor::hardware::mock::{MockBusConnector, MockHvConnector, MockUpsConnector};
use lab_monitor::hardware::{DeviceKind, ParamValue};
use lab_monitor::pollers::hv::HvPoller;
use lab_monitor::pollers::modbus_sensors::{ModbusSensorPoller, SensorProfile};
use lab_monitor::pollers::ups::UpsPoller;
use lab_monitor::pollers::{spawn_poller, ErrorPolicy, PollContext, PollerHandle, EVENT_CAPACITY};
use lab_monitor::safety::{SafetyInterlock, SafetyMonitor, SafetyPhase, SafetyReport};
use lab_monitor::telemetry::TelemetryStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

const CONFIG: &str = r#"
    [safety]
    warning_ppm = 10.0
    critical_ppm = 50.0
    shutdown_threshold_min = 5.0

    [ups]
    enabled = true
    interval_s = 5.0
    window_s = 60.0

    [voc]
    enabled = true
    port = "/dev/ttyVOC"
    slave_id = 3
    interval_s = 1.0

    [caen_hv]
    enabled = true
    polling_interval_ms = 1000
    persist_every_polls = 60

    [caen_hv.crate_map.0]
    channels = 2
    description = "PMT"
"#;

struct Rig {
    ups: MockUpsConnector,
    hv: MockHvConnector,
    voc: MockBusConnector,
    voc_scale: f64,
    dispatcher: CommandDispatcher,
    reports: watch::Receiver<SafetyReport>,
    pollers: Vec<PollerHandle>,
    monitor_stop: tokio::sync::oneshot::Sender<()>,
    monitor_task: tokio::task::JoinHandle<()>,
}

fn start_rig() -> Rig {
    let config: MonitorConfig = toml::from_str(CONFIG).expect("Failed to parse config");
    let store = Arc::new(TelemetryStore::from_config(&config).expect("Failed to build store"));
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    let ctx = PollContext::new(Arc::clone(&store), None, events.clone());

    let ups = MockUpsConnector::online();
    let hv = MockHvConnector::new(&config.caen_hv.slots());
    let voc = MockBusConnector::voc_detector(config.voc.slave_id, 0.5, config.voc.scale_factor);

    let safety_events = events.subscribe();
    let hv_handle = spawn_poller(
        Box::new(HvPoller::new(config.caen_hv.clone(), Arc::new(hv.clone()))),
        ctx.for_poller(),
        ErrorPolicy::default(),
    );
    let mut dispatcher = CommandDispatcher::new(ControlLayout::from_config(&config));
    dispatcher.register(DeviceKind::CaenHv, hv_handle.control());

    let ups_handle = spawn_poller(
        Box::new(UpsPoller::new(config.ups.clone(), Arc::new(ups.clone()))),
        ctx.for_poller(),
        ErrorPolicy::default(),
    );
    let voc_handle = spawn_poller(
        Box::new(ModbusSensorPoller::new(
            SensorProfile::voc(&config.voc),
            Arc::new(voc.clone()),
        )),
        ctx.for_poller(),
        ErrorPolicy::default(),
    );

    let (monitor, reports) = SafetyMonitor::new(
        SafetyInterlock::new(config.safety.clone()),
        store,
        Arc::new(dispatcher.clone()),
        config.caen_hv.slots(),
    );
    let (monitor_stop, monitor_task) = monitor.spawn(safety_events);

    Rig {
        ups,
        hv,
        voc,
        voc_scale: config.voc.scale_factor,
        dispatcher,
        reports,
        pollers: vec![hv_handle, ups_handle, voc_handle],
        monitor_stop,
        monitor_task,
    }
}

impl Rig {
    async fn wait_for(&mut self, what: &str, accept: impl Fn(&SafetyReport) -> bool) {
        let reports = &mut self.reports;
        tokio::time::timeout(Duration::from_secs(120), async {
            loop {
                if accept(&reports.borrow_and_update()) {
                    return;
                }
                reports.changed().await.expect("safety monitor gone");
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
    }

    fn power_off_writes(&self) -> usize {
        self.hv
            .writes()
            .iter()
            .filter(|w| w.param == "Pw" && w.value == ParamValue::Int(0))
            .count()
    }

    async fn stop(self) {
        for handle in &self.pollers {
            handle.stop();
        }
        for handle in self.pollers {
            handle
                .join(Duration::from_secs(5))
                .await
                .expect("Failed to join poller");
        }
        self.monitor_stop.send(()).ok();
        self.monitor_task.await.expect("monitor panicked");
    }
}

#[tokio::test(start_paused = true)]
async fn ups_on_battery_switches_hv_off_once() {
    let mut rig = start_rig();

    rig.dispatcher
        .dispatch(CommandRequest::hv_power(0, vec![0, 1], true))
        .await
        .expect("Failed to power HV on");
    assert_eq!(rig.hv.param(0, 1, "Pw"), Some(ParamValue::Int(1)));

    rig.ups.set_status("ONBATT", 40.0, 3.0);
    rig.wait_for("UPS latch", |r| r.ups_latched).await;

    assert_eq!(rig.reports.borrow().phase, SafetyPhase::Emergency);
    assert_eq!(rig.hv.param(0, 0, "Pw"), Some(ParamValue::Int(0)));
    assert_eq!(rig.hv.param(0, 1, "Pw"), Some(ParamValue::Int(0)));
    assert_eq!(rig.power_off_writes(), 1);

    // Further low readings keep the latch without sending more commands.
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(rig.reports.borrow().ups_latched);
    assert_eq!(rig.power_off_writes(), 1);

    rig.ups.set_status("ONLINE", 60.0, 20.0);
    rig.wait_for("latch release", |r| !r.ups_latched).await;
    assert_eq!(rig.reports.borrow().phase, SafetyPhase::Normal);

    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn ups_on_battery_with_time_to_spare_does_not_latch() {
    let mut rig = start_rig();

    rig.ups.set_status("ONBATT", 80.0, 30.0);
    tokio::time::sleep(Duration::from_secs(20)).await;

    assert!(!rig.reports.borrow().ups_latched);
    assert_eq!(rig.reports.borrow().phase, SafetyPhase::Normal);
    assert_eq!(rig.power_off_writes(), 0);

    rig.wait_for("a NORMAL report", |r| r.phase == SafetyPhase::Normal)
        .await;
    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn voc_concentration_walks_through_the_phases() {
    let mut rig = start_rig();
    let unit = 3;
    let scale = rig.voc_scale;

    rig.voc.set_voc(unit, 20.0, scale, 0);
    rig.wait_for("WARNING", |r| r.phase == SafetyPhase::Warning)
        .await;

    rig.voc.set_voc(unit, 75.0, scale, 0);
    rig.wait_for("EMERGENCY", |r| r.phase == SafetyPhase::Emergency)
        .await;
    assert!(!rig.reports.borrow().ups_latched);
    assert_eq!(rig.power_off_writes(), 0);

    rig.voc.set_voc(unit, 0.5, scale, 0);
    rig.wait_for("NORMAL", |r| r.phase == SafetyPhase::Normal)
        .await;
    assert_eq!(rig.power_off_writes(), 0);

    rig.stop().await;
}
