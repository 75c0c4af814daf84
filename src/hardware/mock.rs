//! Mock Hardware Implementations
//!
//! Simulated drivers for every device family, used by `--simulate` and by the
//! test suite. Each mock keeps its state behind an `Arc` so a test can hold a
//! clone of the connector, change what the "hardware" reports and inspect
//! what was written to it while a poller owns the handle.
//!
//! # Available Mocks
//!
//! - `MockAnalogConnector` - blocking acquisition task that honors `close()`
//! - `MockLineConnector` - scripted line instrument (radon monitor, magnetometer)
//! - `MockBusConnector` - Modbus register map (TH/O2, fire, VOC, PDU)
//! - `MockHvConnector` - HV crate parameter table
//! - `MockUpsConnector` - `apcaccess` style status report

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::{DeviceError, DeviceResult};
use crate::hardware::capabilities::{
    AcquisitionPlan, AnalogConnector, AnalogTask, BusConnector, DaqModuleInfo, HvConnector,
    HvCrate, LineConnector, LineInstrument, ParamValue, RegisterBus, TaskCloser, UpsConnector,
    UpsSource,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// MockAnalogConnector - Simulated continuous acquisition
// =============================================================================

/// Simulated analog acquisition chassis.
///
/// `read()` blocks for `block_time` (one acquisition block) unless the task is
/// closed, in which case it returns `DeviceError::Closed` immediately.
#[derive(Clone)]
pub struct MockAnalogConnector {
    modules: Arc<Mutex<Vec<DaqModuleInfo>>>,
    levels: Arc<Mutex<Vec<f64>>>,
    block_time: Duration,
    opened: Arc<AtomicUsize>,
}

impl MockAnalogConnector {
    /// Chassis with `modules` whose reads block for `block_time`.
    pub fn new(modules: Vec<DaqModuleInfo>, block_time: Duration) -> Self {
        Self {
            modules: Arc::new(Mutex::new(modules)),
            levels: Arc::new(Mutex::new(Vec::new())),
            block_time,
            opened: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Mean value reported per channel, in plan order. Missing channels read 0.
    pub fn set_levels(&self, levels: Vec<f64>) {
        *lock(&self.levels) = levels;
    }

    /// Number of tasks opened so far.
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl AnalogConnector for MockAnalogConnector {
    fn discover(&self) -> DeviceResult<Vec<DaqModuleInfo>> {
        Ok(lock(&self.modules).clone())
    }

    fn open(&self, plan: &AcquisitionPlan) -> DeviceResult<Box<dyn AnalogTask>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockAnalogTask {
            channels: plan.channel_count(),
            levels: Arc::clone(&self.levels),
            block_time: self.block_time,
            gate: Arc::new(CloseGate::default()),
        }))
    }
}

#[derive(Default)]
struct CloseGate {
    closed: Mutex<bool>,
    wake: Condvar,
}

impl TaskCloser for CloseGate {
    fn close(&self) {
        *lock(&self.closed) = true;
        self.wake.notify_all();
    }
}

struct MockAnalogTask {
    channels: usize,
    levels: Arc<Mutex<Vec<f64>>>,
    block_time: Duration,
    gate: Arc<CloseGate>,
}

impl AnalogTask for MockAnalogTask {
    fn read(&mut self, samples_per_channel: usize) -> DeviceResult<Vec<Vec<f64>>> {
        let guard = lock(&self.gate.closed);
        let (closed, _) = self
            .gate
            .wake
            .wait_timeout_while(guard, self.block_time, |closed| !*closed)
            .unwrap_or_else(PoisonError::into_inner);
        if *closed {
            return Err(DeviceError::Closed);
        }
        drop(closed);

        let levels = lock(&self.levels);
        Ok((0..self.channels)
            .map(|ch| vec![levels.get(ch).copied().unwrap_or(0.0); samples_per_channel])
            .collect())
    }

    fn closer(&self) -> Arc<dyn TaskCloser> {
        Arc::clone(&self.gate) as Arc<dyn TaskCloser>
    }
}

// =============================================================================
// MockLineConnector - Scripted line instrument
// =============================================================================

type Responder = Arc<dyn Fn(&str) -> Option<DeviceResult<String>> + Send + Sync>;

/// Line instrument answering from a closure.
///
/// The responder gets every written command; `None` means the command
/// produces no reply line (e.g. `*RST`).
#[derive(Clone)]
pub struct MockLineConnector {
    responder: Responder,
    written: Arc<Mutex<Vec<String>>>,
    fail_open: Arc<AtomicBool>,
}

impl MockLineConnector {
    /// Instrument answering each command line with `responder`; `None` means no reply.
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&str) -> Option<DeviceResult<String>> + Send + Sync + 'static,
    {
        Self {
            responder: Arc::new(responder),
            written: Arc::new(Mutex::new(Vec::new())),
            fail_open: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Radon monitor answering `VALUE?` with fixed numbers.
    pub fn radon(mu: f64, sigma: f64) -> Self {
        Self::new(move |command| {
            (command == "VALUE?").then(|| Ok(format!("VALUE: {mu} Bq/m3: {sigma} Bq/m3")))
        })
    }

    /// Fluxgate magnetometer reporting fixed components in tesla.
    pub fn magnetometer(x: f64, y: f64, z: f64) -> Self {
        Self::new(move |command| match command {
            ":MEASure:SCALar:FLUX:X?" => Some(Ok(format!("{x:e}"))),
            ":MEASure:SCALar:FLUX:Y?" => Some(Ok(format!("{y:e}"))),
            ":MEASure:SCALar:FLUX:Z?" => Some(Ok(format!("{z:e}"))),
            _ => None,
        })
    }

    /// Every line written so far.
    pub fn written(&self) -> Vec<String> {
        lock(&self.written).clone()
    }

    /// Make the next `open` calls fail.
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl LineConnector for MockLineConnector {
    async fn open(&self) -> DeviceResult<Box<dyn LineInstrument>> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(DeviceError::Open("mock line unavailable".to_string()));
        }
        Ok(Box::new(MockLine {
            responder: Arc::clone(&self.responder),
            written: Arc::clone(&self.written),
            pending: None,
        }))
    }
}

struct MockLine {
    responder: Responder,
    written: Arc<Mutex<Vec<String>>>,
    pending: Option<DeviceResult<String>>,
}

#[async_trait]
impl LineInstrument for MockLine {
    async fn write_line(&mut self, command: &str) -> DeviceResult<()> {
        lock(&self.written).push(command.to_string());
        self.pending = (self.responder)(command);
        Ok(())
    }

    async fn read_line(&mut self) -> DeviceResult<String> {
        self.pending
            .take()
            .unwrap_or(Err(DeviceError::Timeout(Duration::from_millis(500))))
    }
}

// =============================================================================
// MockBusConnector - Modbus register map
// =============================================================================

#[derive(Default)]
struct RegisterMap {
    holding: HashMap<(u8, u16), u16>,
    input: HashMap<(u8, u16), u16>,
    coils: HashMap<(u8, u16), bool>,
    coil_writes: Vec<(u8, u16, bool)>,
    failures: Vec<DeviceError>,
}

impl RegisterMap {
    fn take_failure(&mut self) -> DeviceResult<()> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(self.failures.remove(0))
        }
    }
}

/// In-memory Modbus device shared between a test and the poller's handle.
#[derive(Clone, Default)]
pub struct MockBusConnector {
    map: Arc<Mutex<RegisterMap>>,
    opened: Arc<AtomicUsize>,
    fail_open: Arc<AtomicBool>,
}

impl MockBusConnector {
    /// Empty register map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store holding registers from `address` on.
    pub fn set_holding(&self, unit: u8, address: u16, values: &[u16]) {
        let mut map = lock(&self.map);
        for (offset, value) in (0u16..).zip(values) {
            map.holding.insert((unit, address + offset), *value);
        }
    }

    /// Store input registers from `address` on.
    pub fn set_input(&self, unit: u8, address: u16, values: &[u16]) {
        let mut map = lock(&self.map);
        for (offset, value) in (0u16..).zip(values) {
            map.input.insert((unit, address + offset), *value);
        }
    }

    /// Set one coil.
    pub fn set_coil(&self, unit: u8, address: u16, value: bool) {
        lock(&self.map).coils.insert((unit, address), value);
    }

    /// Current coil value.
    pub fn coil(&self, unit: u8, address: u16) -> Option<bool> {
        lock(&self.map).coils.get(&(unit, address)).copied()
    }

    /// Every `write_coil` seen so far.
    pub fn coil_writes(&self) -> Vec<(u8, u16, bool)> {
        lock(&self.map).coil_writes.clone()
    }

    /// Queue errors returned by the next requests, one per request.
    pub fn fail_next(&self, errors: Vec<DeviceError>) {
        lock(&self.map).failures.extend(errors);
    }

    /// Make the next `open` calls fail.
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Number of sessions opened so far.
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// NETIO-style PDU: 50 Hz, 230 V, `ports` outlets with odd ports on.
    pub fn netio_pdu(unit: u8, ports: u16) -> Self {
        let bus = Self::new();
        bus.set_input(unit, 0, &[5000, 2300]);
        let mut total = 0u16;
        for port in 1..=ports {
            let on = port % 2 == 1;
            let watts = if on { 10 * port } else { 0 };
            total += watts;
            bus.set_coil(unit, 100 + port, on);
            bus.set_input(unit, 100 + port, &[if on { 45 * port } else { 0 }]);
            bus.set_input(unit, 200 + port, &[watts]);
            bus.set_input(unit, 300 + port, &[100 * port]);
        }
        bus.set_input(unit, 200, &[total]);
        bus
    }

    /// TH/O2 transmitter: 45.0 %RH, 22.5 degC, 20.9 % O2.
    pub fn th_o2(unit: u8) -> Self {
        let bus = Self::new();
        bus.set_holding(unit, 0, &[450, 225, 209]);
        bus
    }

    /// Fire detector with a clear status word at `40001`.
    pub fn fire_detector(unit: u8) -> Self {
        let bus = Self::new();
        bus.set_holding(unit, 0, &[0]);
        bus
    }

    /// PID detector reading `ppm` with no alarm.
    pub fn voc_detector(unit: u8, ppm: f64, scale: f64) -> Self {
        let bus = Self::new();
        bus.set_voc(unit, ppm, scale, 0);
        bus
    }

    /// Update the VOC concentration and alarm registers.
    pub fn set_voc(&self, unit: u8, ppm: f64, scale: f64, alarm: u16) {
        let raw = (ppm * scale).round().max(0.0) as u32;
        self.set_holding(unit, 8, &[(raw >> 16) as u16, (raw & 0xFFFF) as u16]);
        self.set_holding(unit, 34, &[alarm]);
    }
}

#[async_trait]
impl BusConnector for MockBusConnector {
    async fn open(&self) -> DeviceResult<Box<dyn RegisterBus>> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(DeviceError::Open("mock bus unavailable".to_string()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockBus {
            map: Arc::clone(&self.map),
        }))
    }
}

struct MockBus {
    map: Arc<Mutex<RegisterMap>>,
}

fn read_block<T: Copy>(
    table: &HashMap<(u8, u16), T>,
    unit: u8,
    address: u16,
    count: u16,
) -> DeviceResult<Vec<T>> {
    (0..count)
        .map(|offset| {
            table
                .get(&(unit, address + offset))
                .copied()
                .ok_or_else(|| {
                    DeviceError::Rejected(format!(
                        "Modbus exception IllegalDataAddress at {}",
                        address + offset
                    ))
                })
        })
        .collect()
}

#[async_trait]
impl RegisterBus for MockBus {
    async fn read_holding_registers(
        &mut self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> DeviceResult<Vec<u16>> {
        let mut map = lock(&self.map);
        map.take_failure()?;
        read_block(&map.holding, unit, address, count)
    }

    async fn read_input_registers(
        &mut self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> DeviceResult<Vec<u16>> {
        let mut map = lock(&self.map);
        map.take_failure()?;
        read_block(&map.input, unit, address, count)
    }

    async fn read_coils(&mut self, unit: u8, address: u16, count: u16) -> DeviceResult<Vec<bool>> {
        let mut map = lock(&self.map);
        map.take_failure()?;
        read_block(&map.coils, unit, address, count)
    }

    async fn write_coil(&mut self, unit: u8, address: u16, value: bool) -> DeviceResult<()> {
        let mut map = lock(&self.map);
        map.take_failure()?;
        map.coils.insert((unit, address), value);
        map.coil_writes.push((unit, address, value));
        Ok(())
    }
}

// =============================================================================
// MockHvConnector - HV crate
// =============================================================================

/// One `set_channel_param` call as seen by the crate.
#[derive(Debug, Clone, PartialEq)]
pub struct HvWrite {
    /// Slot written.
    pub slot: u16,
    /// Channels written.
    pub channels: Vec<u16>,
    /// Parameter name.
    pub param: String,
    /// Value written.
    pub value: ParamValue,
}

#[derive(Default)]
struct HvState {
    params: HashMap<(u16, u16, String), ParamValue>,
    writes: Vec<HvWrite>,
    rejected_params: Vec<String>,
}

/// HV crate with `Pw`, `VMon`, `IMon`, `V0Set`, `I0Set` and `Status` per channel.
///
/// Switching `Pw` on makes `VMon` follow `V0Set`; switching it off drops
/// `VMon` and `IMon` to zero.
#[derive(Clone)]
pub struct MockHvConnector {
    state: Arc<Mutex<HvState>>,
    fail_open: Arc<AtomicBool>,
}

impl MockHvConnector {
    /// `slots` lists `(slot, channel count)`.
    pub fn new(slots: &[(u16, u16)]) -> Self {
        let mut state = HvState::default();
        for &(slot, channels) in slots {
            for ch in 0..channels {
                let defaults = [
                    ("Pw", ParamValue::Int(0)),
                    ("VMon", ParamValue::Float(0.0)),
                    ("IMon", ParamValue::Float(0.0)),
                    ("V0Set", ParamValue::Float(1000.0)),
                    ("I0Set", ParamValue::Float(10.0)),
                    ("Status", ParamValue::Int(0)),
                ];
                for (name, value) in defaults {
                    state.params.insert((slot, ch, name.to_string()), value);
                }
            }
        }
        Self {
            state: Arc::new(Mutex::new(state)),
            fail_open: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Current value of a channel parameter.
    pub fn param(&self, slot: u16, channel: u16, name: &str) -> Option<ParamValue> {
        lock(&self.state)
            .params
            .get(&(slot, channel, name.to_string()))
            .copied()
    }

    /// Every accepted write so far.
    pub fn writes(&self) -> Vec<HvWrite> {
        lock(&self.state).writes.clone()
    }

    /// Make the crate refuse writes to `name`.
    pub fn reject_param(&self, name: &str) {
        lock(&self.state).rejected_params.push(name.to_string());
    }

    /// Make the next `open` calls fail.
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl HvConnector for MockHvConnector {
    async fn open(&self) -> DeviceResult<Box<dyn HvCrate>> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(DeviceError::Open("mock crate unreachable".to_string()));
        }
        Ok(Box::new(MockHvCrate {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockHvCrate {
    state: Arc<Mutex<HvState>>,
}

#[async_trait]
impl HvCrate for MockHvCrate {
    async fn get_channel_param(
        &mut self,
        slot: u16,
        channels: &[u16],
        param: &str,
    ) -> DeviceResult<Vec<ParamValue>> {
        let state = lock(&self.state);
        channels
            .iter()
            .map(|&ch| {
                state
                    .params
                    .get(&(slot, ch, param.to_string()))
                    .copied()
                    .ok_or_else(|| {
                        DeviceError::Rejected(format!("no parameter {param} on slot {slot} ch {ch}"))
                    })
            })
            .collect()
    }

    async fn set_channel_param(
        &mut self,
        slot: u16,
        channels: &[u16],
        param: &str,
        value: ParamValue,
    ) -> DeviceResult<()> {
        let mut state = lock(&self.state);
        if state.rejected_params.iter().any(|p| p == param) {
            return Err(DeviceError::Rejected(format!("{param} is read-only")));
        }
        for &ch in channels {
            if !state.params.contains_key(&(slot, ch, param.to_string())) {
                return Err(DeviceError::Rejected(format!(
                    "no parameter {param} on slot {slot} ch {ch}"
                )));
            }
        }
        for &ch in channels {
            state.params.insert((slot, ch, param.to_string()), value);
            if param == "Pw" {
                let on = value.as_i64() != 0;
                let vset = state
                    .params
                    .get(&(slot, ch, "V0Set".to_string()))
                    .copied()
                    .unwrap_or(ParamValue::Float(0.0));
                let vmon = if on { vset } else { ParamValue::Float(0.0) };
                let imon = ParamValue::Float(if on { 1.5 } else { 0.0 });
                state.params.insert((slot, ch, "VMon".to_string()), vmon);
                state.params.insert((slot, ch, "IMon".to_string()), imon);
                state
                    .params
                    .insert((slot, ch, "Status".to_string()), ParamValue::Int(i64::from(on)));
            }
        }
        state.writes.push(HvWrite {
            slot,
            channels: channels.to_vec(),
            param: param.to_string(),
            value,
        });
        Ok(())
    }
}

// =============================================================================
// MockUpsConnector - apcupsd status report
// =============================================================================

/// Render an `apcaccess status` style report.
pub fn apc_report(status: &str, line_voltage: f64, charge_pct: f64, time_left_min: f64) -> String {
    format!(
        "APC      : 001,036,0874\n\
         HOSTNAME : labhost\n\
         STATUS   : {status}\n\
         LINEV    : {line_voltage:.1} Volts\n\
         LOADPCT  : 17.0 Percent\n\
         BCHARGE  : {charge_pct:.1} Percent\n\
         TIMELEFT : {time_left_min:.1} Minutes\n\
         MODEL    : Smart-UPS 1500\n"
    )
}

/// UPS whose report can be swapped at any time.
#[derive(Clone)]
pub struct MockUpsConnector {
    report: Arc<Mutex<DeviceResult<String>>>,
}

impl MockUpsConnector {
    /// UPS on line power with a full battery.
    pub fn online() -> Self {
        Self {
            report: Arc::new(Mutex::new(Ok(apc_report("ONLINE", 230.0, 100.0, 45.0)))),
        }
    }

    /// Replace the report with `status` and the given battery figures.
    pub fn set_status(&self, status: &str, charge_pct: f64, time_left_min: f64) {
        let line_voltage = if status.contains("ONLINE") { 230.0 } else { 0.0 };
        *lock(&self.report) = Ok(apc_report(status, line_voltage, charge_pct, time_left_min));
    }

    /// Replace the report, errors included.
    pub fn set_report(&self, report: DeviceResult<String>) {
        *lock(&self.report) = report;
    }
}

#[async_trait]
impl UpsConnector for MockUpsConnector {
    async fn open(&self) -> DeviceResult<Box<dyn UpsSource>> {
        Ok(Box::new(MockUps {
            report: Arc::clone(&self.report),
        }))
    }
}

struct MockUps {
    report: Arc<Mutex<DeviceResult<String>>>,
}

#[async_trait]
impl UpsSource for MockUps {
    async fn query_status(&mut self) -> DeviceResult<String> {
        lock(&self.report).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn analog_read_returns_levels() {
        let connector = MockAnalogConnector::new(Vec::new(), Duration::from_millis(5));
        connector.set_levels(vec![21.5, 3.0]);
        let plan = AcquisitionPlan {
            rtd_channels: vec!["m1/ai0".into()],
            volt_channels: vec!["m2/ai0".into()],
            sampling_rate: 10,
        };
        let mut task = connector.open(&plan).unwrap();
        let block = task.read(10).unwrap();
        assert_eq!(block.len(), 2);
        assert_eq!(block[0], vec![21.5; 10]);
        assert_eq!(block[1][9], 3.0);
    }

    #[test]
    fn analog_close_unblocks_read() {
        let connector = MockAnalogConnector::new(Vec::new(), Duration::from_secs(30));
        let plan = AcquisitionPlan {
            rtd_channels: vec!["m1/ai0".into()],
            volt_channels: Vec::new(),
            sampling_rate: 10,
        };
        let mut task = connector.open(&plan).unwrap();
        let closer = task.closer();
        let started = Instant::now();
        let reader = std::thread::spawn(move || task.read(10));
        std::thread::sleep(Duration::from_millis(50));
        closer.close();
        let result = reader.join().unwrap();
        assert_eq!(result, Err(DeviceError::Closed));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn bus_reads_and_writes() {
        let connector = MockBusConnector::netio_pdu(1, 8);
        let mut bus = connector.open().await.unwrap();
        let coils = bus.read_coils(1, 101, 8).await.unwrap();
        assert_eq!(coils, vec![true, false, true, false, true, false, true, false]);
        bus.write_coil(1, 102, true).await.unwrap();
        assert_eq!(connector.coil(1, 102), Some(true));
        assert_eq!(connector.coil_writes(), vec![(1, 102, true)]);
        assert!(bus.read_holding_registers(1, 999, 1).await.is_err());
    }

    #[tokio::test]
    async fn hv_power_drives_vmon() {
        let connector = MockHvConnector::new(&[(0, 2)]);
        let mut hv = connector.open().await.unwrap();
        hv.set_channel_param(0, &[0, 1], "Pw", ParamValue::Int(1))
            .await
            .unwrap();
        let vmon = hv.get_channel_param(0, &[0, 1], "VMon").await.unwrap();
        assert_eq!(vmon, vec![ParamValue::Float(1000.0); 2]);
        assert_eq!(connector.writes().len(), 1);
    }

    #[tokio::test]
    async fn line_records_commands() {
        let connector = MockLineConnector::radon(12.5, 1.25);
        let mut line = connector.open().await.unwrap();
        let reply = line.query("VALUE?").await.unwrap();
        assert_eq!(reply, "VALUE: 12.5 Bq/m3: 1.25 Bq/m3");
        assert_eq!(connector.written(), vec!["VALUE?".to_string()]);
    }
}
