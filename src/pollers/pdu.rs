//! Networked power distribution unit (NETIO-style Modbus TCP map).
//!
//! The unit drops idle TCP sessions, so every poll and every command opens
//! its own session and closes it when done. `is_connected` reports whether
//! the last session could be opened.
//!
//! Register map, `N = port_count`:
//!
//! | Table | Address | Content |
//! |-------|---------|---------|
//! | input | 0, 1 | frequency (0.01 Hz), voltage (0.1 V) |
//! | input | 200 | total power (W) |
//! | coil | 101..=100+N | output state |
//! | input | 101..=100+N | current (mA) |
//! | input | 201..=200+N | power (W) |
//! | input | 301..=300+N | energy (Wh), not on every firmware |

use async_trait::async_trait;
use chrono::Local;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{seconds, PduConfig};
use crate::control::command::{power_word, CommandAction, CommandOutcome, CommandRequest, Scope};
use crate::error::{CommandError, DeviceError, DeviceResult};
use crate::hardware::{BusConnector, DeviceKind, RegisterBus};
use crate::persistence::record::millisecond_timestamp;
use crate::persistence::{PersistenceItem, RecordKind, Row, SqlValue};
use crate::pollers::runner::command_error;
use crate::pollers::window::RollingWindow;
use crate::pollers::{DevicePoller, PollContext};
use crate::telemetry::channels::PDU;
use crate::telemetry::reading::{PduPortReading, PduStatus};
use crate::telemetry::DeviceReading;

const OUTPUT_BASE: u16 = 100;
const CURRENT_BASE: u16 = 100;
const POWER_BASE: u16 = 200;
const ENERGY_BASE: u16 = 300;
const TOTAL_POWER: u16 = 200;

/// Delay before the poll that shows the effect of a command.
pub const REFRESH_AFTER_COMMAND: Duration = Duration::from_millis(500);

/// Power distribution unit. Opens a Modbus session per poll and per command.
pub struct PduPoller {
    config: PduConfig,
    connector: Arc<dyn BusConnector>,
    connected: bool,
    window: RollingWindow,
}

impl PduPoller {
    /// Poller for the outlets listed in `config`.
    pub fn new(config: PduConfig, connector: Arc<dyn BusConnector>) -> Self {
        let window = RollingWindow::covering(
            seconds(config.window_s),
            seconds(config.polling_interval_s),
        );
        Self {
            config,
            connector,
            connected: false,
            window,
        }
    }

    async fn session(&mut self) -> DeviceResult<Box<dyn RegisterBus>> {
        match self.connector.open().await {
            Ok(bus) => {
                if !self.connected {
                    info!(address = %self.config.ip_address, "PDU reachable");
                }
                self.connected = true;
                Ok(bus)
            }
            Err(err) => {
                if self.connected {
                    warn!(error = %err, "PDU connection lost");
                }
                self.connected = false;
                Err(err)
            }
        }
    }

    fn outlet(&self, port: u16) -> &str {
        self.config
            .outlets
            .get(&port.to_string())
            .map_or("", String::as_str)
    }

    async fn read_status(&self, bus: &mut dyn RegisterBus) -> DeviceResult<PduStatus> {
        let unit = self.config.unit_id;
        let count = self.config.port_count;

        let global = bus.read_input_registers(unit, 0, 2).await?;
        let total = bus.read_input_registers(unit, TOTAL_POWER, 1).await?;
        let (&[frequency, voltage], Some(&total)) = (global.as_slice(), total.first()) else {
            return Err(DeviceError::Malformed("short PDU global block".to_string()));
        };

        let states = bus.read_coils(unit, OUTPUT_BASE + 1, count).await?;
        let currents = bus.read_input_registers(unit, CURRENT_BASE + 1, count).await?;
        let watts = bus.read_input_registers(unit, POWER_BASE + 1, count).await?;
        let energy = match bus.read_input_registers(unit, ENERGY_BASE + 1, count).await {
            Ok(values) => values,
            Err(err) if err.requires_reconnect() => return Err(err),
            Err(_) => Vec::new(),
        };
        if currents.len() < usize::from(count) || watts.len() < usize::from(count) {
            return Err(DeviceError::Malformed("short PDU port block".to_string()));
        }

        let ports = (0..usize::from(count))
            .map(|i| PduPortReading {
                port: i as u16 + 1,
                on: states.get(i).copied().unwrap_or(false),
                power_w: f64::from(watts[i]),
                current_ma: f64::from(currents[i]),
                energy_wh: energy.get(i).copied().map_or(0.0, f64::from),
            })
            .collect();

        Ok(PduStatus {
            frequency_hz: f64::from(frequency) / 100.0,
            voltage_v: f64::from(voltage) / 10.0,
            total_power_w: f64::from(total),
            ports,
        })
    }

    async fn switch_port(&mut self, port: u16, on: bool) -> Result<CommandOutcome, CommandError> {
        if !(1..=self.config.port_count).contains(&port) {
            return Err(CommandError::InvalidScope(format!(
                "port {port} is not in 1..={}",
                self.config.port_count
            )));
        }
        let mut bus = self
            .session()
            .await
            .map_err(|e| command_error(DeviceKind::Pdu, e))?;
        bus.write_coil(self.config.unit_id, OUTPUT_BASE + port, on)
            .await
            .map_err(|e| command_error(DeviceKind::Pdu, e))?;
        info!(port, outlet = self.outlet(port), state = power_word(on), "PDU port switched");
        Ok(CommandOutcome::new(format!(
            "Port {port} successfully turned {}.",
            power_word(on)
        ))
        .refresh_after(REFRESH_AFTER_COMMAND))
    }

    async fn switch_all(&mut self, on: bool) -> Result<CommandOutcome, CommandError> {
        let mut bus = self
            .session()
            .await
            .map_err(|e| command_error(DeviceKind::Pdu, e))?;
        let step = Duration::from_millis(self.config.all_ports_step_ms);
        info!(state = power_word(on), "Switching all PDU ports");
        for port in 1..=self.config.port_count {
            if let Err(err) = bus.write_coil(self.config.unit_id, OUTPUT_BASE + port, on).await {
                warn!(port, error = %err, "Port not switched during ALL sequence");
                if err.requires_reconnect() {
                    return Err(command_error(DeviceKind::Pdu, err));
                }
            }
            tokio::time::sleep(step).await;
        }
        Ok(
            CommandOutcome::new(format!("ALL ports {} sequence complete.", power_word(on)))
                .refresh_after(REFRESH_AFTER_COMMAND),
        )
    }
}

fn port_row(at: chrono::NaiveDateTime, port: &PduPortReading) -> Row {
    vec![
        SqlValue::from(at),
        SqlValue::from(port.port),
        SqlValue::from(port.on),
        SqlValue::from(port.power_w),
        SqlValue::from(port.current_ma),
        SqlValue::from(port.energy_wh),
    ]
}

#[async_trait]
impl DevicePoller for PduPoller {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Pdu
    }

    fn poll_interval(&self) -> Duration {
        seconds(self.config.polling_interval_s)
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn accepts_commands_offline(&self) -> bool {
        true
    }

    async fn connect(&mut self, _ctx: &PollContext) -> DeviceResult<()> {
        self.session().await.map(drop)
    }

    async fn poll_once(&mut self, ctx: &PollContext) -> DeviceResult<()> {
        let mut bus = self.session().await?;
        let timestamp = Local::now();
        let status = self.read_status(bus.as_mut()).await?;
        drop(bus);

        let at = millisecond_timestamp(timestamp);
        let rows: Vec<Row> = status.ports.iter().map(|p| port_row(at, p)).collect();
        ctx.persist(PersistenceItem::batch(RecordKind::Pdu, rows));

        let values = [status.frequency_hz, status.voltage_v, status.total_power_w];
        ctx.publish_raw(DeviceKind::Pdu, timestamp, DeviceReading::Pdu(status.clone()));
        if let Some(mean) = self.window.push(&values) {
            let averaged = PduStatus {
                frequency_hz: mean[0],
                voltage_v: mean[1],
                total_power_w: mean[2],
                ports: status.ports,
            };
            ctx.publish_average(DeviceKind::Pdu, PDU, timestamp, &mean, DeviceReading::Pdu(averaged));
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    async fn execute(&mut self, request: &CommandRequest) -> Result<CommandOutcome, CommandError> {
        let CommandAction::SetPower(on) = request.action else {
            return Err(CommandError::Unsupported {
                device: DeviceKind::Pdu.label().to_string(),
                action: request.action.name().to_string(),
            });
        };
        match request.scope {
            Scope::PduPort { port } => self.switch_port(port, on).await,
            Scope::PduAllPorts => self.switch_all(on).await,
            ref other => Err(CommandError::InvalidScope(format!(
                "{other} is not a PDU scope"
            ))),
        }
    }

    fn gap_channels(&self) -> Vec<String> {
        vec![PDU.to_string()]
    }
}
