//! HV crate: sub-second monitoring of every configured channel plus the
//! set-parameter and power commands.
//!
//! Minute-resolution history is not written here: the app samples the
//! latest cached snapshot into the per-board ring buffers once a minute.
//! Storage gets one batch of per-channel rows every `persist_every_polls`.

use async_trait::async_trait;
use chrono::Local;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::CaenHvConfig;
use crate::control::command::{
    power_word, CommandAction, CommandOutcome, CommandRequest, Scope, Setpoints,
};
use crate::error::{CommandError, DeviceError, DeviceResult};
use crate::hardware::{DeviceKind, HvConnector, HvCrate, ParamValue};
use crate::persistence::record::second_timestamp;
use crate::persistence::{PersistenceItem, RecordKind, Row, SqlValue};
use crate::pollers::runner::command_error;
use crate::pollers::{DevicePoller, PollContext};
use crate::telemetry::reading::{HvChannelReading, HvSnapshot};
use crate::telemetry::DeviceReading;

/// Parameters read for every channel on each poll.
pub const MONITORED_PARAMS: [&str; 6] = ["Pw", "VMon", "IMon", "V0Set", "I0Set", "Status"];

/// Reads the configured HV channels and applies power and setpoint commands.
pub struct HvPoller {
    config: CaenHvConfig,
    slots: Vec<(u16, u16)>,
    connector: Arc<dyn HvConnector>,
    device: Option<Box<dyn HvCrate>>,
    polls_since_persist: u32,
}

impl HvPoller {
    /// Poller for the slots and channels in `config`.
    pub fn new(config: CaenHvConfig, connector: Arc<dyn HvConnector>) -> Self {
        let slots = config.slots();
        Self {
            config,
            slots,
            connector,
            device: None,
            polls_since_persist: 0,
        }
    }

    fn device(&mut self) -> Result<&mut Box<dyn HvCrate>, CommandError> {
        self.device
            .as_mut()
            .ok_or_else(|| CommandError::DeviceUnavailable(DeviceKind::CaenHv.label().to_string()))
    }

    async fn read_slot(
        device: &mut dyn HvCrate,
        slot: u16,
        channels: u16,
    ) -> DeviceResult<Vec<HvChannelReading>> {
        let list: Vec<u16> = (0..channels).collect();
        let mut columns = Vec::with_capacity(MONITORED_PARAMS.len());
        for param in MONITORED_PARAMS {
            let values = device.get_channel_param(slot, &list, param).await?;
            if values.len() != list.len() {
                return Err(DeviceError::Malformed(format!(
                    "{param} on slot {slot}: {} values for {} channels",
                    values.len(),
                    list.len()
                )));
            }
            columns.push(values);
        }
        Ok(list
            .iter()
            .enumerate()
            .map(|(i, &channel)| HvChannelReading {
                slot,
                channel,
                power: columns[0][i].as_i64() != 0,
                vmon: columns[1][i].as_f64(),
                imon: columns[2][i].as_f64(),
                v0set: columns[3][i].as_f64(),
                i0set: columns[4][i].as_f64(),
                status: columns[5][i].as_i64(),
            })
            .collect())
    }
}

fn hv_row(timestamp: chrono::NaiveDateTime, reading: &HvChannelReading) -> Row {
    vec![
        SqlValue::from(timestamp),
        SqlValue::from(reading.slot),
        SqlValue::from(reading.channel),
        SqlValue::from(reading.power),
        SqlValue::from(reading.vmon),
        SqlValue::from(reading.imon),
        SqlValue::from(reading.v0set),
        SqlValue::from(reading.i0set),
        SqlValue::from(reading.status),
    ]
}

fn hv_scope(scope: &Scope) -> Result<(u16, &[u16]), CommandError> {
    match scope {
        Scope::HvChannels { slot, channels } if !channels.is_empty() => Ok((*slot, channels)),
        Scope::HvChannels { .. } => Err(CommandError::InvalidScope(
            "no HV channel selected".to_string(),
        )),
        other => Err(CommandError::InvalidScope(format!("{other} is not an HV scope"))),
    }
}

#[async_trait]
impl DevicePoller for HvPoller {
    fn kind(&self) -> DeviceKind {
        DeviceKind::CaenHv
    }

    fn poll_interval(&self) -> Duration {
        self.config.polling_interval()
    }

    fn is_connected(&self) -> bool {
        self.device.is_some()
    }

    async fn connect(&mut self, _ctx: &PollContext) -> DeviceResult<()> {
        info!(address = %self.config.ip_address, "Connecting to HV crate");
        self.device = Some(self.connector.open().await?);
        Ok(())
    }

    async fn poll_once(&mut self, ctx: &PollContext) -> DeviceResult<()> {
        let device = self.device.as_mut().ok_or(DeviceError::NotConnected)?;
        let timestamp = Local::now();
        let mut snapshot = HvSnapshot::default();
        for &(slot, channels) in &self.slots {
            snapshot
                .channels
                .extend(Self::read_slot(device.as_mut(), slot, channels).await?);
        }

        self.polls_since_persist += 1;
        if self.polls_since_persist >= self.config.persist_every_polls.max(1) {
            self.polls_since_persist = 0;
            let at = second_timestamp(timestamp);
            let rows: Vec<Row> = snapshot.channels.iter().map(|r| hv_row(at, r)).collect();
            if !rows.is_empty() {
                debug!(rows = rows.len(), "HV snapshot queued");
                ctx.persist(PersistenceItem::batch(RecordKind::Hv, rows));
            }
        }

        ctx.publish_raw(DeviceKind::CaenHv, timestamp, DeviceReading::Hv(snapshot));
        Ok(())
    }

    async fn disconnect(&mut self) {
        if self.device.take().is_some() {
            info!("HV crate closed");
        }
    }

    async fn execute(&mut self, request: &CommandRequest) -> Result<CommandOutcome, CommandError> {
        let (slot, channels) = hv_scope(&request.scope)?;
        let device = self.device()?;
        let fail = |e| command_error(DeviceKind::CaenHv, e);
        match &request.action {
            CommandAction::SetParams(params) => {
                for (param, value) in params {
                    device
                        .set_channel_param(slot, channels, param, ParamValue::Float(*value))
                        .await
                        .map_err(fail)?;
                    info!(slot, ?channels, param = %param, value, "HV parameter set");
                }
                Ok(CommandOutcome::new(format!(
                    "Successfully applied parameters to {}.",
                    request.scope
                )))
            }
            CommandAction::SetPower(on) => {
                device
                    .set_channel_param(slot, channels, "Pw", ParamValue::Int(i64::from(*on)))
                    .await
                    .map_err(fail)?;
                info!(slot, ?channels, power = power_word(*on), "HV power set");
                Ok(CommandOutcome::new(format!(
                    "Successfully turned Power {} for {}.",
                    power_word(*on),
                    request.scope
                )))
            }
        }
    }

    async fn fetch_setpoints(&mut self, scope: &Scope) -> Result<Setpoints, CommandError> {
        let (slot, channels) = hv_scope(scope)?;
        let channel = [channels[0]];
        let device = self.device()?;
        let mut values = BTreeMap::new();
        for param in ["V0Set", "I0Set"] {
            let read = device
                .get_channel_param(slot, &channel, param)
                .await
                .map_err(|e| command_error(DeviceKind::CaenHv, e))?;
            let value = read.first().ok_or_else(|| {
                command_error(
                    DeviceKind::CaenHv,
                    DeviceError::Malformed(format!("no {param} returned")),
                )
            })?;
            values.insert(param.to_string(), value.as_f64());
        }
        Ok(Setpoints { values })
    }
}
