//! Control requests and their outcomes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::hardware::DeviceKind;

/// Which outputs a request applies to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum Scope {
    /// Channels of one HV board.
    HvChannels {
        /// Board slot in the crate.
        slot: u16,
        /// Channels on that board, from 0.
        channels: Vec<u16>,
    },
    /// One PDU outlet, numbered from 1.
    PduPort {
        /// Outlet number.
        port: u16,
    },
    /// Every PDU outlet in order.
    PduAllPorts,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::HvChannels { slot, channels } => write!(f, "Slot {slot}, Ch {channels:?}"),
            Scope::PduPort { port } => write!(f, "Port {port}"),
            Scope::PduAllPorts => f.write_str("ALL ports"),
        }
    }
}

/// What a request does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "value", rename_all = "snake_case")]
pub enum CommandAction {
    /// Parameter name to value, applied to every channel in scope.
    SetParams(BTreeMap<String, f64>),
    /// Power every output in scope on (`true`) or off.
    SetPower(bool),
}

impl CommandAction {
    /// Wire name of the action.
    pub fn name(&self) -> &'static str {
        match self {
            CommandAction::SetParams(_) => "set_params",
            CommandAction::SetPower(_) => "set_power",
        }
    }
}

/// A validated control request from the UI layer or the interlock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Device that executes the request.
    pub device: DeviceKind,
    /// Outputs addressed.
    pub scope: Scope,
    /// Change to apply.
    pub action: CommandAction,
}

impl CommandRequest {
    /// Write parameters to HV channels.
    pub fn hv_params(slot: u16, channels: Vec<u16>, params: BTreeMap<String, f64>) -> Self {
        Self {
            device: DeviceKind::CaenHv,
            scope: Scope::HvChannels { slot, channels },
            action: CommandAction::SetParams(params),
        }
    }

    /// Switch HV channels on or off.
    pub fn hv_power(slot: u16, channels: Vec<u16>, on: bool) -> Self {
        Self {
            device: DeviceKind::CaenHv,
            scope: Scope::HvChannels { slot, channels },
            action: CommandAction::SetPower(on),
        }
    }

    /// Switch one PDU outlet.
    pub fn pdu_port(port: u16, on: bool) -> Self {
        Self {
            device: DeviceKind::Pdu,
            scope: Scope::PduPort { port },
            action: CommandAction::SetPower(on),
        }
    }

    /// Switch every PDU outlet in turn.
    pub fn pdu_all(on: bool) -> Self {
        Self {
            device: DeviceKind::Pdu,
            scope: Scope::PduAllPorts,
            action: CommandAction::SetPower(on),
        }
    }
}

/// Successful command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Message shown to the operator.
    pub ack: String,
    /// Poll again this soon so the new state shows up quickly.
    pub refresh_after: Option<Duration>,
}

impl CommandOutcome {
    /// Outcome with an acknowledgment and no refresh.
    pub fn new(ack: impl Into<String>) -> Self {
        Self {
            ack: ack.into(),
            refresh_after: None,
        }
    }

    /// Ask the poller to poll again after `delay`.
    pub fn refresh_after(mut self, delay: Duration) -> Self {
        self.refresh_after = Some(delay);
        self
    }
}

/// Current setpoints of a scope, used to pre-fill control forms.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Setpoints {
    /// Parameter name to value.
    pub values: BTreeMap<String, f64>,
}

impl Setpoints {
    /// Value of parameter `name`.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }
}

/// `ON` or `OFF`.
pub fn power_word(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}
