//! Routes control requests to the task that owns the target device.
//!
//! The dispatcher never touches a device handle. It checks the scope against
//! the configured layout, sends the request over the poller's control queue
//! and waits for the reply on a oneshot channel. Human confirmation of
//! channel-range writes is the caller's job.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::control::command::{CommandOutcome, CommandRequest, Scope, Setpoints};
use crate::error::CommandError;
use crate::hardware::DeviceKind;
use crate::pollers::ControlMessage;

/// Upper bound on waiting for a poller to answer. Covers the slowest
/// command, an all-ports PDU sequence.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Anything that accepts control requests.
///
/// The safety monitor depends on this rather than on the dispatcher so tests
/// can record what it sends.
#[async_trait]
pub trait CommandSink: Send + Sync {
    /// Route `request` to its device and wait for the outcome.
    async fn dispatch(&self, request: CommandRequest) -> Result<CommandOutcome, CommandError>;
}

/// Controllable scopes as configured.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControlLayout {
    /// HV slot to channel count.
    pub hv_slots: BTreeMap<u16, u16>,
    /// Number of PDU outlets.
    pub pdu_ports: u16,
}

impl ControlLayout {
    /// Layout of the configured HV boards and PDU.
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            hv_slots: config.caen_hv.slots().into_iter().collect(),
            pdu_ports: config.pdu.port_count,
        }
    }

    /// Check that `request` addresses outputs that exist.
    pub fn validate(&self, request: &CommandRequest) -> Result<(), CommandError> {
        match (&request.device, &request.scope) {
            (DeviceKind::CaenHv, Scope::HvChannels { slot, channels }) => {
                let count = self.hv_slots.get(slot).copied().ok_or_else(|| {
                    CommandError::InvalidScope(format!("HV slot {slot} is not configured"))
                })?;
                if channels.is_empty() {
                    return Err(CommandError::InvalidScope(
                        "no HV channel selected".to_string(),
                    ));
                }
                if let Some(bad) = channels.iter().find(|&&ch| ch >= count) {
                    return Err(CommandError::InvalidScope(format!(
                        "channel {bad} does not exist on slot {slot} ({count} channels)"
                    )));
                }
                Ok(())
            }
            (DeviceKind::Pdu, Scope::PduPort { port }) => {
                if (1..=self.pdu_ports).contains(port) {
                    Ok(())
                } else {
                    Err(CommandError::InvalidScope(format!(
                        "port {port} is not in 1..={}",
                        self.pdu_ports
                    )))
                }
            }
            (DeviceKind::Pdu, Scope::PduAllPorts) => Ok(()),
            (device, scope) if device.is_controllable() => Err(CommandError::InvalidScope(
                format!("{scope} does not belong to {}", device.label()),
            )),
            (device, _) => Err(CommandError::Unsupported {
                device: device.label().to_string(),
                action: request.action.name().to_string(),
            }),
        }
    }
}

/// Hands control requests to poller tasks.
#[derive(Clone)]
pub struct CommandDispatcher {
    layout: ControlLayout,
    routes: HashMap<DeviceKind, mpsc::Sender<ControlMessage>>,
    reply_timeout: Duration,
}

impl CommandDispatcher {
    /// Dispatcher with no routes yet.
    pub fn new(layout: ControlLayout) -> Self {
        Self {
            layout,
            routes: HashMap::new(),
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }

    /// Give up waiting for a poller reply after `timeout`.
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Route requests for `kind` to a poller's control queue.
    pub fn register(&mut self, kind: DeviceKind, control: mpsc::Sender<ControlMessage>) {
        debug!(device = %kind, "Control route registered");
        self.routes.insert(kind, control);
    }

    /// Whether a live poller serves `kind`.
    pub fn is_routed(&self, kind: DeviceKind) -> bool {
        self.routes
            .get(&kind)
            .is_some_and(|control| !control.is_closed())
    }

    /// Scopes checked before routing.
    pub fn layout(&self) -> &ControlLayout {
        &self.layout
    }

    fn route(&self, kind: DeviceKind) -> Result<&mpsc::Sender<ControlMessage>, CommandError> {
        self.routes
            .get(&kind)
            .ok_or_else(|| CommandError::DeviceUnavailable(kind.label().to_string()))
    }

    async fn exchange<T>(
        &self,
        kind: DeviceKind,
        message: ControlMessage,
        reply: oneshot::Receiver<Result<T, CommandError>>,
    ) -> Result<T, CommandError> {
        let unavailable = || CommandError::DeviceUnavailable(kind.label().to_string());
        self.route(kind)?
            .send(message)
            .await
            .map_err(|_| unavailable())?;
        match tokio::time::timeout(self.reply_timeout, reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(unavailable()),
            Err(_) => Err(CommandError::Timeout(kind.label().to_string())),
        }
    }

    /// Validate `request`, run it on the owning poller and return its ack.
    pub async fn dispatch(&self, request: CommandRequest) -> Result<CommandOutcome, CommandError> {
        self.layout.validate(&request)?;
        let kind = request.device;
        let action = request.action.name();
        let scope = request.scope.to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        let result = self
            .exchange(
                kind,
                ControlMessage::Execute {
                    request,
                    reply: reply_tx,
                },
                reply_rx,
            )
            .await;
        match &result {
            Ok(outcome) => info!(device = %kind, action, %scope, ack = %outcome.ack, "Command applied"),
            Err(err) => warn!(device = %kind, action, %scope, error = %err, "Command failed"),
        }
        result
    }

    /// Current setpoints for `scope`, used to pre-fill a control form.
    ///
    /// Failures are logged here; callers keep whatever they showed before.
    pub async fn fetch_setpoints(
        &self,
        kind: DeviceKind,
        scope: Scope,
    ) -> Result<Setpoints, CommandError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let result = self
            .exchange(
                kind,
                ControlMessage::FetchSetpoints {
                    scope,
                    reply: reply_tx,
                },
                reply_rx,
            )
            .await;
        if let Err(err) = &result {
            debug!(device = %kind, error = %err, "Setpoints not fetched");
        }
        result
    }
}

#[async_trait]
impl CommandSink for CommandDispatcher {
    async fn dispatch(&self, request: CommandRequest) -> Result<CommandOutcome, CommandError> {
        CommandDispatcher::dispatch(self, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> ControlLayout {
        ControlLayout {
            hv_slots: BTreeMap::from([(0, 4), (2, 12)]),
            pdu_ports: 8,
        }
    }

    /// Answers every request with an ack naming the scope.
    fn echo_route() -> mpsc::Sender<ControlMessage> {
        let (tx, mut rx) = mpsc::channel(4);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    ControlMessage::Execute { request, reply } => {
                        let _ = reply.send(Ok(CommandOutcome::new(format!("done {}", request.scope))));
                    }
                    ControlMessage::FetchSetpoints { reply, .. } => {
                        let mut setpoints = Setpoints::default();
                        setpoints.values.insert("V0Set".into(), 1200.0);
                        let _ = reply.send(Ok(setpoints));
                    }
                }
            }
        });
        tx
    }

    #[test]
    fn layout_rejects_outputs_that_do_not_exist() {
        let layout = layout();
        assert!(layout.validate(&CommandRequest::hv_power(2, vec![0, 11], true)).is_ok());
        assert!(layout.validate(&CommandRequest::pdu_all(false)).is_ok());

        for request in [
            CommandRequest::hv_power(1, vec![0], true),
            CommandRequest::hv_power(0, vec![4], true),
            CommandRequest::hv_power(0, vec![], true),
            CommandRequest::pdu_port(0, true),
            CommandRequest::pdu_port(9, true),
            CommandRequest {
                device: DeviceKind::Pdu,
                scope: Scope::HvChannels {
                    slot: 0,
                    channels: vec![0],
                },
                action: crate::control::CommandAction::SetPower(true),
            },
        ] {
            let err = layout.validate(&request).unwrap_err();
            assert!(matches!(err, CommandError::InvalidScope(_)), "{request:?}");
        }

        let err = layout
            .validate(&CommandRequest {
                device: DeviceKind::Ups,
                scope: Scope::PduAllPorts,
                action: crate::control::CommandAction::SetPower(false),
            })
            .unwrap_err();
        assert!(matches!(err, CommandError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn routes_to_registered_poller() {
        let mut dispatcher = CommandDispatcher::new(layout());
        dispatcher.register(DeviceKind::CaenHv, echo_route());
        assert!(dispatcher.is_routed(DeviceKind::CaenHv));

        let outcome = dispatcher
            .dispatch(CommandRequest::hv_power(0, vec![1], false))
            .await
            .unwrap();
        assert_eq!(outcome.ack, "done Slot 0, Ch [1]");

        let setpoints = dispatcher
            .fetch_setpoints(DeviceKind::CaenHv, Scope::HvChannels { slot: 0, channels: vec![1] })
            .await
            .unwrap();
        assert_eq!(setpoints.get("V0Set"), Some(1200.0));
    }

    #[tokio::test]
    async fn missing_route_reports_device_not_connected() {
        let dispatcher = CommandDispatcher::new(layout());
        let err = dispatcher
            .dispatch(CommandRequest::pdu_port(1, true))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Error: PDU device not connected.");
    }

    #[tokio::test]
    async fn dropped_reply_reports_device_not_connected() {
        let (tx, mut rx) = mpsc::channel::<ControlMessage>(4);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                drop(message);
            }
        });
        let mut dispatcher = CommandDispatcher::new(layout());
        dispatcher.register(DeviceKind::Pdu, tx);
        let err = dispatcher
            .dispatch(CommandRequest::pdu_all(true))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::DeviceUnavailable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_poller_times_out() {
        let (tx, _rx) = mpsc::channel::<ControlMessage>(4);
        let mut dispatcher =
            CommandDispatcher::new(layout()).with_reply_timeout(Duration::from_secs(2));
        dispatcher.register(DeviceKind::Pdu, tx);
        let err = dispatcher
            .dispatch(CommandRequest::pdu_port(3, false))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Timeout(_)));
    }
}
