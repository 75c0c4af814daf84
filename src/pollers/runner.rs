//! Poller task loop.
//!
//! One tokio task per device. The task owns the poller (and so the device
//! handle) and is the only place that ever touches it:
//!
//! ```text
//!             ┌──────────── control requests (mpsc) ─────────────┐
//!             v                                                   │
//!   startup ──> idle until deadline ──> poll_once ──┬─> ok ───────┤
//!   (bounded)        ^                              ├─> malformed: skip
//!                    │                              └─> error: backoff,
//!                    └──────────────────────────────    reconnect, cooldown
//! ```
//!
//! Cancellation is cooperative: the stop flag is checked between polls and
//! while idling. A poller blocked in a long hardware read registers a
//! [`TaskCloser`] so [`StopSignal::stop`] can force that read to return.
//! When the loop exits the poller is handed back to whoever joins the task,
//! still holding its handle, so the caller decides when devices close.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{seconds, PollingPolicyConfig};
use crate::control::command::{CommandOutcome, CommandRequest, Scope, Setpoints};
use crate::error::{AppResult, CommandError, DeviceError, MonitorError};
use crate::hardware::{DeviceKind, TaskCloser};
use crate::pollers::{DevicePoller, PollContext};

/// Capacity of each poller's control queue.
const CONTROL_QUEUE: usize = 32;

// =============================================================================
// StopSignal
// =============================================================================

struct StopInner {
    stopped: AtomicBool,
    notify: Notify,
    closer: Mutex<Option<Arc<dyn TaskCloser>>>,
}

/// Cooperative stop flag of one poller, plus the closer of its blocking call.
#[derive(Clone)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    /// Signal that is not yet stopped.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StopInner {
                stopped: AtomicBool::new(false),
                notify: Notify::new(),
                closer: Mutex::new(None),
            }),
        }
    }

    /// Set the flag, close the registered blocking call and wake waiters.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        let closer = self
            .inner
            .closer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(closer) = closer {
            closer.close();
        }
        self.inner.notify.notify_waiters();
    }

    /// Whether `stop()` has been called.
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Resolve once `stop()` has been called.
    pub async fn wait(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_stopped() {
            return;
        }
        notified.await;
    }

    /// Register the closer of the current blocking call, replacing any
    /// previous one. Closes it right away if the poller is already stopping.
    pub fn set_closer(&self, closer: Arc<dyn TaskCloser>) {
        let mut slot = self
            .inner
            .closer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_stopped() {
            drop(slot);
            closer.close();
            return;
        }
        *slot = Some(closer);
    }

    /// Forget the closer of a finished blocking call.
    pub fn clear_closer(&self) {
        self.inner
            .closer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

// =============================================================================
// Error policy
// =============================================================================

/// Retry behavior shared by every poller.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorPolicy {
    /// Consecutive errors tolerated before a cooldown.
    pub error_threshold: u32,
    /// Pause after `error_threshold` consecutive errors.
    pub cooldown: Duration,
    /// Upper bound of the per-error backoff.
    pub max_backoff: Duration,
    /// Connection attempts before the poller gives up.
    pub startup_attempts: u32,
    /// Base delay between startup attempts.
    pub startup_delay: Duration,
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self::from_config(&PollingPolicyConfig::default())
    }
}

impl ErrorPolicy {
    /// Policy from `[polling]`.
    pub fn from_config(config: &PollingPolicyConfig) -> Self {
        Self {
            error_threshold: config.error_threshold,
            cooldown: seconds(config.cooldown_s),
            max_backoff: seconds(config.max_backoff_s),
            startup_attempts: config.startup_attempts.max(1),
            startup_delay: Duration::from_secs(2),
        }
    }

    /// Delay after the `errors`-th consecutive failure: the poll interval
    /// doubled per error, capped at `max_backoff`, never below the interval.
    pub fn backoff(&self, errors: u32, interval: Duration) -> Duration {
        let base = interval.max(Duration::from_secs(1));
        let factor = 1u32 << errors.saturating_sub(1).min(16);
        base.saturating_mul(factor).min(self.max_backoff).max(base)
    }
}

// =============================================================================
// Control messages
// =============================================================================

/// Request handed to the task that owns a device.
pub enum ControlMessage {
    /// Run a command against the device.
    Execute {
        /// Command to run.
        request: CommandRequest,
        /// Receives the outcome.
        reply: oneshot::Sender<Result<CommandOutcome, CommandError>>,
    },
    /// Read the current setpoints of `scope`.
    FetchSetpoints {
        /// Channels or outlet to read.
        scope: Scope,
        /// Receives the setpoints.
        reply: oneshot::Sender<Result<Setpoints, CommandError>>,
    },
}

// =============================================================================
// PollerRunner
// =============================================================================

/// Task loop of one [`DevicePoller`], run until its stop signal fires.
pub struct PollerRunner {
    poller: Box<dyn DevicePoller>,
    ctx: PollContext,
    control: mpsc::Receiver<ControlMessage>,
    control_open: bool,
    policy: ErrorPolicy,
}

impl PollerRunner {
    /// Runner for `poller`, serving requests from `control`.
    pub fn new(
        poller: Box<dyn DevicePoller>,
        ctx: PollContext,
        control: mpsc::Receiver<ControlMessage>,
        policy: ErrorPolicy,
    ) -> Self {
        Self {
            poller,
            ctx,
            control,
            control_open: true,
            policy,
        }
    }

    /// Run until stopped, then return the poller with its handle.
    pub async fn run(mut self) -> Box<dyn DevicePoller> {
        let kind = self.poller.kind();

        if !self.startup().await {
            if !self.ctx.stop.is_stopped() {
                error!(
                    device = %kind,
                    attempts = self.policy.startup_attempts,
                    "Connection failed at startup, poller disabled"
                );
                self.serve_disabled().await;
            }
            return self.poller;
        }

        let interval = self.poller.poll_interval();
        let mut errors = 0u32;
        let mut deadline = Instant::now();

        loop {
            if !self.idle_until(deadline).await {
                break;
            }
            let started = Instant::now();

            let outcome = if self.poller.is_connected() {
                self.poller.poll_once(&self.ctx).await
            } else {
                match self.poller.connect(&self.ctx).await {
                    Ok(()) => {
                        info!(device = %kind, "Reconnected");
                        self.poller.poll_once(&self.ctx).await
                    }
                    Err(err) => Err(err),
                }
            };

            if self.ctx.stop.is_stopped() {
                break;
            }

            match outcome {
                Ok(()) => {
                    if errors > 0 {
                        info!(device = %kind, errors, "Polling recovered");
                    }
                    errors = 0;
                    deadline = started + interval;
                }
                Err(err) if err.is_malformed() => {
                    warn!(device = %kind, error = %err, "Malformed payload skipped");
                    deadline = started + interval;
                }
                Err(err) => {
                    errors += 1;
                    if err.requires_reconnect() && self.poller.is_connected() {
                        warn!(device = %kind, error = %err, "Connection lost, dropping handle");
                        self.poller.disconnect().await;
                    } else {
                        warn!(device = %kind, error = %err, errors, "Poll failed");
                    }

                    if errors > self.policy.error_threshold {
                        warn!(
                            device = %kind,
                            errors,
                            cooldown = ?self.policy.cooldown,
                            "Too many consecutive errors, pausing"
                        );
                        self.mark_gaps();
                        errors = 0;
                        deadline = Instant::now() + self.policy.cooldown;
                    } else {
                        deadline = Instant::now() + self.policy.backoff(errors, interval);
                    }
                }
            }
        }

        debug!(device = %kind, "Poller loop exited");
        self.poller
    }

    /// Bounded connection attempts. Returns false when every attempt failed
    /// or the poller was stopped meanwhile.
    async fn startup(&mut self) -> bool {
        let kind = self.poller.kind();
        let attempts = self.policy.startup_attempts;
        for attempt in 1..=attempts {
            if self.ctx.stop.is_stopped() {
                return false;
            }
            match self.poller.connect(&self.ctx).await {
                Ok(()) => {
                    info!(device = %kind, "Connected");
                    return true;
                }
                Err(err) => {
                    warn!(device = %kind, attempt, attempts, error = %err, "Connection attempt failed");
                }
            }
            if attempt < attempts {
                let delay = self.policy.backoff(attempt, self.policy.startup_delay);
                if !self.idle_until(Instant::now() + delay).await {
                    return false;
                }
            }
        }
        false
    }

    /// Answer control requests with "not connected" until stopped.
    async fn serve_disabled(&mut self) {
        while self.control_open || !self.ctx.stop.is_stopped() {
            tokio::select! {
                _ = self.ctx.stop.wait() => return,
                message = self.control.recv(), if self.control_open => match message {
                    Some(message) => self.reject(message),
                    None => self.control_open = false,
                },
            }
        }
    }

    /// Wait for `deadline`, serving control requests meanwhile.
    ///
    /// A command may pull the deadline closer. Returns false once stopped.
    async fn idle_until(&mut self, mut deadline: Instant) -> bool {
        loop {
            if self.ctx.stop.is_stopped() {
                return false;
            }
            tokio::select! {
                _ = self.ctx.stop.wait() => return false,
                _ = sleep_until(deadline) => return true,
                message = self.control.recv(), if self.control_open => match message {
                    Some(message) => {
                        if let Some(refresh) = self.handle(message).await {
                            deadline = deadline.min(Instant::now() + refresh);
                        }
                    }
                    None => self.control_open = false,
                },
            }
        }
    }

    async fn handle(&mut self, message: ControlMessage) -> Option<Duration> {
        if !self.poller.is_connected() && !self.poller.accepts_commands_offline() {
            self.reject(message);
            return None;
        }
        let kind = self.poller.kind();
        match message {
            ControlMessage::Execute { request, reply } => {
                let result = self.poller.execute(&request).await;
                let refresh = match &result {
                    Ok(outcome) => {
                        info!(device = %kind, ack = %outcome.ack, "Command applied");
                        outcome.refresh_after
                    }
                    Err(err) => {
                        error!(device = %kind, error = %err, "Command failed");
                        if let CommandError::Device { source, .. } = err {
                            if source.requires_reconnect() {
                                self.poller.disconnect().await;
                            }
                        }
                        None
                    }
                };
                if reply.send(result).is_err() {
                    warn!(device = %kind, "Command caller went away before the reply");
                }
                refresh
            }
            ControlMessage::FetchSetpoints { scope, reply } => {
                let result = self.poller.fetch_setpoints(&scope).await;
                if let Err(err) = &result {
                    warn!(device = %kind, scope = %scope, error = %err, "Could not fetch setpoints");
                }
                let _ = reply.send(result);
                None
            }
        }
    }

    fn reject(&self, message: ControlMessage) {
        let unavailable = CommandError::DeviceUnavailable(self.poller.kind().label().to_string());
        match message {
            ControlMessage::Execute { reply, .. } => {
                let _ = reply.send(Err(unavailable));
            }
            ControlMessage::FetchSetpoints { reply, .. } => {
                let _ = reply.send(Err(unavailable));
            }
        }
    }

    fn mark_gaps(&self) {
        for key in self.poller.gap_channels() {
            if let Err(err) = self.ctx.store.mark_gap(&key) {
                debug!(channel = %key, error = %err, "Gap not marked");
            }
        }
    }
}

// =============================================================================
// PollerHandle
// =============================================================================

/// Owner-side view of a running poller task.
pub struct PollerHandle {
    kind: DeviceKind,
    stop: StopSignal,
    control: mpsc::Sender<ControlMessage>,
    task: JoinHandle<Box<dyn DevicePoller>>,
}

impl PollerHandle {
    /// Device driven by this task.
    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    /// Sender for control requests, handed to the dispatcher.
    pub fn control(&self) -> mpsc::Sender<ControlMessage> {
        self.control.clone()
    }

    /// Clone of the task's stop signal.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Ask the task to stop. Use `join` to wait for it.
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Wait for the task to finish and take the poller back.
    ///
    /// The task is aborted when it does not finish within `timeout`.
    pub async fn join(self, timeout: Duration) -> AppResult<Box<dyn DevicePoller>> {
        let kind = self.kind;
        let abort = self.task.abort_handle();
        match tokio::time::timeout(timeout, self.task).await {
            Ok(Ok(poller)) => {
                info!(device = %kind, "Poller stopped");
                Ok(poller)
            }
            Ok(Err(join_err)) => {
                error!(device = %kind, error = %join_err, "Poller task panicked");
                Err(MonitorError::TaskFailed {
                    task: kind.to_string(),
                    reason: join_err.to_string(),
                })
            }
            Err(_) => {
                warn!(device = %kind, ?timeout, "Poller did not stop in time, aborting");
                abort.abort();
                Err(MonitorError::TaskFailed {
                    task: kind.to_string(),
                    reason: format!("did not stop within {timeout:?}"),
                })
            }
        }
    }
}

/// Spawn the task of one poller. `ctx.stop` becomes the poller's stop signal.
pub fn spawn_poller(
    poller: Box<dyn DevicePoller>,
    ctx: PollContext,
    policy: ErrorPolicy,
) -> PollerHandle {
    let kind = poller.kind();
    let stop = ctx.stop.clone();
    let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE);
    let runner = PollerRunner::new(poller, ctx, control_rx, policy);
    let task = tokio::spawn(runner.run());
    PollerHandle {
        kind,
        stop,
        control: control_tx,
        task,
    }
}

/// Shorthand for drivers: turn a device error into a command error.
pub fn command_error(kind: DeviceKind, source: DeviceError) -> CommandError {
    CommandError::Device {
        device: kind.label().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = ErrorPolicy {
            error_threshold: 3,
            cooldown: Duration::from_secs(30),
            max_backoff: Duration::from_secs(60),
            startup_attempts: 3,
            startup_delay: Duration::from_secs(2),
        };
        let interval = Duration::from_secs(5);
        assert_eq!(policy.backoff(1, interval), Duration::from_secs(5));
        assert_eq!(policy.backoff(2, interval), Duration::from_secs(10));
        assert_eq!(policy.backoff(3, interval), Duration::from_secs(20));
        assert_eq!(policy.backoff(5, interval), Duration::from_secs(60));
        // Slow pollers never retry faster than they poll.
        assert_eq!(
            policy.backoff(1, Duration::from_secs(600)),
            Duration::from_secs(600)
        );
        assert_eq!(policy.backoff(1, Duration::ZERO), Duration::from_secs(1));
    }

    struct CountingCloser(AtomicUsize);

    impl TaskCloser for CountingCloser {
        fn close(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn stop_closes_registered_closer_once() {
        let stop = StopSignal::new();
        let closer = Arc::new(CountingCloser(AtomicUsize::new(0)));
        stop.set_closer(closer.clone());
        stop.stop();
        stop.stop();
        assert_eq!(closer.0.load(Ordering::SeqCst), 1);

        // Registered after stop: closed immediately.
        let late = Arc::new(CountingCloser(AtomicUsize::new(0)));
        stop.set_closer(late.clone());
        assert_eq!(late.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wait_returns_after_stop() {
        let stop = StopSignal::new();
        let waiter = {
            let stop = stop.clone();
            tokio::spawn(async move { stop.wait().await })
        };
        tokio::task::yield_now().await;
        stop.stop();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        // Already stopped: resolves immediately.
        stop.wait().await;
    }
}
