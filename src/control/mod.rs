//! Operator and interlock control of the HV crate and the PDU.
//!
//! - [`command`]: request, scope and outcome types
//! - [`dispatcher`]: validation and hand-off to the owning poller task

pub mod command;
pub mod dispatcher;

pub use command::{CommandAction, CommandOutcome, CommandRequest, Scope, Setpoints};
pub use dispatcher::{CommandDispatcher, CommandSink, ControlLayout, DEFAULT_REPLY_TIMEOUT};
