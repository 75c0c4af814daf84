//! UPS status through apcupsd's `apcaccess` tool.
//!
//! `apcaccess status [host:port]` prints one `KEY      : value` pair per line.
//! The tool is run once per poll; opening the source only checks that the
//! command exists and answers.

use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;

use crate::error::{DeviceError, DeviceResult};
use crate::hardware::capabilities::{UpsConnector, UpsSource};

/// Runs `apcaccess status` against the UPS daemon.
#[derive(Debug, Clone)]
pub struct ApcAccessConnector {
    command: String,
    host: Option<String>,
    timeout: Duration,
}

impl ApcAccessConnector {
    /// `host` is passed as `host[:port]`; `None` queries the local daemon.
    pub fn new(command: impl Into<String>, host: Option<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            host,
            timeout,
        }
    }
}

#[async_trait]
impl UpsConnector for ApcAccessConnector {
    async fn open(&self) -> DeviceResult<Box<dyn UpsSource>> {
        let mut source = ApcAccess {
            command: self.command.clone(),
            host: self.host.clone(),
            timeout: self.timeout,
        };
        source
            .query_status()
            .await
            .map_err(|e| DeviceError::Open(format!("{}: {e}", self.command)))?;
        Ok(Box::new(source))
    }
}

/// One open `apcaccess` session.
pub struct ApcAccess {
    command: String,
    host: Option<String>,
    timeout: Duration,
}

#[async_trait]
impl UpsSource for ApcAccess {
    async fn query_status(&mut self) -> DeviceResult<String> {
        let mut command = Command::new(&self.command);
        command.arg("status").kill_on_drop(true);
        if let Some(host) = &self.host {
            command.arg(host);
        }
        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| DeviceError::Timeout(self.timeout))??;
        if !output.status.success() {
            return Err(DeviceError::Transport(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
