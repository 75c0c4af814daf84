//! Line-oriented serial instruments.
//!
//! Protocol shape shared by the radon monitor and SCPI-over-serial devices:
//! - ASCII commands terminated by a configurable terminator (`\r\n` by default)
//! - one reply line per query, terminated by LF
//! - 8N1, no flow control
//!
//! # Example Usage
//!
//! ```no_run
//! use lab_monitor::hardware::serial_line::SerialLineConnector;
//! use lab_monitor::hardware::capabilities::LineConnector;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let connector = SerialLineConnector::new("/dev/ttyUSB0", 19200, Duration::from_secs(2));
//!     let mut line = connector.open().await?;
//!     let reply = line.query("VALUE?").await?;
//!     println!("{reply}");
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use crate::error::{DeviceError, DeviceResult};
use crate::hardware::capabilities::{LineConnector, LineInstrument};

/// Serial port settings for a line instrument.
#[derive(Debug, Clone)]
pub struct SerialLineConnector {
    port: String,
    baud_rate: u32,
    timeout: Duration,
    terminator: String,
}

impl SerialLineConnector {
    /// Line settings for `port`. Nothing is opened until [`LineConnector::open`].
    pub fn new(port: impl Into<String>, baud_rate: u32, timeout: Duration) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            timeout,
            terminator: "\r\n".to_string(),
        }
    }

    /// Replace the command terminator.
    pub fn with_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.terminator = terminator.into();
        self
    }
}

#[async_trait]
impl LineConnector for SerialLineConnector {
    async fn open(&self) -> DeviceResult<Box<dyn LineInstrument>> {
        let stream = tokio_serial::new(&self.port, self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(self.timeout)
            .open_native_async()
            .map_err(|e| DeviceError::Open(format!("{}: {e}", self.port)))?;

        Ok(Box::new(SerialLine {
            port: BufReader::new(stream),
            timeout: self.timeout,
            terminator: self.terminator.clone(),
        }))
    }
}

/// Open serial line.
pub struct SerialLine {
    port: BufReader<SerialStream>,
    timeout: Duration,
    terminator: String,
}

#[async_trait]
impl LineInstrument for SerialLine {
    async fn write_line(&mut self, command: &str) -> DeviceResult<()> {
        let framed = format!("{command}{}", self.terminator);
        let port = self.port.get_mut();
        port.write_all(framed.as_bytes()).await?;
        port.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> DeviceResult<String> {
        let mut response = String::new();
        let read = tokio::time::timeout(self.timeout, self.port.read_line(&mut response))
            .await
            .map_err(|_| DeviceError::Timeout(self.timeout))??;
        if read == 0 {
            return Err(DeviceError::ConnectionLost("serial port closed".to_string()));
        }
        Ok(response.trim_end_matches(['\r', '\n']).to_string())
    }
}
