//! Modbus register buses over TCP and RTU.
//!
//! Both transports share [`ModbusLink`], which wraps a `tokio_modbus` client
//! context. Every request is bounded by the configured timeout and the three
//! failure layers of a Modbus call are flattened into [`DeviceError`]:
//!
//! | Outcome | Mapped to |
//! |---------|-----------|
//! | no answer within the timeout | `Timeout` (handle kept) |
//! | transport/protocol error | `ConnectionLost` (handle dropped) |
//! | Modbus exception response | `Rejected` (handle kept) |

use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::{error::Elapsed, timeout};
use tokio_modbus::client::Context;
use tokio_modbus::prelude::{Reader, Slave, SlaveContext, Writer};

use crate::error::{DeviceError, DeviceResult};
use crate::hardware::capabilities::{BusConnector, RegisterBus};

/// Connected Modbus client.
pub struct ModbusLink {
    ctx: Context,
    timeout: Duration,
}

impl ModbusLink {
    /// Wrap a connected client context.
    pub fn new(ctx: Context, timeout: Duration) -> Self {
        Self { ctx, timeout }
    }
}

fn flatten<T>(outcome: Result<tokio_modbus::Result<T>, Elapsed>, timeout: Duration) -> DeviceResult<T> {
    match outcome {
        Err(_) => Err(DeviceError::Timeout(timeout)),
        Ok(Err(err)) => Err(DeviceError::ConnectionLost(err.to_string())),
        Ok(Ok(Err(code))) => Err(DeviceError::Rejected(format!("Modbus exception {code:?}"))),
        Ok(Ok(Ok(value))) => Ok(value),
    }
}

#[async_trait]
impl RegisterBus for ModbusLink {
    async fn read_holding_registers(
        &mut self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> DeviceResult<Vec<u16>> {
        self.ctx.set_slave(Slave(unit));
        let outcome = timeout(self.timeout, self.ctx.read_holding_registers(address, count)).await;
        flatten(outcome, self.timeout)
    }

    async fn read_input_registers(
        &mut self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> DeviceResult<Vec<u16>> {
        self.ctx.set_slave(Slave(unit));
        let outcome = timeout(self.timeout, self.ctx.read_input_registers(address, count)).await;
        flatten(outcome, self.timeout)
    }

    async fn read_coils(&mut self, unit: u8, address: u16, count: u16) -> DeviceResult<Vec<bool>> {
        self.ctx.set_slave(Slave(unit));
        let outcome = timeout(self.timeout, self.ctx.read_coils(address, count)).await;
        let mut coils = flatten(outcome, self.timeout)?;
        // Coils arrive packed in whole bytes.
        coils.truncate(usize::from(count));
        Ok(coils)
    }

    async fn write_coil(&mut self, unit: u8, address: u16, value: bool) -> DeviceResult<()> {
        self.ctx.set_slave(Slave(unit));
        let outcome = timeout(self.timeout, self.ctx.write_single_coil(address, value)).await;
        flatten(outcome, self.timeout)
    }
}

/// Modbus TCP endpoint, e.g. a networked PDU.
#[derive(Debug, Clone)]
pub struct ModbusTcpConnector {
    host: String,
    port: u16,
    timeout: Duration,
}

impl ModbusTcpConnector {
    /// Modbus TCP endpoint at `host:port`.
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }

    async fn resolve(&self) -> DeviceResult<SocketAddr> {
        let target = format!("{}:{}", self.host, self.port);
        let addr = tokio::net::lookup_host(&target)
            .await
            .map_err(|e| DeviceError::Open(format!("{target}: {e}")))?
            .next();
        addr.ok_or_else(|| DeviceError::Open(format!("{target}: no address")))
    }
}

#[async_trait]
impl BusConnector for ModbusTcpConnector {
    async fn open(&self) -> DeviceResult<Box<dyn RegisterBus>> {
        let addr = self.resolve().await?;
        let ctx = tokio::time::timeout(self.timeout, tokio_modbus::client::tcp::connect(addr))
            .await
            .map_err(|_| DeviceError::Open(format!("{addr}: connect timed out")))?
            .map_err(|e| DeviceError::Open(format!("{addr}: {e}")))?;
        Ok(Box::new(ModbusLink::new(ctx, self.timeout)))
    }
}

/// Modbus RTU device on a serial port.
#[cfg(feature = "instrument_serial")]
#[derive(Debug, Clone)]
pub struct ModbusRtuConnector {
    port: String,
    baud_rate: u32,
    timeout: Duration,
}

#[cfg(feature = "instrument_serial")]
impl ModbusRtuConnector {
    /// Modbus RTU line on `port`.
    pub fn new(port: impl Into<String>, baud_rate: u32, timeout: Duration) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            timeout,
        }
    }
}

#[cfg(feature = "instrument_serial")]
#[async_trait]
impl BusConnector for ModbusRtuConnector {
    async fn open(&self) -> DeviceResult<Box<dyn RegisterBus>> {
        use tokio_serial::SerialPortBuilderExt;

        let stream = tokio_serial::new(&self.port, self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .timeout(self.timeout)
            .open_native_async()
            .map_err(|e| DeviceError::Open(format!("{}: {e}", self.port)))?;
        let ctx = tokio_modbus::client::rtu::attach(stream);
        Ok(Box::new(ModbusLink::new(ctx, self.timeout)))
    }
}

/// Two's-complement reinterpretation of a 16-bit register.
pub fn signed_register(raw: u16) -> i16 {
    raw as i16
}

/// Big-endian pair of registers as one 32-bit value.
pub fn u32_from_registers(high: u16, low: u16) -> u32 {
    (u32::from(high) << 16) | u32::from(low)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_decoding() {
        assert_eq!(signed_register(0xFFFF), -1);
        assert_eq!(signed_register(0xFF38), -200);
        assert_eq!(signed_register(250), 250);
        assert_eq!(u32_from_registers(0x0001, 0x86A0), 100_000);
    }

    #[tokio::test]
    async fn tcp_target_resolves_to_socket_address() {
        let connector = ModbusTcpConnector::new("127.0.0.1", 502, Duration::from_secs(1));
        let addr = connector.resolve().await.unwrap();
        assert_eq!(addr, SocketAddr::from(([127, 0, 0, 1], 502)));
    }

    #[tokio::test]
    async fn tcp_connect_to_closed_port_fails_to_open() {
        // Port 9 on localhost is not expected to run a Modbus server.
        let connector = ModbusTcpConnector::new("127.0.0.1", 9, Duration::from_millis(300));
        let err = connector.open().await.err();
        assert!(matches!(err, Some(DeviceError::Open(_))));
    }
}
