//! Modbus/TCP field bus backed by `tokio-modbus`

use async_trait::async_trait;
use tokio::net::lookup_host;
use tokio_modbus::client::{tcp, Client as _, Context, Reader as _};
use tokio_modbus::slave::Slave;
use tracing::debug;

use super::{DeviceEndpoint, FieldBus, FieldConnection, FieldError, ReadValues, RegisterKind};

#[derive(Debug, Default, Clone)]
pub struct ModbusTcpBus;

impl ModbusTcpBus {
    pub fn new() -> Self {
        Self
    }
}

pub struct ModbusTcpConnection {
    ctx: Context,
}

impl From<tokio_modbus::Error> for FieldError {
    fn from(e: tokio_modbus::Error) -> Self {
        match e {
            tokio_modbus::Error::Transport(io) => FieldError::Io(io),
            other => FieldError::Protocol(other.to_string()),
        }
    }
}

impl From<tokio_modbus::ExceptionCode> for FieldError {
    fn from(code: tokio_modbus::ExceptionCode) -> Self {
        FieldError::Exception(format!("{code:?}"))
    }
}

#[async_trait]
impl FieldBus for ModbusTcpBus {
    async fn connect(&self, endpoint: &DeviceEndpoint) -> Result<Box<dyn FieldConnection>, FieldError> {
        let socket_addr = lookup_host((endpoint.host.as_str(), endpoint.port))
            .await?
            .next()
            .ok_or_else(|| FieldError::Resolve(endpoint.to_string()))?;

        // Unit 0 selects the Modbus/TCP default unit identifier
        let slave = if endpoint.unit_id == 0 {
            Slave::tcp_device()
        } else {
            Slave(endpoint.unit_id)
        };

        let ctx = tcp::connect_slave(socket_addr, slave).await?;
        debug!("Modbus connection established to {}", endpoint);
        Ok(Box::new(ModbusTcpConnection { ctx }))
    }
}

#[async_trait]
impl FieldConnection for ModbusTcpConnection {
    async fn read(&mut self, kind: RegisterKind, address: u16, count: u16) -> Result<ReadValues, FieldError> {
        let values = match kind {
            RegisterKind::Coil => ReadValues::Bits(self.ctx.read_coils(address, count).await??),
            RegisterKind::DiscreteInput => {
                ReadValues::Bits(self.ctx.read_discrete_inputs(address, count).await??)
            }
            RegisterKind::HoldingRegister => {
                ReadValues::Registers(self.ctx.read_holding_registers(address, count).await??)
            }
            RegisterKind::InputRegister => {
                ReadValues::Registers(self.ctx.read_input_registers(address, count).await??)
            }
        };
        Ok(values)
    }

    async fn close(&mut self) {
        if let Err(e) = self.ctx.disconnect().await {
            debug!("Modbus disconnect failed: {}", e);
        }
    }
}
