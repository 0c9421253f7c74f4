//! Field-protocol boundary
//!
//! The poll workers only see these traits:
//! - `FieldBus` opens a connection to one device endpoint
//! - `FieldConnection` issues typed reads and closes the link
//!
//! Wire framing lives in the implementations (`modbus` for Modbus/TCP).

pub mod modbus;

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub use modbus::ModbusTcpBus;

/// Read primitive selected by a parameter's kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterKind {
    Coil,
    DiscreteInput,
    HoldingRegister,
    InputRegister,
}

impl RegisterKind {
    /// Name used in configuration documents and telemetry payloads
    pub fn as_str(&self) -> &'static str {
        match self {
            RegisterKind::Coil => "coil",
            RegisterKind::DiscreteInput => "discrete",
            RegisterKind::HoldingRegister => "holding",
            RegisterKind::InputRegister => "input",
        }
    }

    pub fn is_bit(&self) -> bool {
        matches!(self, RegisterKind::Coil | RegisterKind::DiscreteInput)
    }

    /// Largest element count a single read request may ask for
    pub fn max_count(&self) -> u16 {
        if self.is_bit() {
            2000
        } else {
            125
        }
    }
}

impl fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a device lives on the field network
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceEndpoint {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
}

impl fmt::Display for DeviceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} (unit {})", self.host, self.port, self.unit_id)
    }
}

/// Values returned by one read request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadValues {
    Bits(Vec<bool>),
    Registers(Vec<u16>),
}

impl ReadValues {
    pub fn len(&self) -> usize {
        match self {
            ReadValues::Bits(bits) => bits.len(),
            ReadValues::Registers(regs) => regs.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Error)]
pub enum FieldError {
    #[error("cannot resolve device address {0}")]
    Resolve(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("device exception: {0}")]
    Exception(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl FieldError {
    /// Whether the link has to be re-established before the next read.
    /// A device exception is a well-formed reply, so the link is still good.
    pub fn breaks_connection(&self) -> bool {
        !matches!(self, FieldError::Exception(_))
    }
}

#[async_trait]
pub trait FieldBus: Send + Sync {
    async fn connect(&self, endpoint: &DeviceEndpoint) -> Result<Box<dyn FieldConnection>, FieldError>;
}

#[async_trait]
pub trait FieldConnection: Send {
    async fn read(&mut self, kind: RegisterKind, address: u16, count: u16) -> Result<ReadValues, FieldError>;

    async fn close(&mut self);
}
