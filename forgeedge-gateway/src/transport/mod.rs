//! Broker-facing transport seam
//!
//! The publisher drives a `Transport` through connect, subscribe, publish and
//! event polling without knowing the wire protocol. `mqtt` provides the
//! rumqttc-backed implementation; tests plug in scripted ones.

pub mod mqtt;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::config::MqttConfig;

pub use mqtt::MqttConnector;

/// Message received on a subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("connection lost")]
    ConnectionLost,
    #[error("broker refused connection: {0}")]
    Refused(String),
    #[error("no acknowledgement within {0:?}")]
    Timeout(Duration),
    #[error("client error: {0}")]
    Client(String),
    #[error("TLS material unreadable: {0}")]
    Tls(#[from] std::io::Error),
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a session and return once the broker has accepted it
    async fn connect(&self, config: &MqttConfig) -> Result<Box<dyn Transport>, TransportError>;
}

#[async_trait]
pub trait Transport: Send {
    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    /// Publish at-least-once and return after the broker acknowledged it
    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError>;

    /// Next inbound message. Cancel-safe: dropping the future loses nothing.
    async fn next_event(&mut self) -> Result<InboundMessage, TransportError>;

    async fn disconnect(&mut self);
}
