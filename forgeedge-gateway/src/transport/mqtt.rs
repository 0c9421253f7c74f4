//! MQTT transport over rumqttc
//!
//! Each `connect` builds a fresh `AsyncClient`/`EventLoop` pair and polls it
//! until CONNACK. The session is dropped on the first event loop error; the
//! publisher decides when to open a new one.

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions,
    Outgoing, Packet, QoS, Transport as NetTransport,
};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use super::{Connector, InboundMessage, Transport, TransportError};
use crate::config::{MqttConfig, SecurityMode};

const REQUEST_CHANNEL_CAPACITY: usize = 10;

impl From<ConnectionError> for TransportError {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::ConnectionRefused(code) => TransportError::Refused(format!("{code:?}")),
            ConnectionError::Io(io) => TransportError::Connection(io.to_string()),
            other => TransportError::Connection(other.to_string()),
        }
    }
}

impl From<ClientError> for TransportError {
    fn from(e: ClientError) -> Self {
        TransportError::Client(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct MqttConnector {
    /// Bound on TCP/TLS setup plus CONNACK
    pub connect_timeout: Duration,
    /// Bound on SUBACK and PUBACK
    pub ack_timeout: Duration,
}

impl Default for MqttConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(10),
        }
    }
}

impl MqttConnector {
    async fn options(&self, config: &MqttConfig) -> Result<MqttOptions, TransportError> {
        let mut options = MqttOptions::new(config.client_id.clone(), config.broker.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(u64::from(config.keep_alive_secs)));
        options.set_clean_session(true);

        if !config.username.is_empty() {
            options.set_credentials(config.username.clone(), config.password.clone());
        }

        if config.security_mode == SecurityMode::Tls {
            let tls = &config.tls;
            let ca = tokio::fs::read(&tls.ca_cert).await?;
            let client_auth = if tls.client_cert.is_empty() {
                None
            } else {
                let cert = tokio::fs::read(&tls.client_cert).await?;
                let key = tokio::fs::read(&tls.client_key).await?;
                Some((cert, key))
            };
            if !tls.verify_peer {
                warn!("verify_peer=false is not supported, broker certificate will still be verified");
            }
            options.set_transport(NetTransport::tls(ca, client_auth, None));
        }

        Ok(options)
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(&self, config: &MqttConfig) -> Result<Box<dyn Transport>, TransportError> {
        let options = self.options(config).await?;
        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let deadline = Instant::now() + self.connect_timeout;

        loop {
            let event = timeout_at(deadline, eventloop.poll())
                .await
                .map_err(|_| TransportError::Timeout(self.connect_timeout))??;

            if let Event::Incoming(Packet::ConnAck(ack)) = event {
                if ack.code != ConnectReturnCode::Success {
                    return Err(TransportError::Refused(format!("{:?}", ack.code)));
                }
                break;
            }
        }

        info!("MQTT session open to {}:{} as {}", config.broker, config.port, config.client_id);
        Ok(Box::new(MqttTransport {
            client,
            eventloop,
            inbound: VecDeque::new(),
            ack_timeout: self.ack_timeout,
        }))
    }
}

pub struct MqttTransport {
    client: AsyncClient,
    eventloop: EventLoop,
    /// Messages that arrived while waiting for an acknowledgement
    inbound: VecDeque<InboundMessage>,
    ack_timeout: Duration,
}

impl MqttTransport {
    /// Poll the event loop until `done` matches an event, buffering inbound
    /// publishes on the way.
    async fn poll_until(&mut self, mut done: impl FnMut(&Event) -> bool + Send) -> Result<(), TransportError> {
        let deadline = Instant::now() + self.ack_timeout;
        loop {
            let event = timeout_at(deadline, self.eventloop.poll())
                .await
                .map_err(|_| TransportError::Timeout(self.ack_timeout))?
                .map_err(|e| {
                    debug!("MQTT event loop error: {}", e);
                    TransportError::ConnectionLost
                })?;

            if done(&event) {
                return Ok(());
            }
            if let Event::Incoming(Packet::Publish(publish)) = event {
                self.inbound.push_back(InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                });
            }
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.client.subscribe(topic, QoS::AtLeastOnce).await?;
        self.poll_until(|event| matches!(event, Event::Incoming(Packet::SubAck(_))))
            .await?;
        debug!("Subscribed to {}", topic);
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
            .await?;

        let mut pkid = None;
        self.poll_until(|event| match event {
            Event::Outgoing(Outgoing::Publish(id)) => {
                pkid = Some(*id);
                false
            }
            Event::Incoming(Packet::PubAck(ack)) => pkid == Some(ack.pkid),
            _ => false,
        })
        .await
    }

    async fn next_event(&mut self) -> Result<InboundMessage, TransportError> {
        if let Some(message) = self.inbound.pop_front() {
            return Ok(message);
        }

        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    return Ok(InboundMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("MQTT event loop error: {}", e);
                    return Err(TransportError::ConnectionLost);
                }
            }
        }
    }

    async fn disconnect(&mut self) {
        if self.client.disconnect().await.is_err() {
            return;
        }
        // Let the event loop flush the DISCONNECT packet
        let _ = tokio::time::timeout(Duration::from_millis(200), async {
            while let Ok(event) = self.eventloop.poll().await {
                if matches!(event, Event::Outgoing(Outgoing::Disconnect)) {
                    break;
                }
            }
        })
        .await;
    }
}
