/*!
In-memory MQTT broker stub

Implements the gateway's `Connector`/`Transport` seam without a broker.
Every publish is recorded; tests can refuse connects, fail publishes, inject
control messages and cut the live session.
*/

use anyhow::Result;
use async_trait::async_trait;
use forgeedge_gateway::config::MqttConfig;
use forgeedge_gateway::transport::{Connector, InboundMessage, Transport, TransportError};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

enum SessionEvent {
    Message(InboundMessage),
    Lost,
}

#[derive(Default)]
struct BrokerState {
    published: Vec<MockMessage>,
    subscriptions: Vec<String>,
    /// `broker:port` of every accepted session, in order
    sessions: Vec<String>,
    publish_attempts: usize,
    refuse_connects: usize,
    fail_publishes: usize,
    live: Option<mpsc::UnboundedSender<SessionEvent>>,
}

/// Shared handle to the stub broker. Clones observe the same state.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<BrokerState>>,
}

pub struct MockTransport {
    state: Arc<Mutex<BrokerState>>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    lost: bool,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `n` connect attempts
    pub fn refuse_connects(&self, n: usize) {
        self.state.lock().unwrap().refuse_connects = n;
    }

    /// Fail the next `n` publish attempts as if the connection dropped
    pub fn fail_publishes(&self, n: usize) {
        self.state.lock().unwrap().fail_publishes = n;
    }

    /// Deliver a message to the live session's subscriber
    pub fn simulate_incoming<S, V>(&self, topic: S, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let message = InboundMessage {
            topic: topic.into(),
            payload: payload.into(),
        };
        log::info!("📨 [MOCK] Simulated incoming: {}", message.topic);
        self.send(SessionEvent::Message(message))
    }

    /// Report the live session as lost
    pub fn drop_connection(&self) -> Result<()> {
        log::info!("🔌 [MOCK] Dropping live session");
        self.send(SessionEvent::Lost)
    }

    fn send(&self, event: SessionEvent) -> Result<()> {
        let state = self.state.lock().unwrap();
        let sender = state
            .live
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("No live MQTT session"))?;
        sender
            .send(event)
            .map_err(|_| anyhow::anyhow!("Live MQTT session already closed"))
    }

    pub fn is_connected(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .live
            .as_ref()
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.state.lock().unwrap().published.clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.state
            .lock()
            .unwrap()
            .published
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Parse every message published on `topic` as JSON
    pub fn json_messages<T>(&self, topic: &str) -> Result<Vec<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        self.find_messages_by_topic(topic)
            .iter()
            .map(|msg| serde_json::from_slice(&msg.payload).map_err(anyhow::Error::from))
            .collect()
    }

    pub fn get_last_json_message<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.find_messages_by_topic(topic).last() {
            Some(msg) => Ok(Some(serde_json::from_slice(&msg.payload)?)),
            None => Ok(None),
        }
    }

    pub fn get_subscriptions(&self) -> Vec<String> {
        self.state.lock().unwrap().subscriptions.clone()
    }

    pub fn sessions(&self) -> Vec<String> {
        self.state.lock().unwrap().sessions.clone()
    }

    pub fn publish_attempts(&self) -> usize {
        self.state.lock().unwrap().publish_attempts
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, config: &MqttConfig) -> Result<Box<dyn Transport>, TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            log::info!("🚫 [MOCK] Refused connect to {}:{}", config.broker, config.port);
            return Err(TransportError::Connection("connection refused".into()));
        }

        let (tx, events) = mpsc::unbounded_channel();
        state.live = Some(tx);
        state.sessions.push(format!("{}:{}", config.broker, config.port));
        log::info!("🔗 [MOCK] Session open to {}:{}", config.broker, config.port);

        Ok(Box::new(MockTransport {
            state: self.state.clone(),
            events,
            lost: false,
        }))
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.state.lock().unwrap().subscriptions.push(topic.to_string());
        log::info!("📥 [MOCK] Subscribed to {}", topic);
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        if self.lost {
            return Err(TransportError::ConnectionLost);
        }

        let mut state = self.state.lock().unwrap();
        state.publish_attempts += 1;
        if state.fail_publishes > 0 {
            state.fail_publishes -= 1;
            self.lost = true;
            log::info!("💥 [MOCK] Publish to {} failed", topic);
            return Err(TransportError::ConnectionLost);
        }

        state.published.push(MockMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });
        log::info!("📤 [MOCK] Published to {}: {} bytes", topic, payload.len());
        Ok(())
    }

    async fn next_event(&mut self) -> Result<InboundMessage, TransportError> {
        if self.lost {
            return Err(TransportError::ConnectionLost);
        }

        match self.events.recv().await {
            Some(SessionEvent::Message(message)) => Ok(message),
            Some(SessionEvent::Lost) | None => {
                self.lost = true;
                Err(TransportError::ConnectionLost)
            }
        }
    }

    async fn disconnect(&mut self) {
        self.events.close();
        log::info!("👋 [MOCK] Session closed");
    }
}
