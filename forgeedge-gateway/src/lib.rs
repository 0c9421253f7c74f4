//! ForgeEdge gateway - Modbus/TCP to MQTT telemetry bridge
//!
//! Pipeline:
//! - `pool` runs one `worker` per configured device
//! - workers push telemetry records into the bounded `queue`
//! - the `publisher` drains the queue to the broker and listens on the control topic
//! - `reconfig` applies configuration updates received there
//!
//! Collaborators behind traits: `field` (device I/O), `transport` (broker I/O),
//! `store` (configuration persistence).

pub mod config;
pub mod field;
pub mod pool;
pub mod publisher;
pub mod queue;
pub mod reconfig;
pub mod store;
pub mod telemetry;
pub mod transport;
pub mod worker;

pub use config::{GatewayConfig, RuntimeSettings};
pub use pool::WorkerPool;
pub use publisher::{ConnectionState, Publisher, PublisherSettings, PublisherStats};
pub use queue::{QueueItem, TelemetryQueue};
pub use reconfig::{ApplyReport, ControlHandler, ReconfigCoordinator};
pub use store::{ConfigStore, FileConfigStore};
pub use worker::PollSettings;
