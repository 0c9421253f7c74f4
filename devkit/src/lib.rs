/*!
# ForgeEdge DevKit - stubs and helpers for gateway development

Runs the gateway pipeline without a broker or field devices:
- In-memory MQTT broker stub (`MockConnector`)
- Scripted Modbus devices (`MockFieldBus`)
- In-memory configuration store
- Configuration document builders
- A harness wiring the real queue, pool, coordinator and publisher to the stubs
*/

pub mod field_stub;
pub mod fixtures;
pub mod mqtt_stub;
pub mod test_utils;

pub use field_stub::{MockFieldBus, ReadRecord};
pub use fixtures::{ConfigBuilder, DeviceBuilder, MemoryStore};
pub use mqtt_stub::{MockConnector, MockMessage};
pub use test_utils::TestHarness;
