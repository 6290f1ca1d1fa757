/*!
# Marstek DevKit - Stubs and utilities for poller development

Library used by the poller test suites:
- MQTT stub that records publications without a broker
- Scripted fake battery speaking the UDP JSON-RPC protocol
- Builders for device replies
- Harness with assertions on published topics
*/

pub mod mqtt_stub;
pub mod fake_device;
pub mod replies;
pub mod test_utils;

pub use mqtt_stub::MockMqttClient;
pub use fake_device::{FakeDevice, Step};
pub use replies::ReplyBuilder;
pub use test_utils::TestHarness;
