/*
Everything related to moving sensor readings off the device.

Producers hand readings to a bounded queue that never blocks them; a single
publishing worker drains the queue and sends each packet over MQTT. Delivery
is best-effort: packets that cannot be queued or published are counted and
dropped, never retried.
*/

mod packet;
mod queue;
mod transport;
mod worker;

pub use packet::{Reading, Scalar, TelemetryPacket, Values};
pub use queue::{OverflowPolicy, Producer, QueueMetrics, TelemetryQueue};
pub use transport::{MqttConfig, MqttTransport, PublishError, TELEMETRY_TOPIC, Transport};
pub use worker::Publisher;
