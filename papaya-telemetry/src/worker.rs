use tracing::{info, instrument, trace, warn};

use super::packet::TelemetryPacket;
use super::queue::TelemetryQueue;
use super::transport::Transport;

/// The publishing worker.
///
/// There must be exactly one per queue: it is the queue's only consumer and
/// owns the wire connection for the lifetime of the process.
pub struct Publisher<T> {
    queue: TelemetryQueue,
    transport: T,
}

impl<T: Transport> Publisher<T> {
    pub fn new(queue: TelemetryQueue, transport: T) -> Self {
        Self { queue, transport }
    }

    #[cfg(test)]
    fn transport(&self) -> &T {
        &self.transport
    }

    /// Serialize and send a single packet.
    ///
    /// Failures are logged and counted, never propagated: delivery is
    /// best-effort and the packet is not retried.
    pub async fn publish(&self, topic: &str, packet: &TelemetryPacket) -> bool {
        let res = match packet.to_payload() {
            Ok(payload) => self.transport.publish(topic, payload).await,
            Err(e) => Err(e.into()),
        };

        match res {
            Ok(()) => {
                self.queue.record_published();
                trace!(ts = packet.timestamp_ms, "packet published");
                true
            }
            Err(e) => {
                self.queue.record_failed();
                warn!(ts = packet.timestamp_ms, "publish failed: {e}");
                false
            }
        }
    }

    /// Drain the queue until it is closed and empty, publishing every
    /// packet on `topic` in the order it was queued.
    #[instrument(name = "publish", skip_all, fields(topic = topic))]
    pub async fn run(self, topic: &str) -> T {
        info!("waiting for telemetry");
        while let Some(packet) = self.queue.dequeue().await {
            self.publish(topic, &packet).await;
        }

        let metrics = self.queue.metrics();
        info!(
            published = metrics.publish_count,
            failed = metrics.failed_count,
            dropped = metrics.dropped_count,
            "telemetry queue closed"
        );
        self.transport
    }
}
