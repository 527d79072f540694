use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

use super::packet::{TelemetryPacket, Values};

/// What to do with a packet that arrives when the queue is full.
///
/// Producers are never made to wait, so there is no blocking policy.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Reject the incoming packet
    #[default]
    DropNewest,
    /// Evict the oldest queued packet to make room for the incoming one
    DropOldest,
}

#[derive(Debug, Error)]
#[error("unknown overflow policy '{0}', expected 'drop-newest' or 'drop-oldest'")]
pub struct InvalidOverflowPolicy(String);

impl FromStr for OverflowPolicy {
    type Err = InvalidOverflowPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drop-newest" => Ok(OverflowPolicy::DropNewest),
            "drop-oldest" => Ok(OverflowPolicy::DropOldest),
            _ => Err(InvalidOverflowPolicy(s.to_owned())),
        }
    }
}

/// Delivery counters for the pipeline.
///
/// These are updated under the same lock as the queue contents, so a
/// snapshot is always consistent with itself.
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueMetrics {
    /// Packets accepted into the queue
    pub enqueued: u64,
    /// Packets discarded because of overflow or a closed queue
    pub dropped_count: u64,
    /// Packets handed to the transport successfully
    pub publish_count: u64,
    /// Packets the worker gave up on
    pub failed_count: u64,
    /// Packets waiting in the queue
    pub pending: usize,
}

#[derive(Debug)]
struct QueueItem {
    packet: TelemetryPacket,
    enqueued_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    items: VecDeque<QueueItem>,
    metrics: QueueMetrics,
    closed: bool,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    available: Notify,
    capacity: Option<usize>,
    policy: OverflowPolicy,
}

/// Bounded multi-producer, single-consumer FIFO of pending packets.
///
/// Cloning the queue yields another handle to the same buffer.
#[derive(Debug, Clone)]
pub struct TelemetryQueue {
    shared: Arc<Shared>,
}

impl TelemetryQueue {
    /// Create a queue holding at most `capacity` packets; `None` means
    /// unbounded.
    pub fn new(capacity: Option<usize>, policy: OverflowPolicy) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                available: Notify::new(),
                capacity,
                policy,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // the critical sections never panic halfway through an update, so
        // the data behind a poisoned lock is still consistent
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a packet without ever blocking the caller.
    ///
    /// Returns `false` if the packet was not accepted, which happens when
    /// the queue is full under [`OverflowPolicy::DropNewest`] or when the
    /// queue has been closed.
    pub fn enqueue(&self, packet: TelemetryPacket) -> bool {
        let mut state = self.lock();

        if state.closed {
            state.metrics.dropped_count += 1;
            return false;
        }

        if let Some(capacity) = self.shared.capacity
            && state.items.len() >= capacity
        {
            match self.shared.policy {
                OverflowPolicy::DropNewest => {
                    state.metrics.dropped_count += 1;
                    trace!(ts = packet.timestamp_ms, "queue full, dropping packet");
                    return false;
                }
                OverflowPolicy::DropOldest => {
                    // with a zero capacity there is nothing to evict
                    if state.items.pop_front().is_none() {
                        state.metrics.dropped_count += 1;
                        return false;
                    }
                    state.metrics.dropped_count += 1;
                    trace!("queue full, evicted oldest packet");
                }
            }
        }

        state.items.push_back(QueueItem {
            packet,
            enqueued_at: Instant::now(),
        });
        state.metrics.enqueued += 1;
        drop(state);

        self.shared.available.notify_one();
        true
    }

    /// Wait for the next packet in FIFO order.
    ///
    /// This is the only suspending operation of the pipeline and it is meant
    /// for the publishing worker alone. Returns `None` once the queue is
    /// closed and drained.
    pub async fn dequeue(&self) -> Option<TelemetryPacket> {
        loop {
            {
                let mut state = self.lock();
                if let Some(item) = state.items.pop_front() {
                    trace!(waited = ?item.enqueued_at.elapsed(), "dequeued packet");
                    return Some(item.packet);
                }
                if state.closed {
                    return None;
                }
            }

            // a notification sent between the check above and this await is
            // kept as a permit, so no wake-up is lost
            self.shared.available.notified().await;
        }
    }

    /// Stop accepting packets. Queued packets can still be dequeued.
    pub fn close(&self) {
        self.lock().closed = true;
        self.shared.available.notify_one();
    }

    pub fn record_published(&self) {
        self.lock().metrics.publish_count += 1;
    }

    pub fn record_failed(&self) {
        self.lock().metrics.failed_count += 1;
    }

    /// A consistent snapshot of the pipeline counters
    pub fn metrics(&self) -> QueueMetrics {
        let state = self.lock();
        QueueMetrics {
            pending: state.items.len(),
            ..state.metrics
        }
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the entry point for components that emit telemetry
    pub fn producer(&self) -> Producer {
        Producer(self.clone())
    }
}

/// The single entry point for any component wishing to emit telemetry.
#[derive(Debug, Clone)]
pub struct Producer(TelemetryQueue);

impl Producer {
    /// Stamp `values` with the current time and queue them.
    ///
    /// Never blocks; returns `false` if the reading was dropped.
    pub fn enqueue(&self, values: Values) -> bool {
        self.0.enqueue(TelemetryPacket::now(values))
    }

    /// Queue an already built packet
    pub fn enqueue_packet(&self, packet: TelemetryPacket) -> bool {
        self.0.enqueue(packet)
    }
}
