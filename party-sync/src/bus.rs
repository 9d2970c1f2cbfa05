//! Cross-context storage signals.
//!
//! Several [`Store`](crate::store::Store) contexts can share one durable
//! medium on a device. After a successful durable write a context
//! publishes a [`StorageSignal`] carrying the key and the new value; every
//! other context attached to the same bus re-dispatches it to its own
//! subscribers. Delivery is best effort: slow listeners lag and drop.
//!
//! Uses a tokio broadcast channel for O(1) send to all listeners.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// One cross-context write notification.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageSignal {
    /// Context that performed the write
    pub origin: Uuid,
    /// Storage key written
    pub key: String,
    /// Serialized value written
    pub value: String,
}

/// Statistics for monitoring bus health.
#[derive(Debug, Clone, Default)]
pub struct BusStats {
    pub signals_sent: u64,
    pub signals_dropped: u64,
    pub listeners: usize,
}

struct AtomicBusStats {
    signals_sent: AtomicU64,
    signals_dropped: AtomicU64,
}

/// Fan-out channel shared by the contexts of one device.
#[derive(Clone)]
pub struct SignalBus {
    sender: broadcast::Sender<Arc<StorageSignal>>,
    capacity: usize,
    stats: Arc<AtomicBusStats>,
}

impl SignalBus {
    /// `capacity` bounds how many signals a listener may fall behind.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            stats: Arc::new(AtomicBusStats {
                signals_sent: AtomicU64::new(0),
                signals_dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Publish a signal. Returns the number of listeners reached.
    pub fn publish(&self, signal: StorageSignal) -> usize {
        self.stats.signals_sent.fetch_add(1, Ordering::Relaxed);
        self.sender.send(Arc::new(signal)).unwrap_or(0)
    }

    pub fn listen(&self) -> broadcast::Receiver<Arc<StorageSignal>> {
        self.sender.subscribe()
    }

    /// Record signals a listener lost to lag.
    pub(crate) fn record_dropped(&self, n: u64) {
        self.stats.signals_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            signals_sent: self.stats.signals_sent.load(Ordering::Relaxed),
            signals_dropped: self.stats.signals_dropped.load(Ordering::Relaxed),
            listeners: self.sender.receiver_count(),
        }
    }
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(key: &str) -> StorageSignal {
        StorageSignal {
            origin: Uuid::new_v4(),
            key: key.to_string(),
            value: "[]".to_string(),
        }
    }

    #[tokio::test]
    async fn test_publish_fan_out() {
        let bus = SignalBus::new(16);
        let mut rx1 = bus.listen();
        let mut rx2 = bus.listen();

        assert_eq!(bus.publish(signal("players:ABCD")), 2);

        assert_eq!(rx1.recv().await.unwrap().key, "players:ABCD");
        assert_eq!(rx2.recv().await.unwrap().key, "players:ABCD");
    }

    #[test]
    fn test_publish_without_listeners() {
        let bus = SignalBus::new(16);
        assert_eq!(bus.publish(signal("rolls:local")), 0);
        let stats = bus.stats();
        assert_eq!(stats.signals_sent, 1);
        assert_eq!(stats.listeners, 0);
    }

    #[tokio::test]
    async fn test_lagging_listener() {
        let bus = SignalBus::new(2);
        let mut rx = bus.listen();
        for i in 0..5 {
            bus.publish(signal(&format!("rolls:{i}")));
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => {
                bus.record_dropped(n);
                assert_eq!(n, 3);
            }
            other => panic!("expected lag, got {other:?}"),
        }
        assert_eq!(bus.stats().signals_dropped, 3);
        assert_eq!(bus.capacity(), 2);
    }
}
