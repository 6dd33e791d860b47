//! Publish/subscribe bus with one channel per file.
//!
//! Uses tokio broadcast channels: a publish is delivered, in publish order,
//! to every current subscriber of the channel, including the publishing
//! server. Sender exclusion is the subscriber's job.
//!
//! Each server instance holds at most one subscription per file (see
//! [`ConnectionRegistry`](crate::registry::ConnectionRegistry)), so the
//! subscriber count of a channel is the number of server instances that
//! still have editors on that file.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::protocol::BusMessage;

/// Statistics for monitoring bus health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub lagged: u64,
    pub channels: usize,
}

/// Lock-free counters updated on the publish path.
#[derive(Default)]
struct AtomicBusStats {
    published: AtomicU64,
    delivered: AtomicU64,
    lagged: AtomicU64,
}

/// The bus.
pub struct Bus {
    channels: RwLock<HashMap<String, broadcast::Sender<Arc<BusMessage>>>>,
    /// Messages buffered per subscriber before it starts lagging.
    capacity: usize,
    stats: AtomicBusStats,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            stats: AtomicBusStats::default(),
        }
    }

    /// Subscribe to a channel, creating it on first use.
    pub async fn subscribe(&self, channel: &str) -> broadcast::Receiver<Arc<BusMessage>> {
        {
            let channels = self.channels.read().await;
            if let Some(sender) = channels.get(channel) {
                return sender.subscribe();
            }
        }

        let mut channels = self.channels.write().await;
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publish to `message.channel`. Returns the number of subscribers
    /// the message was queued for; zero when nobody listens.
    pub async fn publish(&self, message: BusMessage) -> usize {
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        let channels = self.channels.read().await;
        let delivered = match channels.get(&message.channel) {
            Some(sender) => sender.send(Arc::new(message)).unwrap_or(0),
            None => 0,
        };
        self.stats
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Number of live subscriptions on a channel.
    pub async fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .await
            .get(channel)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Drop a channel that no longer has subscribers.
    pub async fn prune(&self, channel: &str) -> bool {
        let mut channels = self.channels.write().await;
        match channels.get(channel) {
            Some(sender) if sender.receiver_count() == 0 => {
                channels.remove(channel);
                true
            }
            _ => false,
        }
    }

    /// Record messages a subscriber skipped because it fell behind.
    pub fn record_lag(&self, skipped: u64) {
        self.stats.lagged.fetch_add(skipped, Ordering::Relaxed);
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn stats(&self) -> BusStats {
        BusStats {
            published: self.stats.published.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            lagged: self.stats.lagged.load(Ordering::Relaxed),
            channels: self.channel_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(channel: &str, body: &str) -> BusMessage {
        BusMessage::new(channel, Some("alice".into()), body)
    }

    #[tokio::test]
    async fn test_fan_out_includes_publisher() {
        let bus = Bus::new(16);
        let mut rx1 = bus.subscribe("f").await;
        let mut rx2 = bus.subscribe("f").await;

        assert_eq!(bus.publish(msg("f", "hello")).await, 2);
        assert_eq!(&*rx1.recv().await.unwrap().body, "hello");
        assert_eq!(&*rx2.recv().await.unwrap().body, "hello");
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let bus = Bus::new(16);
        let mut rx_f = bus.subscribe("f").await;
        let mut rx_g = bus.subscribe("g").await;

        bus.publish(msg("g", "for g")).await;
        assert!(rx_f.try_recv().is_err());
        assert_eq!(&*rx_g.recv().await.unwrap().body, "for g");
    }

    #[tokio::test]
    async fn test_publish_order_is_preserved() {
        let bus = Bus::new(64);
        let mut rx = bus.subscribe("f").await;
        for i in 0..20 {
            bus.publish(msg("f", &i.to_string())).await;
        }
        for i in 0..20 {
            assert_eq!(&*rx.recv().await.unwrap().body, i.to_string());
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = Bus::new(16);
        assert_eq!(bus.publish(msg("nobody", "x")).await, 0);
        assert_eq!(bus.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_subscriber_count_and_prune() {
        let bus = Bus::new(16);
        let rx = bus.subscribe("f").await;
        assert_eq!(bus.subscriber_count("f").await, 1);
        assert!(!bus.prune("f").await);

        drop(rx);
        assert_eq!(bus.subscriber_count("f").await, 0);
        assert!(bus.prune("f").await);
        assert_eq!(bus.channel_count().await, 0);
        assert!(!bus.prune("f").await);
    }

    #[tokio::test]
    async fn test_stats() {
        let bus = Bus::new(16);
        let _rx1 = bus.subscribe("f").await;
        let _rx2 = bus.subscribe("f").await;
        bus.publish(msg("f", "a")).await;
        bus.publish(msg("g", "b")).await;
        bus.record_lag(3);

        let stats = bus.stats().await;
        assert_eq!(stats.published, 2);
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.lagged, 3);
        assert_eq!(stats.channels, 1);
        assert_eq!(bus.capacity(), 16);
    }
}
