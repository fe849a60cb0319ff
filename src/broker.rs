//! In-process topic broker coupling the public ingress to agent sessions.
//!
//! Two namespaces share the broker: subdomain topics carry serialized
//! requests toward the agent session that owns the subdomain, and request-id
//! topics carry the response bytes back to the ingress handler that is
//! waiting for them. Both namespaces get the same delivery policy: a
//! publisher blocks until every current subscriber has taken the message
//! off its bounded channel and acknowledged it. A topic with no subscribers
//! drops the message immediately, which is how late responses for
//! timed-out or cancelled requests disappear.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;
use tokio::sync::{mpsc, oneshot};

use crate::wire::Envelope;

/// Per-subscription channel depth before publishers start waiting.
const SUBSCRIPTION_BUFFER: usize = 64;

/// One message handed to a subscriber.
///
/// The publisher stays blocked until the delivery is either acknowledged or
/// dropped; dropping it unacknowledged counts as abandonment and releases
/// the publisher all the same.
pub struct Delivery {
    envelope: Envelope,
    ack: Option<oneshot::Sender<()>>,
}

impl Delivery {
    /// Acknowledges the delivery and hands over the envelope.
    pub fn ack(mut self) -> Envelope {
        if let Some(tx) = self.ack.take() {
            let _ = tx.send(());
        }
        self.envelope
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }
}

struct TopicSender {
    id: u64,
    tx: mpsc::Sender<Delivery>,
}

/// Process-local publish/subscribe hub.
#[derive(Default)]
pub struct Broker {
    topics: Mutex<HashMap<String, Vec<TopicSender>>>,
    next_id: AtomicU64,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber for `topic`.
    ///
    /// The subscription lasts until the returned handle is dropped.
    pub fn subscribe(self: &Arc<Self>, topic: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.topics
            .lock()
            .expect("broker lock poisoned")
            .entry(topic.to_string())
            .or_default()
            .push(TopicSender { id, tx });
        Subscription {
            topic: topic.to_string(),
            id,
            rx,
            broker: Arc::clone(self),
        }
    }

    /// Delivers `envelope` to every current subscriber of `topic`.
    ///
    /// Returns once each subscriber has acknowledged (or abandoned) its
    /// delivery. With no subscribers the message is dropped immediately.
    pub async fn publish(&self, topic: &str, envelope: Envelope) {
        let senders: Vec<mpsc::Sender<Delivery>> = {
            let topics = self.topics.lock().expect("broker lock poisoned");
            topics
                .get(topic)
                .map(|subs| subs.iter().map(|s| s.tx.clone()).collect())
                .unwrap_or_default()
        };

        if senders.is_empty() {
            debug!("no subscribers for topic {topic}, dropping message {}", envelope.id);
            return;
        }

        for tx in senders {
            let (ack_tx, ack_rx) = oneshot::channel();
            let delivery = Delivery {
                envelope: envelope.clone(),
                ack: Some(ack_tx),
            };
            if tx.send(delivery).await.is_err() {
                // Subscriber unsubscribed while we held its channel.
                continue;
            }
            let _ = ack_rx.await;
        }
    }

    /// Number of live subscriptions for `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .expect("broker lock poisoned")
            .get(topic)
            .map_or(0, Vec::len)
    }

    fn unsubscribe(&self, topic: &str, id: u64) {
        let mut topics = self.topics.lock().expect("broker lock poisoned");
        if let Some(subs) = topics.get_mut(topic) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                topics.remove(topic);
            }
        }
    }
}

/// Receiving end of one topic subscription.
///
/// Dropping the subscription removes it from the broker and releases every
/// resource tied to it.
pub struct Subscription {
    topic: String,
    id: u64,
    rx: mpsc::Receiver<Delivery>,
    broker: Arc<Broker>,
}

impl Subscription {
    /// Waits for the next delivery on this topic.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broker.unsubscribe(&self.topic, self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn envelope(id: &str) -> Envelope {
        Envelope::new(id, b"payload".to_vec())
    }

    #[tokio::test]
    async fn test_publish_delivers_to_subscriber() {
        let broker = Arc::new(Broker::new());
        let mut sub = broker.subscribe("alice");

        let publisher = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.publish("alice", envelope("req/1")).await })
        };

        let delivery = sub.recv().await.unwrap();
        assert_eq!(delivery.envelope().id, "req/1");
        delivery.ack();
        publisher.await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_blocks_until_ack() {
        let broker = Arc::new(Broker::new());
        let mut sub = broker.subscribe("alice");

        let publisher = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.publish("alice", envelope("req/1")).await })
        };

        let delivery = sub.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!publisher.is_finished());

        delivery.ack();
        tokio::time::timeout(Duration::from_secs(1), publisher)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_delivery_releases_publisher() {
        let broker = Arc::new(Broker::new());
        let mut sub = broker.subscribe("alice");

        let publisher = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.publish("alice", envelope("req/1")).await })
        };

        let delivery = sub.recv().await.unwrap();
        drop(delivery);
        tokio::time::timeout(Duration::from_secs(1), publisher)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_dropped() {
        let broker = Broker::new();
        // Must return immediately instead of waiting for a subscriber.
        tokio::time::timeout(
            Duration::from_millis(100),
            broker.publish("nobody", envelope("req/1")),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_per_topic_fifo_order() {
        let broker = Arc::new(Broker::new());
        let mut sub = broker.subscribe("alice");

        let publisher = {
            let broker = broker.clone();
            tokio::spawn(async move {
                for n in 0..5 {
                    broker.publish("alice", envelope(&format!("req/{n}"))).await;
                }
            })
        };

        for n in 0..5 {
            let delivery = sub.recv().await.unwrap();
            assert_eq!(delivery.ack().id, format!("req/{n}"));
        }
        publisher.await.unwrap();
    }

    #[tokio::test]
    async fn test_every_subscriber_receives() {
        let broker = Arc::new(Broker::new());
        let mut first = broker.subscribe("alice");
        let mut second = broker.subscribe("alice");

        let publisher = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.publish("alice", envelope("req/1")).await })
        };

        assert_eq!(first.recv().await.unwrap().ack().id, "req/1");
        assert_eq!(second.recv().await.unwrap().ack().id, "req/1");
        publisher.await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let broker = Arc::new(Broker::new());
        let sub = broker.subscribe("alice");
        assert_eq!(broker.subscriber_count("alice"), 1);

        drop(sub);
        assert_eq!(broker.subscriber_count("alice"), 0);
    }
}
