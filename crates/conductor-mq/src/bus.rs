//! In-process publish/subscribe.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::trace;

use crate::{MqResult, Topic, TopicPattern};

/// One published event.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: Topic,
    pub body: Value,
}

/// Anything events can be published to.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Deliver `body` to every subscriber whose pattern matches `topic`.
    async fn publish(&self, topic: Topic, body: Value) -> MqResult<()>;
}

struct Subscriber {
    pattern: TopicPattern,
    tx: mpsc::UnboundedSender<Message>,
}

/// Fans published messages out to in-process subscribers.
///
/// Queues are unbounded, so a message is enqueued for every matching
/// subscriber before `publish` returns. Subscribers whose [`Subscription`] was
/// dropped are removed on the next publish.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn subscribers(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self, pattern: TopicPattern) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers().push(Subscriber {
            pattern: pattern.clone(),
            tx,
        });
        Subscription { pattern, rx }
    }

    /// Parse `pattern` and subscribe to it.
    pub fn subscribe_to(&self, pattern: &str) -> MqResult<Subscription> {
        Ok(self.subscribe(pattern.parse()?))
    }
}

#[async_trait]
impl Publisher for EventBus {
    async fn publish(&self, topic: Topic, body: Value) -> MqResult<()> {
        let mut subscribers = self.subscribers();
        let mut delivered = 0;
        subscribers.retain(|subscriber| {
            if !subscriber.pattern.matches(&topic) {
                return !subscriber.tx.is_closed();
            }
            let message = Message {
                topic: topic.clone(),
                body: body.clone(),
            };
            match subscriber.tx.send(message) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });
        trace!(topic = %topic, delivered, "Published event");
        Ok(())
    }
}

/// The receiving end of a subscription.
pub struct Subscription {
    pattern: TopicPattern,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Subscription {
    pub fn pattern(&self) -> &TopicPattern {
        &self.pattern
    }

    /// Wait for the next message. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// The next queued message, if any.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    /// Every queued message, oldest first.
    pub fn drain(&mut self) -> Vec<Message> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topic;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_reaches_matching_subscribers() {
        let bus = EventBus::new();
        let mut claimed = bus.subscribe_to("buildrequests.*.claimed").unwrap();
        let mut everything = bus.subscribe_to("buildrequests.*.*").unwrap();
        let mut steps = bus.subscribe_to("steps.*.*").unwrap();

        bus.publish(topic!("buildrequests", 44, "claimed"), json!({"buildrequestid": 44}))
            .await
            .unwrap();
        bus.publish(topic!("buildrequests", 44, "unclaimed"), json!({"buildrequestid": 44}))
            .await
            .unwrap();

        let got = claimed.drain();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].topic.to_string(), "buildrequests.44.claimed");
        assert_eq!(got[0].body["buildrequestid"], 44);

        let events: Vec<String> = everything
            .drain()
            .into_iter()
            .map(|m| m.topic.to_string())
            .collect();
        assert_eq!(
            events,
            vec!["buildrequests.44.claimed", "buildrequests.44.unclaimed"]
        );
        assert!(steps.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let mut kept = bus.subscribe_to("steps.*.new").unwrap();
        let dropped = bus.subscribe_to("steps.*.new").unwrap();
        let unrelated = bus.subscribe_to("builds.*.*").unwrap();
        assert_eq!(bus.subscribers().len(), 3);

        drop(dropped);
        drop(unrelated);
        bus.publish(topic!("steps", 1, "new"), json!({})).await.unwrap();
        assert_eq!(bus.subscribers().len(), 1);
        assert_eq!(kept.drain().len(), 1);
    }

    #[tokio::test]
    async fn test_recv_waits_for_message() {
        let bus = std::sync::Arc::new(EventBus::new());
        let mut sub = bus.subscribe_to("builds.*.finished").unwrap();

        let publisher = bus.clone();
        tokio::spawn(async move {
            publisher
                .publish(topic!("builds", 9, "finished"), json!({"buildid": 9}))
                .await
                .unwrap();
        });

        let message = sub.recv().await.unwrap();
        assert_eq!(message.body["buildid"], 9);
        assert_eq!(sub.pattern().to_string(), "builds.*.finished");
    }
}
