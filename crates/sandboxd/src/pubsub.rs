//! Topic-keyed broadcast hub for progress and output events.
//!
//! Delivery is at-most-once and non-durable: events published while nobody is
//! subscribed are dropped, and a slow subscriber skips what it lagged behind on.

use dashmap::DashMap;
use futures::{Stream, StreamExt};
use log::debug;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Size of each topic's broadcast channel.
pub const EVENT_BUFFER_SIZE: usize = 256;

pub struct Hub<E> {
    /// Topic -> channel
    topics: DashMap<String, broadcast::Sender<E>>,
}

impl<E: Clone + Send + 'static> Hub<E> {
    pub fn new() -> Self {
        Self {
            topics: DashMap::new(),
        }
    }

    /// Publish an event. Returns how many subscribers received it.
    pub fn publish(&self, topic: &str, event: E) -> usize {
        let delivered = match self.topics.get(topic) {
            Some(tx) => tx.send(event).unwrap_or(0),
            None => 0,
        };
        if delivered == 0 {
            // Clean up topics whose subscribers are all gone
            self.topics.remove_if(topic, |_, tx| tx.receiver_count() == 0);
        }
        delivered
    }

    /// Subscribe to a topic. The stream ends when dropped.
    pub fn subscribe(&self, topic: &str) -> impl Stream<Item = E> + Send + 'static + use<E> {
        let rx = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(EVENT_BUFFER_SIZE).0)
            .subscribe();
        let topic = topic.to_string();
        BroadcastStream::new(rx).filter_map(move |item| {
            let out = match item {
                Ok(event) => Some(event),
                Err(e) => {
                    debug!("Subscriber on {} lagged: {}", topic, e);
                    None
                }
            };
            futures::future::ready(out)
        })
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

impl<E: Clone + Send + 'static> Default for Hub<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Topic for a sandbox's events.
pub fn sandbox_topic(kind: &str, user_id: i64, agent_id: i64) -> String {
    format!("{kind}:{user_id}:{agent_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fans_out_to_every_subscriber_of_a_topic() {
        let hub: Hub<u32> = Hub::new();
        let mut a = Box::pin(hub.subscribe("skills:1:2"));
        let mut b = Box::pin(hub.subscribe("skills:1:2"));
        let mut other = Box::pin(hub.subscribe("skills:1:3"));

        assert_eq!(hub.publish("skills:1:2", 7), 2);
        assert_eq!(a.next().await, Some(7));
        assert_eq!(b.next().await, Some(7));

        hub.publish("skills:1:3", 9);
        assert_eq!(other.next().await, Some(9));
    }

    #[tokio::test]
    async fn events_without_subscribers_are_dropped() {
        let hub: Hub<u32> = Hub::new();
        assert_eq!(hub.publish("nobody", 1), 0);

        let stream = hub.subscribe("gone");
        assert_eq!(hub.subscriber_count("gone"), 1);
        drop(stream);
        assert_eq!(hub.publish("gone", 1), 0);
        assert_eq!(hub.subscriber_count("gone"), 0);
    }

    #[test]
    fn topic_format() {
        assert_eq!(sandbox_topic("output", 3, 4), "output:3:4");
    }
}
