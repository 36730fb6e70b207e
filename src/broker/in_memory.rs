//! In-memory transport.
//!
//! Each endpoint name is a topic holding every produced message. New
//! subscriptions first replay the messages not yet acknowledged, then
//! follow live traffic through a broadcast channel. A subscriber that
//! falls behind the channel catches up from the topic log. Useful for
//! tests and single-process applications.

use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use super::{BrokerAdapter, RawMessage, RawMessageStream, TransportError};
use crate::messages::{Endpoint, MessageHeaders};

/// Channel capacity for live delivery.
const CHANNEL_CAPACITY: usize = 1024;

type Topics = Arc<RwLock<HashMap<String, Topic>>>;

struct Topic {
    sender: broadcast::Sender<RawMessage>,
    log: Vec<RawMessage>,
    acknowledged: HashSet<String>,
}

impl Topic {
    fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            log: Vec::new(),
            acknowledged: HashSet::new(),
        }
    }

    fn is_acknowledged(&self, message: &RawMessage) -> bool {
        message
            .offset
            .as_ref()
            .is_some_and(|offset| self.acknowledged.contains(offset))
    }
}

/// What the live part of a subscription yields.
enum Delivery {
    Message(RawMessage),
    /// Log positions the broadcast channel dropped.
    Missed(Range<usize>),
}

/// Transport keeping topics in process memory.
pub struct InMemoryTransport {
    topics: Topics,
    channel_capacity: usize,
    failing_subscriptions: AtomicUsize,
    fail_on_produce: AtomicBool,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::with_channel_capacity(CHANNEL_CAPACITY)
    }

    /// Transport whose live channels hold at most `capacity` undelivered messages.
    pub fn with_channel_capacity(capacity: usize) -> Self {
        Self {
            topics: Arc::default(),
            channel_capacity: capacity.max(1),
            failing_subscriptions: AtomicUsize::new(0),
            fail_on_produce: AtomicBool::new(false),
        }
    }

    /// Every message produced to `topic`, in order.
    pub async fn produced(&self, topic: &str) -> Vec<RawMessage> {
        self.topics
            .read()
            .await
            .get(topic)
            .map(|t| t.log.clone())
            .unwrap_or_default()
    }

    /// Acknowledged offsets of `topic`, in log order.
    pub async fn acknowledged(&self, topic: &str) -> Vec<String> {
        let topics = self.topics.read().await;
        let Some(topic) = topics.get(topic) else {
            return Vec::new();
        };
        topic
            .log
            .iter()
            .filter(|m| topic.is_acknowledged(m))
            .filter_map(|m| m.offset.clone())
            .collect()
    }

    fn topic<'a>(&self, topics: &'a mut HashMap<String, Topic>, name: &str) -> &'a mut Topic {
        topics
            .entry(name.to_string())
            .or_insert_with(|| Topic::with_capacity(self.channel_capacity))
    }

    /// Makes the next `count` subscriptions fail with a connection error.
    pub fn fail_next_subscriptions(&self, count: usize) {
        self.failing_subscriptions.store(count, Ordering::SeqCst);
    }

    pub fn set_fail_on_produce(&self, fail: bool) {
        self.fail_on_produce.store(fail, Ordering::SeqCst);
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerAdapter for InMemoryTransport {
    async fn produce(
        &self,
        endpoint: &Endpoint,
        payload: Bytes,
        headers: &MessageHeaders,
    ) -> Result<(), TransportError> {
        if self.fail_on_produce.load(Ordering::SeqCst) {
            return Err(TransportError::Produce(format!(
                "simulated produce failure on '{}'",
                endpoint.name
            )));
        }

        let mut topics = self.topics.write().await;
        let topic = self.topic(&mut topics, &endpoint.name);
        let message = RawMessage {
            payload,
            headers: headers.clone(),
            offset: Some(topic.log.len().to_string()),
        };
        topic.log.push(message.clone());
        // No live subscribers is fine: the log replays on subscribe.
        let _ = topic.sender.send(message);
        debug!(topic = %endpoint.name, offset = topic.log.len() - 1, "Message stored");
        Ok(())
    }

    async fn subscribe(&self, endpoint: &Endpoint) -> Result<RawMessageStream, TransportError> {
        let remaining = self.failing_subscriptions.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_subscriptions.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::Connection(format!(
                "simulated connection failure on '{}'",
                endpoint.name
            )));
        }

        // Snapshot and receiver are taken under one lock so nothing is missed or doubled.
        let mut topics = self.topics.write().await;
        let topic = self.topic(&mut topics, &endpoint.name);
        let receiver = topic.sender.subscribe();
        let mut position = topic.log.len();
        let backlog: Vec<RawMessage> = topic
            .log
            .iter()
            .filter(|m| !topic.is_acknowledged(m))
            .cloned()
            .collect();
        drop(topics);

        // The channel carries the log in order, so `position` is the log
        // index of the next live message.
        let log = self.topics.clone();
        let topic_name = endpoint.name.clone();
        let live = BroadcastStream::new(receiver)
            .map(move |received| match received {
                Ok(message) => {
                    position += 1;
                    Delivery::Message(message)
                }
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    let missed = position..position + skipped as usize;
                    position = missed.end;
                    Delivery::Missed(missed)
                }
            })
            .then(move |delivery| {
                let log = log.clone();
                let topic_name = topic_name.clone();
                async move {
                    match delivery {
                        Delivery::Message(message) => vec![message],
                        Delivery::Missed(missed) => {
                            warn!(topic = %topic_name, missed = missed.len(), "Subscriber lagged behind, replaying from the log");
                            let topics = log.read().await;
                            let replayed = topics
                                .get(&topic_name)
                                .and_then(|t| t.log.get(missed))
                                .map(<[RawMessage]>::to_vec)
                                .unwrap_or_default();
                            replayed
                        }
                    }
                }
            })
            .flat_map(|messages| stream::iter(messages.into_iter().map(Ok)));

        Ok(stream::iter(backlog.into_iter().map(Ok)).chain(live).boxed())
    }

    async fn acknowledge(&self, endpoint: &Endpoint, offsets: &[String]) -> Result<(), TransportError> {
        let mut topics = self.topics.write().await;
        let topic = topics
            .get_mut(&endpoint.name)
            .ok_or_else(|| TransportError::Acknowledge(format!("unknown topic '{}'", endpoint.name)))?;
        topic.acknowledged.extend(offsets.iter().cloned());
        Ok(())
    }
}
