//! Shared utilities for integration tests.
//!
//! Sample messages, a recording subscriber and a broker wired to the
//! in-memory transport.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use courier::broker::{Broker, BrokerBuilder, InMemoryTransport};
use courier::messages::MessageKind;
use courier::serialization::{JsonSerializer, MessageTypeRegistry};
use courier::subscribers::{HandlerError, ReturnValue, SubscribedMethod};
use courier::{Message, MessageType, Publisher};

/// How long a scenario waits for the consumer before giving up.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub id: u32,
    pub note: String,
}

impl OrderPlaced {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            note: format!("order {id}"),
        }
    }
}

impl Message for OrderPlaced {
    fn kinds(&self) -> &'static [MessageKind] {
        &[MessageKind::Event]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentReceived {
    pub order: u32,
}

impl Message for PaymentReceived {
    fn kinds(&self) -> &'static [MessageKind] {
        &[MessageKind::Event]
    }
}

pub fn serializer() -> Arc<JsonSerializer> {
    let mut registry = MessageTypeRegistry::new();
    registry.register::<OrderPlaced>("OrderPlaced");
    registry.register::<PaymentReceived>("PaymentReceived");
    Arc::new(JsonSerializer::new(registry))
}

/// Subscriber recording every `OrderPlaced` it receives.
///
/// The first `failures` calls fail after recording the message.
#[derive(Clone, Default)]
pub struct Recorder {
    received: Arc<Mutex<Vec<OrderPlaced>>>,
    calls: Arc<AtomicU32>,
    failures: Arc<AtomicU32>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(failures: u32) -> Self {
        let recorder = Self::default();
        recorder.failures.store(failures, Ordering::SeqCst);
        recorder
    }

    /// Handler invocations, failed ones included.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn received(&self) -> Vec<OrderPlaced> {
        self.received.lock().await.clone()
    }

    pub fn subscriber(&self) -> SubscribedMethod {
        let recorder = self.clone();
        SubscribedMethod::builder("record_order")
            .message::<OrderPlaced>()
            .handle(move |ctx| {
                let recorder = recorder.clone();
                async move {
                    recorder.calls.fetch_add(1, Ordering::SeqCst);
                    if let Some(order) = ctx.message_as::<OrderPlaced>() {
                        recorder.received.lock().await.push(order.clone());
                    }
                    recorder.maybe_fail()?;
                    Ok::<_, HandlerError>(ReturnValue::None)
                }
            })
    }

    /// Same recording, but one call per batch.
    pub fn batch_subscriber(&self) -> SubscribedMethod {
        let recorder = self.clone();
        SubscribedMethod::builder("record_orders")
            .batch(MessageType::of::<OrderPlaced>())
            .handle(move |ctx| {
                let recorder = recorder.clone();
                async move {
                    recorder.calls.fetch_add(1, Ordering::SeqCst);
                    let orders: Vec<OrderPlaced> =
                        ctx.messages_as::<OrderPlaced>().into_iter().cloned().collect();
                    recorder.received.lock().await.extend(orders);
                    recorder.maybe_fail()?;
                    Ok::<_, HandlerError>(ReturnValue::None)
                }
            })
    }

    fn maybe_fail(&self) -> Result<(), HandlerError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err("subscriber failed on purpose".into());
        }
        Ok(())
    }
}

/// Broker over `transport` with `publisher` bound and a single connect attempt.
pub fn broker_builder(transport: Arc<InMemoryTransport>, publisher: Publisher) -> BrokerBuilder {
    Broker::builder(transport, serializer())
        .publisher(publisher)
        .connect_retries(1)
}

pub fn publisher_with(subscriber: SubscribedMethod) -> Publisher {
    Publisher::builder().subscribe(subscriber).build()
}

/// Polls `condition` until it holds or [`WAIT_TIMEOUT`] passes.
pub async fn wait_until<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
