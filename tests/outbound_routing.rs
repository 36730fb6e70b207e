//! Outbound routing tests: publisher to transport and back through a consumer.
//!
//! Run with: cargo test --test outbound_routing

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use courier::broker::{
    Broker, ConsumerSettings, ConsumerStatus, InMemoryTransport, OutboundRouter,
};
use courier::error_policy::ErrorPolicy;
use courier::messages::headers::names;
use courier::messages::{Endpoint, MessageHeaders, OutboundEnvelope};
use courier::subscribers::{HandlerError, ReturnValue, SubscribedMethod};
use courier::{MessageType, PublishError, Publisher};

use common::*;

fn orders() -> Endpoint {
    Endpoint::new("orders")
}

/// Broker whose publisher routes `OrderPlaced` through `route`.
fn routed(
    transport: Arc<InMemoryTransport>,
    recorder: &Recorder,
    route: impl FnOnce(OutboundRouter) -> OutboundRouter,
) -> (Arc<Broker>, Publisher) {
    let broker = Broker::builder(transport, serializer())
        .connect_retries(1)
        .build();
    let publisher = Publisher::builder()
        .behavior(route(OutboundRouter::new(&broker)))
        .subscribe(recorder.subscriber())
        .build();
    broker.bind_publisher(publisher.clone()).unwrap();
    (broker, publisher)
}

#[tokio::test]
async fn test_routed_message_comes_back_through_the_consumer() {
    let transport = Arc::new(InMemoryTransport::new());
    let recorder = Recorder::new();
    let (broker, publisher) = routed(transport.clone(), &recorder, |router| {
        router.route(MessageType::of::<OrderPlaced>(), orders())
    });
    broker.get_consumer(&orders()).unwrap();
    broker.connect().await.unwrap();

    publisher.publish(OrderPlaced::new(1)).await.unwrap();

    assert!(wait_until(|| async { recorder.calls() == 1 }).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.calls(), 1);
    assert_eq!(recorder.received().await, vec![OrderPlaced::new(1)]);
    assert_eq!(transport.produced("orders").await.len(), 1);
    broker.disconnect().await;
}

#[tokio::test]
async fn test_route_and_publish_also_dispatches_locally() {
    let transport = Arc::new(InMemoryTransport::new());
    let recorder = Recorder::new();
    let (_broker, publisher) = routed(transport.clone(), &recorder, |router| {
        router.route_and_publish(MessageType::of::<OrderPlaced>(), orders())
    });

    publisher.publish(OrderPlaced::new(1)).await.unwrap();

    assert_eq!(recorder.calls(), 1);
    assert_eq!(transport.produced("orders").await.len(), 1);
}

#[tokio::test]
async fn test_unrouted_message_stays_local() {
    let transport = Arc::new(InMemoryTransport::new());
    let recorder = Recorder::new();
    let (_broker, publisher) = routed(transport.clone(), &recorder, |router| {
        router.route(MessageType::of::<PaymentReceived>(), Endpoint::new("payments"))
    });

    publisher.publish(OrderPlaced::new(1)).await.unwrap();

    assert_eq!(recorder.calls(), 1);
    assert!(transport.produced("payments").await.is_empty());
}

#[tokio::test]
async fn test_outbound_envelope_goes_to_its_own_endpoint() {
    let transport = Arc::new(InMemoryTransport::new());
    let recorder = Recorder::new();
    let (_broker, publisher) = routed(transport.clone(), &recorder, |router| router);
    let envelope = OutboundEnvelope::new(Arc::new(OrderPlaced::new(3)), Endpoint::new("audit"))
        .with_headers(MessageHeaders::new().with("x-tenant", "acme"));

    publisher.publish(envelope).await.unwrap();

    assert_eq!(recorder.calls(), 0);
    let produced = transport.produced("audit").await;
    assert_eq!(produced.len(), 1);
    assert_eq!(produced[0].headers.get("x-tenant"), Some("acme"));
    assert_eq!(produced[0].headers.get(names::MESSAGE_TYPE), Some("OrderPlaced"));
}

#[tokio::test]
async fn test_produce_failure_fails_the_publish() {
    let transport = Arc::new(InMemoryTransport::new());
    let recorder = Recorder::new();
    let (_broker, publisher) = routed(transport.clone(), &recorder, |router| {
        router.route(MessageType::of::<OrderPlaced>(), orders())
    });
    transport.set_fail_on_produce(true);

    let result = publisher.publish(OrderPlaced::new(1)).await;

    assert!(matches!(result, Err(PublishError::Produce { endpoint, .. }) if endpoint == "orders"));
    assert_eq!(recorder.calls(), 0);
}

/// Broker consuming "orders" with a handler that publishes `PaymentReceived`
/// (routed to "payments") and then fails its first `failures` calls.
fn charging(
    transport: Arc<InMemoryTransport>,
    failures: u32,
    settings: ConsumerSettings,
) -> (Arc<Broker>, Arc<AtomicU32>) {
    let slot: Arc<OnceLock<Publisher>> = Arc::default();
    let attempts = Arc::new(AtomicU32::new(0));
    let charge = {
        let slot = slot.clone();
        let attempts = attempts.clone();
        SubscribedMethod::builder("charge_order")
            .message::<OrderPlaced>()
            .handle(move |ctx| {
                let slot = slot.clone();
                let attempts = attempts.clone();
                async move {
                    let order = ctx.message_as::<OrderPlaced>().map_or(0, |o| o.id);
                    if let Some(publisher) = slot.get() {
                        publisher.publish(PaymentReceived { order }).await?;
                    }
                    if attempts.fetch_add(1, Ordering::SeqCst) < failures {
                        return Err::<ReturnValue, HandlerError>("payment gateway unavailable".into());
                    }
                    Ok(ReturnValue::None)
                }
            })
    };

    let broker = Broker::builder(transport, serializer())
        .connect_retries(1)
        .build();
    let publisher = Publisher::builder()
        .behavior(
            OutboundRouter::new(&broker)
                .route(MessageType::of::<PaymentReceived>(), Endpoint::new("payments")),
        )
        .subscribe(charge)
        .build();
    broker.bind_publisher(publisher.clone()).unwrap();
    assert!(slot.set(publisher).is_ok());
    broker.get_consumer_with(&orders(), settings).unwrap();
    (broker, attempts)
}

#[tokio::test]
async fn test_retried_batch_produces_derived_messages_once() {
    let transport = Arc::new(InMemoryTransport::new());
    let (broker, attempts) = charging(
        transport.clone(),
        2,
        ConsumerSettings::default().with_error_policy(ErrorPolicy::retry(3)),
    );
    broker
        .get_producer(&orders())
        .produce(&OrderPlaced::new(8))
        .await
        .unwrap();

    broker.connect().await.unwrap();

    assert!(wait_until(|| async { transport.acknowledged("orders").await.len() == 1 }).await);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let payments = transport.produced("payments").await;
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].headers.get(names::MESSAGE_TYPE), Some("PaymentReceived"));
    broker.disconnect().await;
}

#[tokio::test]
async fn test_failed_batch_produces_nothing() {
    let transport = Arc::new(InMemoryTransport::new());
    let (broker, attempts) = charging(transport.clone(), 1, ConsumerSettings::default());
    let consumer = broker.get_consumer(&orders()).unwrap();
    let mut status = consumer.watch_status();
    broker
        .get_producer(&orders())
        .produce(&OrderPlaced::new(8))
        .await
        .unwrap();

    broker.connect().await.unwrap();

    let failed = tokio::time::timeout(
        WAIT_TIMEOUT,
        status.wait_for(|s| matches!(s, ConsumerStatus::Failed(_))),
    )
    .await
    .is_ok_and(|changed| changed.is_ok());
    assert!(failed);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert!(transport.produced("payments").await.is_empty());
    broker.disconnect().await;
}
