use super::*;
use crate::error_policy::ErrorPolicy;
use crate::messages::headers::names;
use crate::test_utils::{json_serializer, OrderCreated};
use tokio::sync::Barrier;

fn broker_with(transport: Arc<InMemoryTransport>) -> Arc<Broker> {
    Broker::builder(transport, Arc::new(json_serializer()))
        .publisher(Publisher::builder().build())
        .connect_retries(1)
        .build()
}

fn broker() -> Arc<Broker> {
    broker_with(Arc::new(InMemoryTransport::new()))
}

#[test]
fn test_equal_endpoints_share_a_producer() {
    let broker = broker();

    let a = broker.get_producer(&Endpoint::new("orders"));
    let b = broker.get_producer(&Endpoint::new("orders"));
    let c = broker.get_producer(&Endpoint::new("orders").with_chunk_size(16));

    assert!(Arc::ptr_eq(&a, &b));
    assert!(!Arc::ptr_eq(&a, &c));
    assert_eq!(broker.producer_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_get_producer_creates_one_instance() {
    let broker = broker();
    let barrier = Arc::new(Barrier::new(16));

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let broker = broker.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                broker.get_producer(&Endpoint::new("orders"))
            })
        })
        .collect();

    let producers: Vec<Arc<Producer>> = futures::future::try_join_all(tasks).await.unwrap();

    assert!(producers.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    assert_eq!(broker.producer_count(), 1);
}

#[tokio::test]
async fn test_consumers_are_cached_per_endpoint() {
    let broker = broker();

    let a = broker.get_consumer(&Endpoint::new("orders")).unwrap();
    let b = broker.get_consumer(&Endpoint::new("orders")).unwrap();

    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(broker.consumers().len(), 1);
}

#[tokio::test]
async fn test_new_consumer_rejected_while_connected() {
    let broker = broker();
    let existing = broker.get_consumer(&Endpoint::new("orders")).unwrap();
    broker.connect().await.unwrap();

    let again = broker.get_consumer(&Endpoint::new("orders")).unwrap();
    let result = broker.get_consumer(&Endpoint::new("payments"));

    assert!(Arc::ptr_eq(&existing, &again));
    assert!(matches!(result, Err(BrokerError::AlreadyConnected(name)) if name == "payments"));
    broker.disconnect().await;
}

#[test]
fn test_consumer_needs_a_publisher() {
    let broker = Broker::builder(Arc::new(InMemoryTransport::new()), Arc::new(json_serializer())).build();

    let result = broker.get_consumer(&Endpoint::new("orders"));

    assert!(matches!(result, Err(BrokerError::PublisherNotBound)));
}

#[test]
fn test_publisher_binds_once() {
    let broker = Broker::builder(Arc::new(InMemoryTransport::new()), Arc::new(json_serializer())).build();

    assert!(broker.bind_publisher(Publisher::builder().build()).is_ok());
    assert!(matches!(
        broker.bind_publisher(Publisher::builder().build()),
        Err(BrokerError::PublisherAlreadyBound)
    ));
}

#[test]
fn test_invalid_error_policy_is_rejected() {
    let broker = broker();
    let settings = ConsumerSettings::default().with_error_policy(ErrorPolicy::retry(0));

    let result = broker.get_consumer_with(&Endpoint::new("orders"), settings);

    assert!(matches!(result, Err(BrokerError::Policy(_))));
}

#[tokio::test]
async fn test_connect_and_disconnect_are_idempotent() {
    let broker = broker();
    let consumer = broker.get_consumer(&Endpoint::new("orders")).unwrap();
    assert_eq!(consumer.status(), ConsumerStatus::Idle);

    broker.connect().await.unwrap();
    broker.connect().await.unwrap();
    assert!(broker.is_connected());
    assert_eq!(consumer.status(), ConsumerStatus::Running);

    broker.disconnect().await;
    broker.disconnect().await;
    assert!(!broker.is_connected());
    assert_eq!(consumer.status(), ConsumerStatus::Stopped);
}

#[tokio::test]
async fn test_transient_subscribe_failures_are_retried() {
    let transport = Arc::new(InMemoryTransport::new());
    let broker = broker_with(transport.clone());
    broker.get_consumer(&Endpoint::new("orders")).unwrap();
    transport.fail_next_subscriptions(1);

    broker.connect().await.unwrap();

    assert!(broker.is_connected());
    broker.disconnect().await;
}

/// Refuses subscriptions to one endpoint.
struct RefusingAdapter {
    inner: InMemoryTransport,
    refused: &'static str,
}

#[async_trait]
impl BrokerAdapter for RefusingAdapter {
    async fn produce(
        &self,
        endpoint: &Endpoint,
        payload: Bytes,
        headers: &MessageHeaders,
    ) -> std::result::Result<(), TransportError> {
        self.inner.produce(endpoint, payload, headers).await
    }

    async fn subscribe(
        &self,
        endpoint: &Endpoint,
    ) -> std::result::Result<RawMessageStream, TransportError> {
        if endpoint.name == self.refused {
            return Err(TransportError::Connection("refused".to_string()));
        }
        self.inner.subscribe(endpoint).await
    }

    async fn acknowledge(
        &self,
        endpoint: &Endpoint,
        offsets: &[String],
    ) -> std::result::Result<(), TransportError> {
        self.inner.acknowledge(endpoint, offsets).await
    }
}

#[tokio::test]
async fn test_failed_connect_stops_started_consumers() {
    let adapter = Arc::new(RefusingAdapter {
        inner: InMemoryTransport::new(),
        refused: "b",
    });
    let broker = Broker::builder(adapter, Arc::new(json_serializer()))
        .publisher(Publisher::builder().build())
        .connect_retries(1)
        .build();
    let healthy = broker.get_consumer(&Endpoint::new("a")).unwrap();
    broker.get_consumer(&Endpoint::new("b")).unwrap();

    let result = broker.connect().await;

    assert!(matches!(
        result,
        Err(BrokerError::Transport(TransportError::Connection(_)))
    ));
    assert!(!broker.is_connected());
    assert_ne!(healthy.status(), ConsumerStatus::Running);
}

#[tokio::test]
async fn test_large_payload_is_produced_in_chunks() {
    let transport = Arc::new(InMemoryTransport::new());
    let broker = broker_with(transport.clone());
    let producer = broker.get_producer(&Endpoint::new("orders").with_chunk_size(4));

    let message_id = producer.produce(&OrderCreated { id: 123456 }).await.unwrap();

    let produced = transport.produced("orders").await;
    assert!(produced.len() > 1);
    for (index, message) in produced.iter().enumerate() {
        assert_eq!(message.headers.get(names::MESSAGE_ID), Some(message_id.as_str()));
        assert_eq!(message.headers.get(names::MESSAGE_TYPE), Some("OrderCreated"));
        assert_eq!(
            message.headers.get_as::<usize>(names::CHUNK_INDEX).unwrap(),
            Some(index)
        );
        assert_eq!(
            message.headers.get_as::<usize>(names::CHUNKS_COUNT).unwrap(),
            Some(produced.len())
        );
        assert!(message.payload.len() <= 4);
    }
}

#[tokio::test]
async fn test_small_payload_is_not_chunked() {
    let transport = Arc::new(InMemoryTransport::new());
    let broker = broker_with(transport.clone());
    let producer = broker.get_producer(&Endpoint::new("orders").with_chunk_size(1024));

    producer.produce(&OrderCreated { id: 1 }).await.unwrap();

    let produced = transport.produced("orders").await;
    assert_eq!(produced.len(), 1);
    assert!(!produced[0].headers.contains(names::CHUNK_INDEX));
}

#[tokio::test]
async fn test_existing_message_id_is_kept() {
    let transport = Arc::new(InMemoryTransport::new());
    let broker = broker_with(transport.clone());
    let producer = broker.get_producer(&Endpoint::new("orders"));

    let message_id = producer
        .produce_with_headers(
            &OrderCreated { id: 1 },
            MessageHeaders::new().with(names::MESSAGE_ID, "fixed-id"),
        )
        .await
        .unwrap();

    assert_eq!(message_id, "fixed-id");
}

#[tokio::test]
async fn test_produce_failure_is_reported() {
    let transport = Arc::new(InMemoryTransport::new());
    let broker = broker_with(transport.clone());
    transport.set_fail_on_produce(true);

    let result = broker
        .get_producer(&Endpoint::new("orders"))
        .produce(&OrderCreated { id: 1 })
        .await;

    assert!(matches!(
        result,
        Err(ProduceError::Transport(TransportError::Produce(_)))
    ));
}
