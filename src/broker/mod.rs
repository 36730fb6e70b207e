//! Message broker abstraction.
//!
//! A [`Broker`] sits on top of a transport [`BrokerAdapter`] and caches one
//! [`Producer`] and one [`Consumer`] per endpoint. Consumers feed inbound
//! messages through the inbound pipeline into the bound [`Publisher`].
//!
//! Routed messages produced while a consumer dispatches are held in the
//! batch's [`Outbox`] until its transaction commits.
//!
//! Implementations:
//! - `InMemoryTransport`: in-process topics (feature `in-memory`)

mod consumer;
#[cfg(feature = "in-memory")]
mod in_memory;
mod outbound;
mod outbox;
mod producer;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::BoxStream;
use tokio::sync::Mutex;
use tracing::{error, info};

pub use consumer::{BatchSettings, Consumer, ConsumerSettings, ConsumerStatus};
#[cfg(feature = "in-memory")]
pub use in_memory::InMemoryTransport;
pub use outbound::{OutboundRoute, OutboundRouter};
pub use outbox::Outbox;
pub use producer::{ProduceError, Producer};

use crate::chunking::{ChunkStore, InMemoryChunkStore};
use crate::error_policy::PolicyError;
use crate::inbound::{InboundBehavior, InboundPipeline};
use crate::inbound_log::{InMemoryInboundLog, InboundLog};
use crate::messages::{Endpoint, MessageHeaders};
use crate::publishing::Publisher;
use crate::serialization::{PayloadCipher, Serializer};

use consumer::ConsumerContext;

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Default number of connection attempts before a consumer gives up.
pub const DEFAULT_CONNECT_RETRIES: usize = 10;

/// Transport-level failures.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Produce failed: {0}")]
    Produce(String),

    #[error("Consume failed: {0}")]
    Consume(String),

    #[error("Acknowledge failed: {0}")]
    Acknowledge(String),
}

impl TransportError {
    /// Connection failures are worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Connection(_))
    }
}

/// Errors that can occur during broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Broker is connected, cannot add a consumer for '{0}'")]
    AlreadyConnected(String),

    #[error("No publisher bound to the broker")]
    PublisherNotBound,

    #[error("A publisher is already bound to the broker")]
    PublisherAlreadyBound,

    #[error("Invalid error policy: {0}")]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A message as delivered by the transport.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub payload: Bytes,
    pub headers: MessageHeaders,
    /// Transport position used for acknowledgement.
    pub offset: Option<String>,
}

/// Stream of messages from one subscription.
pub type RawMessageStream = BoxStream<'static, std::result::Result<RawMessage, TransportError>>;

/// Transport underneath a broker.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    async fn produce(
        &self,
        endpoint: &Endpoint,
        payload: Bytes,
        headers: &MessageHeaders,
    ) -> std::result::Result<(), TransportError>;

    async fn subscribe(
        &self,
        endpoint: &Endpoint,
    ) -> std::result::Result<RawMessageStream, TransportError>;

    /// Marks messages as processed so they are not redelivered.
    async fn acknowledge(
        &self,
        endpoint: &Endpoint,
        offsets: &[String],
    ) -> std::result::Result<(), TransportError>;
}

// ============================================================================
// Producer cache
// ============================================================================

/// One producer per endpoint, created on first use.
pub(crate) struct Producers {
    adapter: Arc<dyn BrokerAdapter>,
    serializer: Arc<dyn Serializer>,
    cipher: Option<Arc<dyn PayloadCipher>>,
    cache: DashMap<Endpoint, Arc<Producer>>,
}

impl Producers {
    pub(crate) fn get(&self, endpoint: &Endpoint) -> Arc<Producer> {
        if let Some(producer) = self.cache.get(endpoint) {
            return producer.clone();
        }
        self.cache
            .entry(endpoint.clone())
            .or_insert_with(|| {
                info!(endpoint = %endpoint, "Creating producer");
                Arc::new(Producer::new(
                    endpoint.clone(),
                    self.adapter.clone(),
                    self.serializer.clone(),
                    self.cipher.clone(),
                ))
            })
            .clone()
    }

    fn len(&self) -> usize {
        self.cache.len()
    }
}

// ============================================================================
// Broker
// ============================================================================

/// Producer/consumer cache and connection lifecycle over a transport.
pub struct Broker {
    producers: Arc<Producers>,
    consumers: DashMap<Endpoint, Arc<Consumer>>,
    adapter: Arc<dyn BrokerAdapter>,
    pipeline: Arc<InboundPipeline>,
    inbound_log: Arc<dyn InboundLog>,
    chunk_store: Arc<dyn ChunkStore>,
    connect_retries: usize,
    publisher: OnceLock<Publisher>,
    connected: AtomicBool,
    lifecycle: Mutex<()>,
}

impl Broker {
    pub fn builder(adapter: Arc<dyn BrokerAdapter>, serializer: Arc<dyn Serializer>) -> BrokerBuilder {
        BrokerBuilder {
            adapter,
            serializer,
            cipher: None,
            inbound_log: None,
            chunk_store: None,
            inbound_behaviors: Vec::new(),
            publisher: None,
            connect_retries: DEFAULT_CONNECT_RETRIES,
        }
    }

    /// Binds the publisher consumers dispatch to.
    ///
    /// Separate from the builder so that publisher behaviors (such as
    /// [`OutboundRouter`]) can hold the broker.
    pub fn bind_publisher(&self, publisher: Publisher) -> Result<()> {
        self.publisher
            .set(publisher)
            .map_err(|_| BrokerError::PublisherAlreadyBound)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// The producer for `endpoint`. Repeated calls with an equal endpoint
    /// return the same instance.
    pub fn get_producer(&self, endpoint: &Endpoint) -> Arc<Producer> {
        self.producers.get(endpoint)
    }

    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    /// The consumer for `endpoint`, with default settings when created.
    pub fn get_consumer(&self, endpoint: &Endpoint) -> Result<Arc<Consumer>> {
        self.get_consumer_with(endpoint, ConsumerSettings::default())
    }

    /// The consumer for `endpoint`. `settings` apply only when the consumer
    /// is created by this call.
    ///
    /// New consumers cannot be added while the broker is connected.
    pub fn get_consumer_with(
        &self,
        endpoint: &Endpoint,
        settings: ConsumerSettings,
    ) -> Result<Arc<Consumer>> {
        if let Some(consumer) = self.consumers.get(endpoint) {
            return Ok(consumer.clone());
        }
        if self.is_connected() {
            return Err(BrokerError::AlreadyConnected(endpoint.name.clone()));
        }
        settings.validate()?;
        let publisher = self
            .publisher
            .get()
            .cloned()
            .ok_or(BrokerError::PublisherNotBound)?;

        let consumer = self
            .consumers
            .entry(endpoint.clone())
            .or_insert_with(|| {
                info!(endpoint = %endpoint, "Creating consumer");
                Arc::new(Consumer::new(
                    endpoint.clone(),
                    settings,
                    ConsumerContext {
                        adapter: self.adapter.clone(),
                        producers: self.producers.clone(),
                        pipeline: self.pipeline.clone(),
                        publisher,
                        inbound_log: self.inbound_log.clone(),
                        chunk_store: self.chunk_store.clone(),
                        connect_retries: self.connect_retries,
                    },
                ))
            })
            .clone();
        Ok(consumer)
    }

    pub fn consumers(&self) -> Vec<Arc<Consumer>> {
        self.consumers.iter().map(|c| c.value().clone()).collect()
    }

    /// Connects every consumer. Idempotent.
    ///
    /// The broker only counts as connected once all consumers are running;
    /// if one fails, the ones already started are stopped again.
    #[tracing::instrument(name = "broker.connect", skip_all)]
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let consumers = self.consumers();
        let mut started: Vec<Arc<Consumer>> = Vec::with_capacity(consumers.len());
        for consumer in consumers {
            if let Err(e) = consumer.connect().await {
                error!(endpoint = %consumer.endpoint(), error = %e, "Consumer failed to connect");
                for running in started {
                    running.disconnect().await;
                }
                return Err(e.into());
            }
            started.push(consumer);
        }

        self.connected.store(true, Ordering::SeqCst);
        info!(consumers = started.len(), "Broker connected");
        Ok(())
    }

    /// Stops every consumer, waiting for in-flight batches. Idempotent.
    #[tracing::instrument(name = "broker.disconnect", skip_all)]
    pub async fn disconnect(&self) {
        let _guard = self.lifecycle.lock().await;
        if !self.is_connected() {
            return;
        }
        for consumer in self.consumers() {
            consumer.disconnect().await;
        }
        self.connected.store(false, Ordering::SeqCst);
        info!("Broker disconnected");
    }
}

/// Builder for [`Broker`].
pub struct BrokerBuilder {
    adapter: Arc<dyn BrokerAdapter>,
    serializer: Arc<dyn Serializer>,
    cipher: Option<Arc<dyn PayloadCipher>>,
    inbound_log: Option<Arc<dyn InboundLog>>,
    chunk_store: Option<Arc<dyn ChunkStore>>,
    inbound_behaviors: Vec<Arc<dyn InboundBehavior>>,
    publisher: Option<Publisher>,
    connect_retries: usize,
}

impl BrokerBuilder {
    pub fn cipher(mut self, cipher: Arc<dyn PayloadCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Defaults to an in-memory log.
    pub fn inbound_log(mut self, inbound_log: Arc<dyn InboundLog>) -> Self {
        self.inbound_log = Some(inbound_log);
        self
    }

    /// Defaults to an in-memory store.
    pub fn chunk_store(mut self, chunk_store: Arc<dyn ChunkStore>) -> Self {
        self.chunk_store = Some(chunk_store);
        self
    }

    /// Adds a custom stage to the inbound pipeline.
    pub fn inbound_behavior(mut self, behavior: impl InboundBehavior + 'static) -> Self {
        self.inbound_behaviors.push(Arc::new(behavior));
        self
    }

    pub fn publisher(mut self, publisher: Publisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn connect_retries(mut self, connect_retries: usize) -> Self {
        self.connect_retries = connect_retries;
        self
    }

    pub fn build(self) -> Arc<Broker> {
        let pipeline = InboundPipeline::new(
            self.serializer.clone(),
            self.cipher.clone(),
            self.inbound_behaviors,
        );
        let publisher = OnceLock::new();
        if let Some(p) = self.publisher {
            let _ = publisher.set(p);
        }
        Arc::new(Broker {
            producers: Arc::new(Producers {
                adapter: self.adapter.clone(),
                serializer: self.serializer,
                cipher: self.cipher,
                cache: DashMap::new(),
            }),
            consumers: DashMap::new(),
            adapter: self.adapter,
            pipeline: Arc::new(pipeline),
            inbound_log: self
                .inbound_log
                .unwrap_or_else(|| Arc::new(InMemoryInboundLog::new())),
            chunk_store: self
                .chunk_store
                .unwrap_or_else(|| Arc::new(InMemoryChunkStore::new())),
            connect_retries: self.connect_retries,
            publisher,
            connected: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
        })
    }
}

#[cfg(all(test, feature = "in-memory"))]
mod tests;
