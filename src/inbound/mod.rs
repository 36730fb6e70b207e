//! Inbound processing pipeline.
//!
//! Every consumed message runs through an ordered chain of
//! [`InboundBehavior`]s inside the batch's [`ConsumerTransaction`]:
//!
//! 1. chunk aggregation: incomplete chunk sets stop here
//! 2. deduplication against the inbound log
//! 3. decryption, when a cipher is configured
//! 4. deserialization
//!
//! A message that makes it through every stage is handed back as an
//! [`InboundEnvelope`] for dispatch. Custom behaviors slot in by
//! [`sort_index`](InboundBehavior::sort_index).

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::broker::{ProduceError, TransportError};
use crate::chunking::{ChunkAggregator, ChunkError, ChunkHeaders};
use crate::inbound_log::InboundLogEntry;
use crate::messages::{AnyMessage, EnvelopeError, InboundEnvelope, RawEnvelope};
use crate::publishing::PublishError;
use crate::serialization::{CipherError, PayloadCipher, SerializationError, Serializer};
use crate::storage::StoreError;
use crate::subscribers::HandlerError;
use crate::transaction::ConsumerTransaction;

/// Result type for inbound processing.
pub type Result<T> = std::result::Result<T, InboundError>;

/// Sort indexes of the built-in stages.
pub mod sort_index {
    pub const CHUNK_AGGREGATION: i32 = 100;
    pub const DEDUPLICATION: i32 = 200;
    pub const DECRYPTION: i32 = 300;
    pub const DESERIALIZATION: i32 = 400;
}

/// Errors raised while processing an inbound batch.
#[derive(Debug, thiserror::Error)]
pub enum InboundError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error(transparent)]
    Cipher(#[from] CipherError),

    #[error(transparent)]
    Dispatch(#[from] PublishError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Produce(#[from] ProduceError),

    #[error("Inbound behavior failed: {0}")]
    Behavior(HandlerError),
}

impl InboundError {
    /// Failures that bypass the error policy and stop the consumer.
    pub fn is_fatal(&self) -> bool {
        match self {
            InboundError::Store(e) => e.is_fatal(),
            InboundError::Chunk(ChunkError::Store(e)) => e.is_fatal(),
            _ => false,
        }
    }
}

/// One message on its way through the pipeline.
pub struct InboundContext<'t> {
    pub envelope: RawEnvelope,
    /// Set by the deserialization stage.
    pub message: Option<AnyMessage>,
    transaction: &'t mut ConsumerTransaction,
    accepted: bool,
}

impl<'t> InboundContext<'t> {
    pub fn new(envelope: RawEnvelope, transaction: &'t mut ConsumerTransaction) -> Self {
        Self {
            envelope,
            message: None,
            transaction,
            accepted: false,
        }
    }

    /// The batch's transaction, for enlisting resources.
    pub fn transaction(&mut self) -> &mut ConsumerTransaction {
        self.transaction
    }

    /// Whether the message reached the end of the chain.
    pub fn is_accepted(&self) -> bool {
        self.accepted
    }
}

/// A stage of the inbound pipeline.
///
/// Returning without calling `next` consumes the message without
/// dispatching it.
#[async_trait]
pub trait InboundBehavior: Send + Sync {
    fn sort_index(&self) -> i32 {
        0
    }

    async fn handle(&self, context: &mut InboundContext<'_>, next: InboundNext<'_>) -> Result<()>;
}

/// The rest of the inbound chain.
pub struct InboundNext<'a> {
    behaviors: &'a [Arc<dyn InboundBehavior>],
}

impl<'a> InboundNext<'a> {
    pub async fn run(self, context: &mut InboundContext<'_>) -> Result<()> {
        match self.behaviors.split_first() {
            Some((behavior, rest)) => {
                behavior
                    .handle(context, InboundNext { behaviors: rest })
                    .await
            }
            None => {
                context.accepted = true;
                Ok(())
            }
        }
    }
}

// ============================================================================
// Built-in stages
// ============================================================================

/// Parks chunks until the set is complete, then continues with the joined payload.
///
/// Chunks of a message already in the inbound log are dropped, so a set
/// redelivered after completion is neither parked nor joined again.
pub struct ChunkAggregation;

#[async_trait]
impl InboundBehavior for ChunkAggregation {
    fn sort_index(&self) -> i32 {
        sort_index::CHUNK_AGGREGATION
    }

    async fn handle(&self, context: &mut InboundContext<'_>, next: InboundNext<'_>) -> Result<()> {
        if ChunkHeaders::read(context.envelope.headers())?.is_none() {
            return next.run(context).await;
        }

        let message_id = context.envelope.message_id().to_string();
        let endpoint = context.envelope.endpoint().name.clone();
        if context
            .transaction
            .inbound_log()
            .exists(&message_id, &endpoint)
            .await?
        {
            debug!(message_id = %message_id, endpoint = %endpoint, "Chunk of a processed message ignored");
            return Ok(());
        }

        let joined = ChunkAggregator::new(context.transaction.chunks())
            .aggregate_if_complete(&context.envelope)
            .await?;
        let Some(payload) = joined else {
            return Ok(());
        };

        context.envelope.set_payload(payload);
        ChunkHeaders::remove(context.envelope.headers_mut());
        next.run(context).await
    }
}

/// Skips messages already recorded in the inbound log for this endpoint.
pub struct Deduplication;

#[async_trait]
impl InboundBehavior for Deduplication {
    fn sort_index(&self) -> i32 {
        sort_index::DEDUPLICATION
    }

    async fn handle(&self, context: &mut InboundContext<'_>, next: InboundNext<'_>) -> Result<()> {
        let message_id = context.envelope.message_id().to_string();
        let endpoint = context.envelope.endpoint().name.clone();

        let log = context.transaction.inbound_log();
        if log.exists(&message_id, &endpoint).await? {
            debug!(message_id = %message_id, endpoint = %endpoint, "Duplicate message skipped");
            return Ok(());
        }
        log.add(InboundLogEntry::new(message_id, endpoint));

        next.run(context).await
    }
}

pub struct Decryption {
    cipher: Arc<dyn PayloadCipher>,
}

impl Decryption {
    pub fn new(cipher: Arc<dyn PayloadCipher>) -> Self {
        Self { cipher }
    }
}

#[async_trait]
impl InboundBehavior for Decryption {
    fn sort_index(&self) -> i32 {
        sort_index::DECRYPTION
    }

    async fn handle(&self, context: &mut InboundContext<'_>, next: InboundNext<'_>) -> Result<()> {
        let payload = self
            .cipher
            .decrypt(context.envelope.payload().clone(), context.envelope.headers())?;
        context.envelope.set_payload(payload);
        next.run(context).await
    }
}

pub struct Deserialization {
    serializer: Arc<dyn Serializer>,
}

impl Deserialization {
    pub fn new(serializer: Arc<dyn Serializer>) -> Self {
        Self { serializer }
    }
}

#[async_trait]
impl InboundBehavior for Deserialization {
    fn sort_index(&self) -> i32 {
        sort_index::DESERIALIZATION
    }

    async fn handle(&self, context: &mut InboundContext<'_>, next: InboundNext<'_>) -> Result<()> {
        if context.message.is_none() {
            let envelope = &context.envelope;
            let message = self.serializer.deserialize(
                envelope.payload(),
                envelope.headers(),
                envelope.endpoint(),
            )?;
            context.message = Some(message);
        }
        next.run(context).await
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// The ordered inbound chain shared by all consumers of a broker.
pub struct InboundPipeline {
    behaviors: Vec<Arc<dyn InboundBehavior>>,
}

impl InboundPipeline {
    pub fn new(
        serializer: Arc<dyn Serializer>,
        cipher: Option<Arc<dyn PayloadCipher>>,
        custom: Vec<Arc<dyn InboundBehavior>>,
    ) -> Self {
        let mut behaviors: Vec<Arc<dyn InboundBehavior>> =
            vec![Arc::new(ChunkAggregation), Arc::new(Deduplication)];
        if let Some(cipher) = cipher {
            behaviors.push(Arc::new(Decryption::new(cipher)));
        }
        behaviors.push(Arc::new(Deserialization::new(serializer)));
        behaviors.extend(custom);
        behaviors.sort_by_key(|b| b.sort_index());
        Self { behaviors }
    }

    /// Runs one raw message through the chain.
    ///
    /// `None` means the message was consumed without dispatch: a parked
    /// chunk, a duplicate, or a custom stage that stopped it.
    pub async fn process(
        &self,
        envelope: RawEnvelope,
        transaction: &mut ConsumerTransaction,
    ) -> Result<Option<InboundEnvelope>> {
        let mut context = InboundContext::new(envelope, transaction);
        InboundNext {
            behaviors: &self.behaviors,
        }
        .run(&mut context)
        .await?;

        if !context.accepted {
            return Ok(None);
        }
        Ok(Some(InboundEnvelope::new(context.envelope, context.message)))
    }
}
