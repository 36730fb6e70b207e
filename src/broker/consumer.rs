//! Consumer: pulls raw messages from the transport and runs them through
//! the inbound pipeline into the publisher.
//!
//! Each batch is processed inside one [`ConsumerTransaction`]. On failure
//! the consumer's [`ErrorPolicy`] decides between retrying the batch,
//! skipping it, moving it to another endpoint, or stopping.
//!
//! Skipping or moving settles the batch in a fresh transaction: a failed
//! chunk set is joined back into one message and its parked chunks are
//! cleaned up, and the settled messages are logged so redeliveries are
//! ignored.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{BrokerAdapter, Producers, RawMessage, RawMessageStream, TransportError};
use crate::chunking::{ChunkAggregator, ChunkHeaders, ChunkStore};
use crate::error_policy::{self, ErrorAction, ErrorPolicy, PolicyError};
use crate::inbound::{InboundError, InboundPipeline};
use crate::inbound_log::{InboundLog, InboundLogEntry};
use crate::messages::headers::names;
use crate::messages::{AnyMessage, Endpoint, RawEnvelope};
use crate::publishing::Publisher;
use crate::transaction::ConsumerTransaction;
use crate::utils::retry::{connection_backoff, retry_transient};

/// How many messages are dispatched together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSettings {
    /// 1 dispatches every message on its own.
    pub size: usize,
    /// How long a partial batch waits for more messages.
    pub max_wait: Duration,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            size: 1,
            max_wait: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub batch: BatchSettings,
    /// `None` makes every processing failure fatal.
    pub error_policy: Option<ErrorPolicy>,
}

impl ConsumerSettings {
    pub fn with_batch(mut self, size: usize, max_wait: Duration) -> Self {
        self.batch = BatchSettings { size, max_wait };
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = Some(policy);
        self
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        self.error_policy
            .as_ref()
            .map_or(Ok(()), ErrorPolicy::validate)
    }
}

/// Lifecycle of a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerStatus {
    Idle,
    Running,
    Stopped,
    /// Stopped by an error the policy did not handle.
    Failed(String),
}

/// Everything a consumer needs from its broker.
pub(crate) struct ConsumerContext {
    pub(crate) adapter: Arc<dyn BrokerAdapter>,
    pub(crate) producers: Arc<Producers>,
    pub(crate) pipeline: Arc<InboundPipeline>,
    pub(crate) publisher: Publisher,
    pub(crate) inbound_log: Arc<dyn InboundLog>,
    pub(crate) chunk_store: Arc<dyn ChunkStore>,
    pub(crate) connect_retries: usize,
}

struct Running {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Receives messages from one endpoint.
pub struct Consumer {
    endpoint: Endpoint,
    settings: ConsumerSettings,
    context: Arc<ConsumerContext>,
    status: Arc<watch::Sender<ConsumerStatus>>,
    running: Mutex<Option<Running>>,
}

impl Consumer {
    pub(crate) fn new(endpoint: Endpoint, settings: ConsumerSettings, context: ConsumerContext) -> Self {
        let (status, _) = watch::channel(ConsumerStatus::Idle);
        Self {
            endpoint,
            settings,
            context: Arc::new(context),
            status: Arc::new(status),
            running: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    pub fn status(&self) -> ConsumerStatus {
        self.status.borrow().clone()
    }

    /// Watches status changes, e.g. to wait for a consumer to stop.
    pub fn watch_status(&self) -> watch::Receiver<ConsumerStatus> {
        self.status.subscribe()
    }

    /// Subscribes to the endpoint and starts the consume loop.
    ///
    /// Connection failures are retried with backoff. Calling it on a
    /// running consumer does nothing.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let stream = retry_transient(
            "consumer.subscribe",
            connection_backoff(self.context.connect_retries),
            TransportError::is_transient,
            move || self.context.adapter.subscribe(&self.endpoint),
        )
        .await?;

        let (cancel, cancelled) = watch::channel(false);
        let worker = Worker {
            endpoint: self.endpoint.clone(),
            settings: self.settings.clone(),
            context: self.context.clone(),
            cancelled,
            status: self.status.clone(),
        };
        self.status.send_replace(ConsumerStatus::Running);
        let handle = tokio::spawn(worker.run(stream));
        *running = Some(Running { cancel, handle });

        info!(endpoint = %self.endpoint, "Consumer started");
        Ok(())
    }

    /// Stops accepting messages and waits for the batch in flight.
    pub async fn disconnect(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        let _ = running.cancel.send(true);
        if let Err(e) = running.handle.await {
            error!(endpoint = %self.endpoint, error = %e, "Consumer task panicked");
            self.status
                .send_replace(ConsumerStatus::Failed(format!("consumer task panicked: {e}")));
        }
        info!(endpoint = %self.endpoint, status = ?self.status(), "Consumer stopped");
    }
}

// ============================================================================
// Consume loop
// ============================================================================

struct Worker {
    endpoint: Endpoint,
    settings: ConsumerSettings,
    context: Arc<ConsumerContext>,
    cancelled: watch::Receiver<bool>,
    status: Arc<watch::Sender<ConsumerStatus>>,
}

impl Worker {
    async fn run(mut self, mut stream: RawMessageStream) {
        let outcome = self.consume(&mut stream).await;
        let status = match outcome {
            Ok(()) => ConsumerStatus::Stopped,
            Err(reason) => {
                error!(endpoint = %self.endpoint, error = %reason, "Consumer stopped on fatal error");
                ConsumerStatus::Failed(reason)
            }
        };
        self.status.send_replace(status);
    }

    async fn consume(&mut self, stream: &mut RawMessageStream) -> Result<(), String> {
        while !self.is_cancelled() {
            let batch = match self.next_batch(stream).await {
                Ok(Some(batch)) => batch,
                Ok(None) => break,
                Err(e) => return Err(e.to_string()),
            };
            self.process_batch(batch).await?;
        }
        debug!(endpoint = %self.endpoint, "Consume loop finished");
        Ok(())
    }

    fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Waits for the first message, then fills the batch until it is full
    /// or `max_wait` has passed. `None` on cancellation or end of stream.
    async fn next_batch(
        &mut self,
        stream: &mut RawMessageStream,
    ) -> Result<Option<Vec<RawMessage>>, TransportError> {
        let first = tokio::select! {
            biased;
            _ = self.cancelled.changed() => return Ok(None),
            next = stream.next() => match next {
                Some(message) => message?,
                None => return Ok(None),
            },
        };

        let size = self.settings.batch.size.max(1);
        let mut batch = Vec::with_capacity(size);
        batch.push(first);

        let deadline = Instant::now() + self.settings.batch.max_wait;
        while batch.len() < size {
            tokio::select! {
                biased;
                _ = self.cancelled.changed() => break,
                next = tokio::time::timeout_at(deadline, stream.next()) => match next {
                    Ok(Some(message)) => batch.push(message?),
                    Ok(None) | Err(_) => break,
                },
            }
        }
        Ok(Some(batch))
    }

    /// Processes a batch until it is committed or the error policy gives up on it.
    #[tracing::instrument(name = "consumer.process", skip_all, fields(endpoint = %self.endpoint, batch = messages.len()))]
    async fn process_batch(&mut self, mut messages: Vec<RawMessage>) -> Result<(), String> {
        let mut failed_attempts = 0u32;
        loop {
            let error = match self.try_process(&messages).await {
                Ok(()) => return self.acknowledge(&messages).await,
                Err(e) => e,
            };
            if error.is_fatal() {
                return Err(error.to_string());
            }

            failed_attempts += 1;
            match error_policy::decide(self.settings.error_policy.as_ref(), failed_attempts) {
                ErrorAction::Retry { delay } => {
                    warn!(
                        attempt = failed_attempts,
                        error = %error,
                        delay_ms = %delay.as_millis(),
                        "Processing failed, retrying"
                    );
                    for message in &mut messages {
                        message.headers.insert(names::FAILED_ATTEMPTS, failed_attempts);
                    }
                    if !delay.is_zero() {
                        tokio::select! {
                            biased;
                            _ = self.cancelled.changed() => return Ok(()),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
                ErrorAction::Skip => {
                    warn!(attempt = failed_attempts, error = %error, "Processing failed, skipping");
                    let (_, transaction) = self.settle(&messages).await.map_err(|e| e.to_string())?;
                    transaction.commit().await.map_err(|e| e.to_string())?;
                    return self.acknowledge(&messages).await;
                }
                ErrorAction::Move(target) => {
                    warn!(
                        attempt = failed_attempts,
                        error = %error,
                        target = %target,
                        "Processing failed, moving"
                    );
                    let (settled, transaction) = self.settle(&messages).await.map_err(|e| e.to_string())?;
                    if let Err(e) = self.move_to(&target, &settled, failed_attempts).await {
                        if let Err(rollback_error) = transaction.rollback().await {
                            warn!(error = %rollback_error, "Rollback failed");
                        }
                        return Err(e);
                    }
                    transaction.commit().await.map_err(|e| e.to_string())?;
                    return self.acknowledge(&messages).await;
                }
                ErrorAction::Fatal => return Err(error.to_string()),
            }
        }
    }

    fn begin(&self) -> ConsumerTransaction {
        ConsumerTransaction::begin(
            self.context.inbound_log.clone(),
            self.context.chunk_store.clone(),
        )
    }

    /// One attempt: pipeline, dispatch, commit. Rolls back on failure.
    async fn try_process(&self, messages: &[RawMessage]) -> Result<(), InboundError> {
        let mut transaction = self.begin();
        match self.dispatch(messages, &mut transaction).await {
            Ok(()) => Ok(transaction.commit().await?),
            Err(e) => {
                if let Err(rollback_error) = transaction.rollback().await {
                    warn!(error = %rollback_error, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn dispatch(
        &self,
        messages: &[RawMessage],
        transaction: &mut ConsumerTransaction,
    ) -> Result<(), InboundError> {
        let mut envelopes: Vec<AnyMessage> = Vec::with_capacity(messages.len());
        for message in messages {
            let raw = RawEnvelope::new(
                message.payload.clone(),
                message.headers.clone(),
                self.endpoint.clone(),
                message.offset.clone(),
            )?;
            if let Some(envelope) = self.context.pipeline.process(raw, transaction).await? {
                envelopes.push(Arc::new(envelope));
            }
        }

        if envelopes.is_empty() {
            return Ok(());
        }
        debug!(messages = envelopes.len(), "Dispatching inbound messages");
        transaction
            .outbox()
            .scope(self.context.publisher.publish_all(envelopes))
            .await?;
        Ok(())
    }

    /// Resolves a batch the policy gave up on into the messages it stands for.
    ///
    /// Plain messages stay as they are. The chunk completing a set becomes
    /// the joined message without chunk headers. Chunks of incomplete sets
    /// stay parked and messages already in the inbound log are dropped.
    /// The returned transaction holds the chunk store and inbound log
    /// updates and is committed once the messages are dealt with.
    async fn settle(
        &self,
        messages: &[RawMessage],
    ) -> Result<(Vec<RawMessage>, ConsumerTransaction), InboundError> {
        let mut transaction = self.begin();
        let mut settled = Vec::with_capacity(messages.len());
        for message in messages {
            match self.settle_one(message, &mut transaction).await {
                Ok(Some(message)) => settled.push(message),
                Ok(None) => {}
                Err(e) => {
                    if let Err(rollback_error) = transaction.rollback().await {
                        warn!(error = %rollback_error, "Rollback failed");
                    }
                    return Err(e);
                }
            }
        }
        Ok((settled, transaction))
    }

    async fn settle_one(
        &self,
        message: &RawMessage,
        transaction: &mut ConsumerTransaction,
    ) -> Result<Option<RawMessage>, InboundError> {
        let Ok(envelope) = RawEnvelope::new(
            message.payload.clone(),
            message.headers.clone(),
            self.endpoint.clone(),
            message.offset.clone(),
        ) else {
            return Ok(Some(message.clone()));
        };
        let message_id = envelope.message_id().to_string();
        if transaction
            .inbound_log()
            .exists(&message_id, &self.endpoint.name)
            .await?
        {
            return Ok(None);
        }

        let mut settled = message.clone();
        if matches!(ChunkHeaders::read(envelope.headers()), Ok(Some(_))) {
            let joined = ChunkAggregator::new(transaction.chunks())
                .aggregate_if_complete(&envelope)
                .await?;
            let Some(payload) = joined else {
                return Ok(None);
            };
            debug!(message_id = %message_id, "Failed chunk set joined");
            settled.payload = payload;
            ChunkHeaders::remove(&mut settled.headers);
        }

        transaction
            .inbound_log()
            .add(InboundLogEntry::new(message_id, self.endpoint.name.clone()));
        Ok(Some(settled))
    }

    /// Produces the settled messages, bytes unchanged, to `target`.
    async fn move_to(&self, target: &Endpoint, messages: &[RawMessage], failed_attempts: u32) -> Result<(), String> {
        let producer = self.context.producers.get(target);
        for message in messages {
            let mut headers = message.headers.clone();
            headers.insert(names::FAILED_ATTEMPTS, failed_attempts);
            headers.insert(names::SOURCE_ENDPOINT, &self.endpoint.name);
            producer
                .produce_raw(message.payload.clone(), &headers)
                .await
                .map_err(|e| format!("moving to '{target}' failed: {e}"))?;
        }
        Ok(())
    }

    async fn acknowledge(&self, messages: &[RawMessage]) -> Result<(), String> {
        let offsets: Vec<String> = messages.iter().filter_map(|m| m.offset.clone()).collect();
        if offsets.is_empty() {
            return Ok(());
        }
        self.context
            .adapter
            .acknowledge(&self.endpoint, &offsets)
            .await
            .map_err(|e| e.to_string())
    }
}
