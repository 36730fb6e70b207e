//! Outbox for messages produced while an inbound batch is processed.
//!
//! The consumer runs dispatch inside [`Outbox::scope`]. Routed messages
//! produced from handlers in that scope are queued in the batch's
//! [`ConsumerTransaction`](crate::transaction::ConsumerTransaction) and only
//! reach the transport when it commits. A rolled back attempt produces
//! nothing, so a retried batch produces its derived messages once.
//!
//! Outside a consumer (a plain `Publisher::publish` call) there is no
//! current outbox and messages are produced immediately.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::Producer;
use crate::messages::OutboundEnvelope;
use crate::storage::{Result, StoreError};
use crate::transaction::Transactional;

tokio::task_local! {
    static CURRENT: Outbox;
}

struct PendingMessage {
    producer: Arc<Producer>,
    envelope: OutboundEnvelope,
}

/// Messages waiting for the consumer transaction to commit.
#[derive(Clone, Default)]
pub struct Outbox {
    pending: Arc<Mutex<Vec<PendingMessage>>>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// The outbox of the batch being dispatched on this task, if any.
    pub fn current() -> Option<Outbox> {
        CURRENT.try_with(Outbox::clone).ok()
    }

    /// Runs `future` with this outbox as the current one.
    pub async fn scope<F: Future>(&self, future: F) -> F::Output {
        CURRENT.scope(self.clone(), future).await
    }

    pub(crate) async fn add(&self, producer: Arc<Producer>, envelope: OutboundEnvelope) {
        debug!(endpoint = %producer.endpoint(), "Message queued in outbox");
        self.pending
            .lock()
            .await
            .push(PendingMessage { producer, envelope });
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl Transactional for Outbox {
    fn name(&self) -> &str {
        "outbox"
    }

    /// Produces queued messages in the order they were added.
    async fn commit(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut *self.pending.lock().await);
        if pending.is_empty() {
            return Ok(());
        }
        let count = pending.len();
        for message in pending {
            message
                .producer
                .produce_envelope(&message.envelope)
                .await
                .map_err(|e| {
                    StoreError::Backend(format!(
                        "producing to '{}' failed: {e}",
                        message.producer.endpoint()
                    ))
                })?;
        }
        debug!(count, "Outbox flushed");
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.pending.lock().await.clear();
        Ok(())
    }
}
