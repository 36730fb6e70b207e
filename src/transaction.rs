//! Consumer transactions.
//!
//! Every inbound batch runs inside a [`ConsumerTransaction`]. Resources
//! touched while processing (the outbox, the inbound log, the chunk store
//! and any resource a custom behavior enlists) buffer their writes and
//! apply them on commit.
//!
//! Commit is sequential, not two-phase: resources commit one after the
//! other, and a failure part-way leaves the earlier resources committed.
//! The remaining ones are rolled back. The outbox goes first, so a failed
//! produce leaves the batch unlogged and retryable.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error};

use crate::broker::Outbox;
use crate::chunking::{ChunkStore, ChunkStoreSession};
use crate::inbound_log::{InboundLog, InboundLogSession};
use crate::storage::Result;

/// A resource taking part in a consumer transaction.
#[async_trait]
pub trait Transactional: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;
}

/// Unit of work spanning the processing of one inbound batch.
pub struct ConsumerTransaction {
    outbox: Outbox,
    inbound_log: InboundLogSession,
    chunks: ChunkStoreSession,
    resources: Vec<Box<dyn Transactional>>,
}

impl ConsumerTransaction {
    pub fn begin(inbound_log: Arc<dyn InboundLog>, chunks: Arc<dyn ChunkStore>) -> Self {
        Self {
            outbox: Outbox::new(),
            inbound_log: InboundLogSession::new(inbound_log),
            chunks: ChunkStoreSession::new(chunks),
            resources: Vec::new(),
        }
    }

    /// Routed messages produced during dispatch wait here until commit.
    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn inbound_log(&mut self) -> &mut InboundLogSession {
        &mut self.inbound_log
    }

    pub fn chunks(&mut self) -> &mut ChunkStoreSession {
        &mut self.chunks
    }

    /// Adds a resource committed after the built-in stores.
    pub fn enlist(&mut self, resource: Box<dyn Transactional>) {
        debug!(resource = %resource.name(), "Enlisted in consumer transaction");
        self.resources.push(resource);
    }

    /// Commits the outbox, the inbound log, the chunk store, then enlisted resources.
    pub async fn commit(mut self) -> Result<()> {
        let mut pending = self.participants();
        let mut index = 0;
        while index < pending.len() {
            if let Err(e) = pending[index].commit().await {
                error!(
                    resource = %pending[index].name(),
                    error = %e,
                    "Commit failed, rolling back remaining resources"
                );
                for resource in pending[index..].iter_mut() {
                    if let Err(rollback_error) = resource.rollback().await {
                        error!(resource = %resource.name(), error = %rollback_error, "Rollback failed");
                    }
                }
                return Err(e);
            }
            index += 1;
        }
        Ok(())
    }

    /// Rolls back every resource. Returns the first failure after trying all.
    pub async fn rollback(mut self) -> Result<()> {
        let mut first_error = None;
        for resource in self.participants() {
            if let Err(e) = resource.rollback().await {
                error!(resource = %resource.name(), error = %e, "Rollback failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn participants(&mut self) -> Vec<&mut dyn Transactional> {
        let mut participants: Vec<&mut dyn Transactional> =
            vec![&mut self.outbox, &mut self.inbound_log, &mut self.chunks];
        participants.extend(self.resources.iter_mut().map(|r| r.as_mut() as &mut dyn Transactional));
        participants
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::InMemoryChunkStore;
    use crate::inbound_log::{InMemoryInboundLog, InboundLogEntry};
    use crate::test_utils::MockResource;
    use tokio::sync::RwLock;

    fn stores() -> (Arc<InMemoryInboundLog>, Arc<InMemoryChunkStore>) {
        (
            Arc::new(InMemoryInboundLog::new()),
            Arc::new(InMemoryChunkStore::new()),
        )
    }

    #[tokio::test]
    async fn test_commit_runs_in_enlistment_order() {
        let (log, chunks) = stores();
        let journal = Arc::new(RwLock::new(Vec::new()));
        let mut tx = ConsumerTransaction::begin(log.clone(), chunks);
        tx.enlist(Box::new(MockResource::new("first", journal.clone())));
        tx.enlist(Box::new(MockResource::new("second", journal.clone())));
        tx.inbound_log().add(InboundLogEntry::new("m-1", "orders"));

        tx.commit().await.expect("commit succeeds");

        assert_eq!(*journal.read().await, vec!["commit:first", "commit:second"]);
        assert_eq!(log.len().await.expect("len"), 1);
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_earlier_resources_committed() {
        let (log, chunks) = stores();
        let journal = Arc::new(RwLock::new(Vec::new()));
        let failing = MockResource::new("failing", journal.clone());
        failing.set_fail_on_commit(true).await;

        let mut tx = ConsumerTransaction::begin(log.clone(), chunks);
        tx.inbound_log().add(InboundLogEntry::new("m-1", "orders"));
        tx.enlist(Box::new(failing));
        tx.enlist(Box::new(MockResource::new("after", journal.clone())));

        assert!(tx.commit().await.is_err());

        // Not two-phase: the inbound log entry is durable, the later resource is not.
        assert_eq!(log.len().await.expect("len"), 1);
        assert_eq!(*journal.read().await, vec!["rollback:failing", "rollback:after"]);
    }

    #[tokio::test]
    async fn test_rollback_discards_pending_entries() {
        let (log, chunks) = stores();
        let journal = Arc::new(RwLock::new(Vec::new()));
        let mut tx = ConsumerTransaction::begin(log.clone(), chunks);
        tx.inbound_log().add(InboundLogEntry::new("m-1", "orders"));
        tx.enlist(Box::new(MockResource::new("custom", journal.clone())));

        tx.rollback().await.expect("rollback succeeds");

        assert_eq!(log.len().await.expect("len"), 0);
        assert_eq!(*journal.read().await, vec!["rollback:custom"]);
    }
}
