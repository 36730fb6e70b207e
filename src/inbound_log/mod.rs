//! Inbound log: the deduplication store.
//!
//! Records which message ids have been consumed from which endpoint.
//! Writes go through an [`InboundLogSession`] and only become durable when
//! the enclosing consumer transaction commits.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::storage::Result;
use crate::transaction::Transactional;

/// A consumed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundLogEntry {
    pub message_id: String,
    pub endpoint: String,
    pub consumed_at: DateTime<Utc>,
}

impl InboundLogEntry {
    pub fn new(message_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            endpoint: endpoint.into(),
            consumed_at: Utc::now(),
        }
    }
}

/// Durable backend of the inbound log.
#[async_trait]
pub trait InboundLog: Send + Sync {
    async fn exists(&self, message_id: &str, endpoint: &str) -> Result<bool>;

    /// Appends entries atomically. Entries already present are ignored.
    async fn append(&self, entries: &[InboundLogEntry]) -> Result<()>;

    /// Number of committed entries.
    async fn len(&self) -> Result<usize>;
}

/// Transaction-scoped view of an [`InboundLog`].
pub struct InboundLogSession {
    log: Arc<dyn InboundLog>,
    pending: Vec<InboundLogEntry>,
}

impl InboundLogSession {
    pub fn new(log: Arc<dyn InboundLog>) -> Self {
        Self {
            log,
            pending: Vec::new(),
        }
    }

    /// True if the message was committed earlier or added in this session.
    pub async fn exists(&self, message_id: &str, endpoint: &str) -> Result<bool> {
        if self
            .pending
            .iter()
            .any(|e| e.message_id == message_id && e.endpoint == endpoint)
        {
            return Ok(true);
        }
        self.log.exists(message_id, endpoint).await
    }

    pub fn add(&mut self, entry: InboundLogEntry) {
        self.pending.push(entry);
    }

    pub fn pending(&self) -> &[InboundLogEntry] {
        &self.pending
    }
}

#[async_trait]
impl Transactional for InboundLogSession {
    fn name(&self) -> &str {
        "inbound-log"
    }

    async fn commit(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.log.append(&self.pending).await?;
        self.pending.clear();
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.pending.clear();
        Ok(())
    }
}

/// In-memory inbound log for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryInboundLog {
    entries: RwLock<Vec<InboundLogEntry>>,
}

impl InMemoryInboundLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<InboundLogEntry> {
        self.entries.read().await.clone()
    }
}

#[async_trait]
impl InboundLog for InMemoryInboundLog {
    async fn exists(&self, message_id: &str, endpoint: &str) -> Result<bool> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .any(|e| e.message_id == message_id && e.endpoint == endpoint))
    }

    async fn append(&self, entries: &[InboundLogEntry]) -> Result<()> {
        let mut stored = self.entries.write().await;
        for entry in entries {
            let known = stored
                .iter()
                .any(|e| e.message_id == entry.message_id && e.endpoint == entry.endpoint);
            if !known {
                stored.push(entry.clone());
            }
        }
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.entries.read().await.len())
    }
}
