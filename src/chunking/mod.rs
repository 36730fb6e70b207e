//! Chunking: splitting large payloads and reassembling them on consume.
//!
//! Producers split payloads larger than the endpoint's chunk size into
//! ordered chunks sharing one message id. Consumers park chunks in a
//! [`ChunkStore`] until the set is complete, then [`ChunkAggregator`]
//! joins them back into the original payload.

mod in_memory;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tracing::debug;

pub use in_memory::InMemoryChunkStore;

use crate::messages::headers::{names, MessageHeaders};
use crate::messages::RawEnvelope;
use crate::storage::{Result, StoreError};
use crate::transaction::Transactional;

/// Errors raised while reassembling chunks.
#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("Missing {0} header")]
    MissingHeader(&'static str),

    #[error("Invalid {header} header: {value}")]
    InvalidHeader { header: &'static str, value: String },

    #[error("Chunk index {index} out of range for {count} chunks")]
    IndexOutOfRange { index: u32, count: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One parked chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredChunk {
    pub message_id: String,
    pub index: u32,
    pub count: u32,
    pub content: Bytes,
}

/// Durable backend holding incomplete chunk sets.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    async fn count_chunks(&self, message_id: &str) -> Result<usize>;

    /// Chunks of one message in arrival order.
    async fn get_chunks(&self, message_id: &str) -> Result<Vec<StoredChunk>>;

    /// Stores chunks. A chunk whose index is already stored is ignored.
    async fn store(&self, chunks: &[StoredChunk]) -> Result<()>;

    async fn cleanup(&self, message_ids: &[String]) -> Result<()>;
}

/// Transaction-scoped view of a [`ChunkStore`].
///
/// Reads see this session's own pending stores and cleanups.
pub struct ChunkStoreSession {
    store: Arc<dyn ChunkStore>,
    stored: Vec<StoredChunk>,
    cleaned: BTreeSet<String>,
}

impl ChunkStoreSession {
    pub fn new(store: Arc<dyn ChunkStore>) -> Self {
        Self {
            store,
            stored: Vec::new(),
            cleaned: BTreeSet::new(),
        }
    }

    pub async fn count_chunks(&self, message_id: &str) -> Result<usize> {
        let committed = if self.cleaned.contains(message_id) {
            0
        } else {
            self.store.count_chunks(message_id).await?
        };
        Ok(committed + self.pending_for(message_id).count())
    }

    pub async fn get_chunks(&self, message_id: &str) -> Result<Vec<StoredChunk>> {
        let mut chunks = if self.cleaned.contains(message_id) {
            Vec::new()
        } else {
            self.store.get_chunks(message_id).await?
        };
        chunks.extend(self.pending_for(message_id).cloned());
        Ok(chunks)
    }

    pub fn store(&mut self, chunk: StoredChunk) {
        self.stored.push(chunk);
    }

    pub fn cleanup(&mut self, message_id: &str) {
        self.stored.retain(|c| c.message_id != message_id);
        self.cleaned.insert(message_id.to_string());
    }

    fn pending_for<'a>(&'a self, message_id: &'a str) -> impl Iterator<Item = &'a StoredChunk> {
        self.stored.iter().filter(move |c| c.message_id == message_id)
    }
}

#[async_trait]
impl Transactional for ChunkStoreSession {
    fn name(&self) -> &str {
        "chunk-store"
    }

    async fn commit(&mut self) -> Result<()> {
        if !self.cleaned.is_empty() {
            let ids: Vec<String> = self.cleaned.iter().cloned().collect();
            self.store.cleanup(&ids).await?;
        }
        if !self.stored.is_empty() {
            self.store.store(&self.stored).await?;
        }
        self.stored.clear();
        self.cleaned.clear();
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.stored.clear();
        self.cleaned.clear();
        Ok(())
    }
}

/// Chunk position read from message headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeaders {
    pub index: u32,
    pub count: u32,
}

impl ChunkHeaders {
    /// `Ok(None)` when the message is not chunked.
    pub fn read(headers: &MessageHeaders) -> std::result::Result<Option<Self>, ChunkError> {
        let Some(index) = parse(headers, names::CHUNK_INDEX)? else {
            return Ok(None);
        };
        let count = parse(headers, names::CHUNKS_COUNT)?
            .ok_or(ChunkError::MissingHeader(names::CHUNKS_COUNT))?;
        if index >= count {
            return Err(ChunkError::IndexOutOfRange { index, count });
        }
        Ok(Some(Self { index, count }))
    }

    pub fn write(&self, headers: &mut MessageHeaders) {
        headers.insert(names::CHUNK_INDEX, self.index);
        headers.insert(names::CHUNKS_COUNT, self.count);
    }

    pub fn remove(headers: &mut MessageHeaders) {
        headers.remove(names::CHUNK_INDEX);
        headers.remove(names::CHUNKS_COUNT);
    }
}

fn parse(headers: &MessageHeaders, header: &'static str) -> std::result::Result<Option<u32>, ChunkError> {
    headers
        .get_as::<u32>(header)
        .map_err(|_| ChunkError::InvalidHeader {
            header,
            value: headers.get(header).unwrap_or_default().to_string(),
        })
}

/// Reassembles chunked payloads inside a consumer transaction.
pub struct ChunkAggregator<'s> {
    session: &'s mut ChunkStoreSession,
}

impl<'s> ChunkAggregator<'s> {
    pub fn new(session: &'s mut ChunkStoreSession) -> Self {
        Self { session }
    }

    /// Returns the joined payload once the chunk completing the set arrives.
    ///
    /// Returns `None` while chunks are missing, and for a chunk whose index
    /// is already stored.
    pub async fn aggregate_if_complete(
        &mut self,
        envelope: &RawEnvelope,
    ) -> std::result::Result<Option<Bytes>, ChunkError> {
        let headers = ChunkHeaders::read(envelope.headers())?
            .ok_or(ChunkError::MissingHeader(names::CHUNK_INDEX))?;
        let message_id = envelope.message_id();

        let existing = self.session.get_chunks(message_id).await?;
        if existing.iter().any(|c| c.index == headers.index) {
            debug!(message_id, index = headers.index, "Duplicate chunk ignored");
            return Ok(None);
        }

        // The first chunk seen decides the set size.
        let count = existing.first().map_or(headers.count, |c| c.count);

        let chunk = StoredChunk {
            message_id: message_id.to_string(),
            index: headers.index,
            count,
            content: envelope.payload().clone(),
        };

        if existing.len() + 1 < count as usize {
            debug!(message_id, index = headers.index, count, "Chunk stored");
            self.session.store(chunk);
            return Ok(None);
        }

        let mut chunks = existing;
        chunks.push(chunk);
        chunks.sort_by_key(|c| c.index);

        let mut joined = BytesMut::with_capacity(chunks.iter().map(|c| c.content.len()).sum());
        for c in &chunks {
            joined.extend_from_slice(&c.content);
        }

        self.session.cleanup(message_id);
        debug!(message_id, count, "Chunk set complete");
        Ok(Some(joined.freeze()))
    }

    /// Drops any parked chunks of a message.
    pub fn cleanup(&mut self, message_id: &str) {
        self.session.cleanup(message_id);
    }
}

/// Splits a payload into chunks of at most `chunk_size` bytes.
///
/// Chunks share the payload's buffer.
pub fn split_into_chunks(payload: &Bytes, chunk_size: usize) -> Vec<Bytes> {
    if chunk_size == 0 || payload.len() <= chunk_size {
        return vec![payload.clone()];
    }
    (0..payload.len())
        .step_by(chunk_size)
        .map(|start| payload.slice(start..(start + chunk_size).min(payload.len())))
        .collect()
}

#[cfg(test)]
mod tests;
