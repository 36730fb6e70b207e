use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ChunkStore, StoredChunk};
use crate::storage::Result;

/// In-memory chunk store for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryChunkStore {
    chunks: RwLock<Vec<StoredChunk>>,
}

impl InMemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of parked chunks across all messages.
    pub async fn total(&self) -> usize {
        self.chunks.read().await.len()
    }
}

#[async_trait]
impl ChunkStore for InMemoryChunkStore {
    async fn count_chunks(&self, message_id: &str) -> Result<usize> {
        Ok(self
            .chunks
            .read()
            .await
            .iter()
            .filter(|c| c.message_id == message_id)
            .count())
    }

    async fn get_chunks(&self, message_id: &str) -> Result<Vec<StoredChunk>> {
        Ok(self
            .chunks
            .read()
            .await
            .iter()
            .filter(|c| c.message_id == message_id)
            .cloned()
            .collect())
    }

    async fn store(&self, chunks: &[StoredChunk]) -> Result<()> {
        let mut stored = self.chunks.write().await;
        for chunk in chunks {
            let known = stored
                .iter()
                .any(|c| c.message_id == chunk.message_id && c.index == chunk.index);
            if !known {
                stored.push(chunk.clone());
            }
        }
        Ok(())
    }

    async fn cleanup(&self, message_ids: &[String]) -> Result<()> {
        self.chunks
            .write()
            .await
            .retain(|c| !message_ids.contains(&c.message_id));
        Ok(())
    }
}
