//! SQLite implementations of the inbound log and the chunk store.

use async_trait::async_trait;
use bytes::Bytes;
use sea_query::{Expr, OnConflict, Order, Query, SqliteQueryBuilder};
use sqlx::{Row, SqlitePool};

use super::schema::{ChunksTable, InboundLogTable, CREATE_CHUNKS_TABLE, CREATE_INBOUND_LOG_TABLE};
use super::{Result, StoreError};
use crate::chunking::{ChunkStore, StoredChunk};
use crate::inbound_log::{InboundLog, InboundLogEntry};

const INBOUND_LOG_TABLE: &str = "courier_inbound_log";
const CHUNKS_TABLE: &str = "courier_chunks";

/// A missing table is a misconfiguration, not a transient failure.
fn db_error(table: &'static str) -> impl Fn(sqlx::Error) -> StoreError {
    move |e| match &e {
        sqlx::Error::Database(db) if db.message().contains("no such table") => {
            StoreError::ResourceNotFound(table.to_string())
        }
        _ => StoreError::Database(e),
    }
}

/// SQLite implementation of [`InboundLog`].
pub struct SqliteInboundLog {
    pool: SqlitePool,
}

impl SqliteInboundLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(CREATE_INBOUND_LOG_TABLE).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl InboundLog for SqliteInboundLog {
    async fn exists(&self, message_id: &str, endpoint: &str) -> Result<bool> {
        let query = Query::select()
            .expr(Expr::col(InboundLogTable::MessageId).count())
            .from(InboundLogTable::Table)
            .and_where(Expr::col(InboundLogTable::MessageId).eq(message_id))
            .and_where(Expr::col(InboundLogTable::Endpoint).eq(endpoint))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query)
            .fetch_one(&self.pool)
            .await
            .map_err(db_error(INBOUND_LOG_TABLE))?;
        let count: i64 = row.get(0);
        Ok(count > 0)
    }

    async fn append(&self, entries: &[InboundLogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for entry in entries {
            let query = Query::insert()
                .into_table(InboundLogTable::Table)
                .columns([
                    InboundLogTable::MessageId,
                    InboundLogTable::Endpoint,
                    InboundLogTable::ConsumedAt,
                ])
                .values_panic([
                    entry.message_id.as_str().into(),
                    entry.endpoint.as_str().into(),
                    entry.consumed_at.to_rfc3339().into(),
                ])
                .on_conflict(
                    OnConflict::columns([InboundLogTable::MessageId, InboundLogTable::Endpoint])
                        .do_nothing()
                        .to_owned(),
                )
                .to_string(SqliteQueryBuilder);

            sqlx::query(&query)
                .execute(&mut *tx)
                .await
                .map_err(db_error(INBOUND_LOG_TABLE))?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        let query = Query::select()
            .expr(Expr::col(InboundLogTable::MessageId).count())
            .from(InboundLogTable::Table)
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query)
            .fetch_one(&self.pool)
            .await
            .map_err(db_error(INBOUND_LOG_TABLE))?;
        let count: i64 = row.get(0);
        Ok(count as usize)
    }
}

/// SQLite implementation of [`ChunkStore`].
pub struct SqliteChunkStore {
    pool: SqlitePool,
}

impl SqliteChunkStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(CREATE_CHUNKS_TABLE).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ChunkStore for SqliteChunkStore {
    async fn count_chunks(&self, message_id: &str) -> Result<usize> {
        let query = Query::select()
            .expr(Expr::col(ChunksTable::ChunkIndex).count())
            .from(ChunksTable::Table)
            .and_where(Expr::col(ChunksTable::MessageId).eq(message_id))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query)
            .fetch_one(&self.pool)
            .await
            .map_err(db_error(CHUNKS_TABLE))?;
        let count: i64 = row.get(0);
        Ok(count as usize)
    }

    async fn get_chunks(&self, message_id: &str) -> Result<Vec<StoredChunk>> {
        let query = Query::select()
            .columns([
                ChunksTable::MessageId,
                ChunksTable::ChunkIndex,
                ChunksTable::ChunksCount,
                ChunksTable::Content,
            ])
            .from(ChunksTable::Table)
            .and_where(Expr::col(ChunksTable::MessageId).eq(message_id))
            .order_by_expr(Expr::cust("rowid"), Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error(CHUNKS_TABLE))?;

        rows.iter()
            .map(|row| -> Result<StoredChunk> {
                let index: i64 = row.try_get("chunk_index")?;
                let count: i64 = row.try_get("chunks_count")?;
                let content: Vec<u8> = row.try_get("content")?;
                Ok(StoredChunk {
                    message_id: row.try_get("message_id")?,
                    index: index as u32,
                    count: count as u32,
                    content: Bytes::from(content),
                })
            })
            .collect()
    }

    async fn store(&self, chunks: &[StoredChunk]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }

        let received_at = chrono::Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        for chunk in chunks {
            let query = Query::insert()
                .into_table(ChunksTable::Table)
                .columns([
                    ChunksTable::MessageId,
                    ChunksTable::ChunkIndex,
                    ChunksTable::ChunksCount,
                    ChunksTable::Content,
                    ChunksTable::ReceivedAt,
                ])
                .values_panic([
                    chunk.message_id.as_str().into(),
                    chunk.index.into(),
                    chunk.count.into(),
                    chunk.content.to_vec().into(),
                    received_at.as_str().into(),
                ])
                .on_conflict(
                    OnConflict::columns([ChunksTable::MessageId, ChunksTable::ChunkIndex])
                        .do_nothing()
                        .to_owned(),
                )
                .to_string(SqliteQueryBuilder);

            sqlx::query(&query)
                .execute(&mut *tx)
                .await
                .map_err(db_error(CHUNKS_TABLE))?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn cleanup(&self, message_ids: &[String]) -> Result<()> {
        if message_ids.is_empty() {
            return Ok(());
        }

        let query = Query::delete()
            .from_table(ChunksTable::Table)
            .and_where(Expr::col(ChunksTable::MessageId).is_in(message_ids.iter().map(String::as_str)))
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query)
            .execute(&self.pool)
            .await
            .map_err(db_error(CHUNKS_TABLE))?;
        Ok(())
    }
}
