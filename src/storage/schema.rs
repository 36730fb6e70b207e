//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building.

use sea_query::Iden;

/// Inbound log table schema.
#[derive(Iden)]
pub enum InboundLogTable {
    #[iden = "courier_inbound_log"]
    Table,
    #[iden = "message_id"]
    MessageId,
    #[iden = "endpoint"]
    Endpoint,
    #[iden = "consumed_at"]
    ConsumedAt,
}

/// Chunk store table schema.
#[derive(Iden)]
pub enum ChunksTable {
    #[iden = "courier_chunks"]
    Table,
    #[iden = "message_id"]
    MessageId,
    #[iden = "chunk_index"]
    ChunkIndex,
    #[iden = "chunks_count"]
    ChunksCount,
    #[iden = "content"]
    Content,
    #[iden = "received_at"]
    ReceivedAt,
}

/// SQL for creating the inbound log table.
pub const CREATE_INBOUND_LOG_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS courier_inbound_log (
    message_id TEXT NOT NULL,
    endpoint TEXT NOT NULL,
    consumed_at TEXT NOT NULL,
    PRIMARY KEY (message_id, endpoint)
);
"#;

/// SQL for creating the chunk store table.
pub const CREATE_CHUNKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS courier_chunks (
    message_id TEXT NOT NULL,
    chunk_index INTEGER NOT NULL,
    chunks_count INTEGER NOT NULL,
    content BLOB NOT NULL,
    received_at TEXT NOT NULL,
    PRIMARY KEY (message_id, chunk_index)
);
"#;
