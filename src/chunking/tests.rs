use super::*;
use crate::messages::Endpoint;

fn chunk(message_id: &str, index: u32, count: u32, content: &'static [u8]) -> RawEnvelope {
    let headers = MessageHeaders::new()
        .with(names::MESSAGE_ID, message_id)
        .with(names::CHUNK_INDEX, index)
        .with(names::CHUNKS_COUNT, count);
    RawEnvelope::new(
        Bytes::from_static(content),
        headers,
        Endpoint::new("orders"),
        None,
    )
    .unwrap()
}

async fn aggregate(
    store: &Arc<InMemoryChunkStore>,
    envelope: &RawEnvelope,
) -> Option<Bytes> {
    let mut session = ChunkStoreSession::new(store.clone());
    let result = ChunkAggregator::new(&mut session)
        .aggregate_if_complete(envelope)
        .await
        .unwrap();
    session.commit().await.unwrap();
    result
}

#[tokio::test]
async fn test_two_chunks_are_joined_once() {
    let store = Arc::new(InMemoryChunkStore::new());

    assert_eq!(aggregate(&store, &chunk("m-1", 0, 2, b"A")).await, None);
    assert_eq!(
        aggregate(&store, &chunk("m-1", 1, 2, b"B")).await,
        Some(Bytes::from_static(b"AB"))
    );
    assert_eq!(store.total().await, 0);

    // Redelivery after completion starts nothing new.
    assert_eq!(aggregate(&store, &chunk("m-1", 0, 2, b"A")).await, None);
}

#[tokio::test]
async fn test_out_of_order_chunks_join_by_index() {
    let store = Arc::new(InMemoryChunkStore::new());

    assert_eq!(aggregate(&store, &chunk("m-1", 2, 3, b"C")).await, None);
    assert_eq!(aggregate(&store, &chunk("m-1", 0, 3, b"A")).await, None);
    assert_eq!(
        aggregate(&store, &chunk("m-1", 1, 3, b"B")).await,
        Some(Bytes::from_static(b"ABC"))
    );
}

#[tokio::test]
async fn test_duplicate_chunk_is_ignored() {
    let store = Arc::new(InMemoryChunkStore::new());

    assert_eq!(aggregate(&store, &chunk("m-1", 0, 3, b"A")).await, None);
    assert_eq!(aggregate(&store, &chunk("m-1", 0, 3, b"A")).await, None);
    assert_eq!(store.count_chunks("m-1").await.unwrap(), 1);
}

#[tokio::test]
async fn test_session_reads_its_own_writes() {
    let store = Arc::new(InMemoryChunkStore::new());
    let mut session = ChunkStoreSession::new(store.clone());
    let mut aggregator = ChunkAggregator::new(&mut session);

    let first = aggregator
        .aggregate_if_complete(&chunk("m-1", 0, 2, b"A"))
        .await
        .unwrap();
    let second = aggregator
        .aggregate_if_complete(&chunk("m-1", 1, 2, b"B"))
        .await
        .unwrap();

    assert_eq!(first, None);
    assert_eq!(second, Some(Bytes::from_static(b"AB")));
    assert_eq!(store.total().await, 0);
}

#[tokio::test]
async fn test_rollback_discards_parked_chunks() {
    let store = Arc::new(InMemoryChunkStore::new());
    let mut session = ChunkStoreSession::new(store.clone());
    ChunkAggregator::new(&mut session)
        .aggregate_if_complete(&chunk("m-1", 0, 2, b"A"))
        .await
        .unwrap();

    session.rollback().await.unwrap();
    session.commit().await.unwrap();

    assert_eq!(store.total().await, 0);
}

#[tokio::test]
async fn test_index_beyond_count_is_rejected() {
    let store = Arc::new(InMemoryChunkStore::new());
    let mut session = ChunkStoreSession::new(store);

    let result = ChunkAggregator::new(&mut session)
        .aggregate_if_complete(&chunk("m-1", 2, 2, b"C"))
        .await;

    assert!(matches!(
        result,
        Err(ChunkError::IndexOutOfRange { index: 2, count: 2 })
    ));
}

#[test]
fn test_chunk_headers_absent_for_plain_messages() {
    let headers = MessageHeaders::new().with(names::MESSAGE_ID, "m-1");

    assert_eq!(ChunkHeaders::read(&headers).unwrap(), None);
}

#[test]
fn test_split_into_chunks() {
    let payload = Bytes::from_static(b"abcdefg");

    let chunks = split_into_chunks(&payload, 3);

    assert_eq!(
        chunks,
        vec![
            Bytes::from_static(b"abc"),
            Bytes::from_static(b"def"),
            Bytes::from_static(b"g"),
        ]
    );
    assert_eq!(split_into_chunks(&payload, 7), vec![payload.clone()]);
}
