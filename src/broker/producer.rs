//! Producer: serializes messages and hands them to the transport.

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;
use uuid::Uuid;

use super::{BrokerAdapter, TransportError};
use crate::chunking::{split_into_chunks, ChunkHeaders};
use crate::messages::headers::names;
use crate::messages::{Endpoint, Envelope, Message, MessageHeaders, OutboundEnvelope};
use crate::serialization::{CipherError, PayloadCipher, SerializationError, Serializer};

/// Errors that can occur while producing.
#[derive(Debug, thiserror::Error)]
pub enum ProduceError {
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error(transparent)]
    Cipher(#[from] CipherError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Sends messages to one endpoint.
pub struct Producer {
    endpoint: Endpoint,
    adapter: Arc<dyn BrokerAdapter>,
    serializer: Arc<dyn Serializer>,
    cipher: Option<Arc<dyn PayloadCipher>>,
}

impl Producer {
    pub(crate) fn new(
        endpoint: Endpoint,
        adapter: Arc<dyn BrokerAdapter>,
        serializer: Arc<dyn Serializer>,
        cipher: Option<Arc<dyn PayloadCipher>>,
    ) -> Self {
        Self {
            endpoint,
            adapter,
            serializer,
            cipher,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Produces a message and returns its message id.
    pub async fn produce(&self, message: &dyn Message) -> Result<String, ProduceError> {
        self.produce_with_headers(message, MessageHeaders::new()).await
    }

    /// Produces the envelope's message with the envelope's headers.
    pub async fn produce_envelope(&self, envelope: &OutboundEnvelope) -> Result<String, ProduceError> {
        self.produce_with_headers(envelope.inner().as_ref(), envelope.headers().clone())
            .await
    }

    /// Produces a message with extra headers.
    ///
    /// A message id is generated unless `headers` already carries one. When
    /// the endpoint has a chunk size and the payload exceeds it, the payload
    /// goes out as several messages sharing that id.
    #[tracing::instrument(name = "producer.produce", skip_all, fields(endpoint = %self.endpoint))]
    pub async fn produce_with_headers(
        &self,
        message: &dyn Message,
        mut headers: MessageHeaders,
    ) -> Result<String, ProduceError> {
        headers.insert_if_missing(names::MESSAGE_ID, || Uuid::new_v4().to_string());
        let message_id = headers
            .get(names::MESSAGE_ID)
            .unwrap_or_default()
            .to_string();

        let mut payload = self
            .serializer
            .serialize(message, &mut headers, &self.endpoint)?;
        if let Some(cipher) = &self.cipher {
            payload = cipher.encrypt(payload, &mut headers)?;
        }

        match self.endpoint.chunk_size {
            Some(chunk_size) if chunk_size > 0 && payload.len() > chunk_size => {
                let chunks = split_into_chunks(&payload, chunk_size);
                let count = chunks.len() as u32;
                debug!(message_id = %message_id, count, "Producing chunked message");
                for (index, chunk) in chunks.into_iter().enumerate() {
                    let mut chunk_headers = headers.clone();
                    ChunkHeaders {
                        index: index as u32,
                        count,
                    }
                    .write(&mut chunk_headers);
                    self.adapter
                        .produce(&self.endpoint, chunk, &chunk_headers)
                        .await?;
                }
            }
            _ => {
                self.adapter.produce(&self.endpoint, payload, &headers).await?;
            }
        }

        debug!(message_id = %message_id, "Message produced");
        Ok(message_id)
    }

    /// Sends already serialized bytes unchanged.
    pub async fn produce_raw(&self, payload: Bytes, headers: &MessageHeaders) -> Result<(), ProduceError> {
        self.adapter.produce(&self.endpoint, payload, headers).await?;
        Ok(())
    }
}
