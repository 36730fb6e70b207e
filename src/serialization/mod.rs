//! Message serialization.
//!
//! Producers turn messages into bytes with a [`Serializer`] before handing
//! them to the transport; the inbound pipeline reverses it. Payloads can
//! additionally pass through a [`PayloadCipher`].

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::messages::headers::names;
use crate::messages::{AnyMessage, Endpoint, Message, MessageHeaders};

/// Errors that can occur during (de)serialization.
#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    #[error("Message type {0} is not registered")]
    UnknownType(String),

    #[error("Missing {} header", names::MESSAGE_TYPE)]
    MissingTypeHeader,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Converts messages to and from bytes.
pub trait Serializer: Send + Sync {
    /// Serializes a message, recording whatever is needed to read it back in `headers`.
    fn serialize(
        &self,
        message: &dyn Message,
        headers: &mut MessageHeaders,
        endpoint: &Endpoint,
    ) -> Result<Bytes, SerializationError>;

    fn deserialize(
        &self,
        payload: &[u8],
        headers: &MessageHeaders,
        endpoint: &Endpoint,
    ) -> Result<AnyMessage, SerializationError>;
}

type Encode = fn(&dyn Message) -> Result<Vec<u8>, SerializationError>;
type Decode = fn(&[u8]) -> Result<AnyMessage, SerializationError>;

#[derive(Clone, Copy)]
struct Codec {
    encode: Encode,
    decode: Decode,
}

/// Maps message types to wire names.
#[derive(Clone, Default)]
pub struct MessageTypeRegistry {
    by_name: HashMap<String, Codec>,
    names: HashMap<TypeId, String>,
}

impl MessageTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` under `name`, written to the message type header.
    pub fn register<T>(&mut self, name: impl Into<String>) -> &mut Self
    where
        T: Message + Serialize + DeserializeOwned,
    {
        let name = name.into();
        self.by_name.insert(
            name.clone(),
            Codec {
                encode: encode::<T>,
                decode: decode::<T>,
            },
        );
        self.names.insert(TypeId::of::<T>(), name);
        self
    }

    pub fn name_of(&self, message: &dyn Message) -> Option<&str> {
        self.names.get(&message.message_type_id()).map(String::as_str)
    }
}

fn encode<T: Message + Serialize>(message: &dyn Message) -> Result<Vec<u8>, SerializationError> {
    let message = message
        .downcast_ref::<T>()
        .ok_or_else(|| SerializationError::UnknownType(message.message_type_name().to_string()))?;
    Ok(serde_json::to_vec(message)?)
}

fn decode<T: Message + DeserializeOwned>(payload: &[u8]) -> Result<AnyMessage, SerializationError> {
    let message: T = serde_json::from_slice(payload)?;
    Ok(Arc::new(message))
}

/// JSON serializer writing the registered type name to `x-message-type`.
#[derive(Clone)]
pub struct JsonSerializer {
    registry: Arc<MessageTypeRegistry>,
}

impl JsonSerializer {
    pub fn new(registry: MessageTypeRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }
}

impl Serializer for JsonSerializer {
    fn serialize(
        &self,
        message: &dyn Message,
        headers: &mut MessageHeaders,
        _endpoint: &Endpoint,
    ) -> Result<Bytes, SerializationError> {
        let name = self
            .registry
            .name_of(message)
            .ok_or_else(|| SerializationError::UnknownType(message.message_type_name().to_string()))?;
        let codec = self
            .registry
            .by_name
            .get(name)
            .ok_or_else(|| SerializationError::UnknownType(name.to_string()))?;
        let payload = (codec.encode)(message)?;
        headers.insert(names::MESSAGE_TYPE, name);
        Ok(Bytes::from(payload))
    }

    fn deserialize(
        &self,
        payload: &[u8],
        headers: &MessageHeaders,
        _endpoint: &Endpoint,
    ) -> Result<AnyMessage, SerializationError> {
        let name = headers
            .get(names::MESSAGE_TYPE)
            .ok_or(SerializationError::MissingTypeHeader)?;
        let codec = self
            .registry
            .by_name
            .get(name)
            .ok_or_else(|| SerializationError::UnknownType(name.to_string()))?;
        (codec.decode)(payload)
    }
}

/// Cipher failure.
#[derive(Debug, thiserror::Error)]
#[error("Cipher error: {0}")]
pub struct CipherError(pub String);

/// Optional payload encryption applied after serialization.
pub trait PayloadCipher: Send + Sync {
    fn encrypt(&self, payload: Bytes, headers: &mut MessageHeaders) -> Result<Bytes, CipherError>;

    fn decrypt(&self, payload: Bytes, headers: &MessageHeaders) -> Result<Bytes, CipherError>;
}
