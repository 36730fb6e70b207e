//! Envelopes wrap a message with headers and the endpoint it travels on.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::headers::{names, MessageHeaders};
use super::{AnyMessage, Message, MessageKind};

/// Envelope construction errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("Inbound message on '{endpoint}' has no {} header", names::MESSAGE_ID)]
    MissingMessageId { endpoint: String },
}

/// A named broker destination or source.
///
/// Compared by value: two endpoints with the same name and settings are
/// the same endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoint {
    pub name: String,
    /// Payloads larger than this are split into chunks when produced.
    pub chunk_size: Option<usize>,
    /// Transport-specific settings.
    pub settings: BTreeMap<String, String>,
}

impl Endpoint {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Common view over inbound and outbound envelopes.
pub trait Envelope: Send + Sync {
    fn headers(&self) -> &MessageHeaders;
    fn endpoint(&self) -> &Endpoint;
    /// The wrapped message, if it has been deserialized.
    fn message(&self) -> Option<&AnyMessage>;
    /// Whether subscribers that do not ask for envelopes receive the inner message.
    fn auto_unwrap(&self) -> bool;
}

/// Bytes received from a broker, before deserialization.
#[derive(Debug, Clone)]
pub struct RawEnvelope {
    payload: Bytes,
    headers: MessageHeaders,
    endpoint: Endpoint,
    offset: Option<String>,
    message_id: String,
}

impl RawEnvelope {
    /// Fails if the headers carry no message id.
    pub fn new(
        payload: Bytes,
        headers: MessageHeaders,
        endpoint: Endpoint,
        offset: Option<String>,
    ) -> Result<Self, EnvelopeError> {
        let message_id = headers
            .get(names::MESSAGE_ID)
            .map(str::to_string)
            .ok_or_else(|| EnvelopeError::MissingMessageId {
                endpoint: endpoint.name.clone(),
            })?;
        Ok(Self {
            payload,
            headers,
            endpoint,
            offset,
            message_id,
        })
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn set_payload(&mut self, payload: Bytes) {
        self.payload = payload;
    }

    pub fn headers(&self) -> &MessageHeaders {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut MessageHeaders {
        &mut self.headers
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Transport position, used to acknowledge the message.
    pub fn offset(&self) -> Option<&str> {
        self.offset.as_deref()
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }
}

/// A consumed message on its way to subscribers.
#[derive(Debug, Clone)]
pub struct InboundEnvelope {
    raw: RawEnvelope,
    message: Option<AnyMessage>,
    auto_unwrap: bool,
}

impl InboundEnvelope {
    pub fn new(raw: RawEnvelope, message: Option<AnyMessage>) -> Self {
        Self {
            raw,
            message,
            auto_unwrap: true,
        }
    }

    pub fn with_auto_unwrap(mut self, auto_unwrap: bool) -> Self {
        self.auto_unwrap = auto_unwrap;
        self
    }

    pub fn raw(&self) -> &RawEnvelope {
        &self.raw
    }

    pub fn message_id(&self) -> &str {
        self.raw.message_id()
    }

    /// Typed access to the wrapped message.
    pub fn message_as<T: Message>(&self) -> Option<&T> {
        self.message.as_deref().and_then(|m| m.downcast_ref::<T>())
    }
}

impl Envelope for InboundEnvelope {
    fn headers(&self) -> &MessageHeaders {
        self.raw.headers()
    }

    fn endpoint(&self) -> &Endpoint {
        self.raw.endpoint()
    }

    fn message(&self) -> Option<&AnyMessage> {
        self.message.as_ref()
    }

    fn auto_unwrap(&self) -> bool {
        self.auto_unwrap
    }
}

impl Message for InboundEnvelope {
    fn as_envelope(&self) -> Option<&dyn Envelope> {
        Some(self)
    }
}

/// A message addressed to a broker endpoint.
#[derive(Debug, Clone)]
pub struct OutboundEnvelope {
    message: AnyMessage,
    headers: MessageHeaders,
    endpoint: Endpoint,
    auto_unwrap: bool,
}

impl OutboundEnvelope {
    pub fn new(message: AnyMessage, endpoint: Endpoint) -> Self {
        Self {
            message,
            headers: MessageHeaders::new(),
            endpoint,
            auto_unwrap: true,
        }
    }

    pub fn with_headers(mut self, headers: MessageHeaders) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_auto_unwrap(mut self, auto_unwrap: bool) -> Self {
        self.auto_unwrap = auto_unwrap;
        self
    }

    pub fn inner(&self) -> &AnyMessage {
        &self.message
    }
}

impl Envelope for OutboundEnvelope {
    fn headers(&self) -> &MessageHeaders {
        &self.headers
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn message(&self) -> Option<&AnyMessage> {
        Some(&self.message)
    }

    fn auto_unwrap(&self) -> bool {
        self.auto_unwrap
    }
}

impl Message for OutboundEnvelope {
    fn kinds(&self) -> &'static [MessageKind] {
        self.message.kinds()
    }

    fn as_envelope(&self) -> Option<&dyn Envelope> {
        Some(self)
    }
}
