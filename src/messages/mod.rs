//! Message model.
//!
//! Messages are type-erased behind [`Message`] and travel through the
//! framework as [`AnyMessage`]. Subscribers select what they receive
//! with a [`MessageType`] matcher.

pub mod envelope;
pub mod headers;

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

pub use envelope::{
    Endpoint, Envelope, EnvelopeError, InboundEnvelope, OutboundEnvelope, RawEnvelope,
};
pub use headers::MessageHeaders;

/// Capability tag a message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Command,
    Event,
    Query,
    Request,
}

/// `Any` view for every `'static` type.
///
/// Supertrait of [`Message`] so that `dyn Message` can be downcast.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn type_name(&self) -> &'static str;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// A value that can be published.
pub trait Message: AsAny + Send + Sync + fmt::Debug + 'static {
    /// Capability tags of this message.
    fn kinds(&self) -> &'static [MessageKind] {
        &[]
    }

    /// `Some` when the message is an envelope wrapping another message.
    fn as_envelope(&self) -> Option<&dyn Envelope> {
        None
    }
}

/// Shared, type-erased message.
pub type AnyMessage = Arc<dyn Message>;

impl dyn Message {
    pub fn is<T: Message>(&self) -> bool {
        AsAny::as_any(self).is::<T>()
    }

    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        AsAny::as_any(self).downcast_ref::<T>()
    }

    /// Runtime type of the concrete message.
    pub fn message_type_id(&self) -> TypeId {
        Any::type_id(AsAny::as_any(self))
    }

    pub fn message_type_name(&self) -> &'static str {
        AsAny::type_name(self)
    }

    pub fn has_kind(&self, kind: MessageKind) -> bool {
        self.kinds().contains(&kind)
    }
}

/// Selects the messages a subscriber accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Exactly one concrete type.
    Exact { id: TypeId, name: &'static str },
    /// Any message tagged with the given kind.
    Kind(MessageKind),
    /// Any envelope, without unwrapping.
    Envelope,
    /// Every message.
    Any,
}

impl MessageType {
    pub fn of<T: Message>() -> Self {
        Self::Exact {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn matches(&self, message: &dyn Message) -> bool {
        match self {
            Self::Exact { id, .. } => message.message_type_id() == *id,
            Self::Kind(kind) => message.has_kind(*kind),
            Self::Envelope => message.as_envelope().is_some(),
            Self::Any => true,
        }
    }

    /// Whether a subscriber declaring this type wants envelopes as-is.
    pub fn is_envelope(&self) -> bool {
        match self {
            Self::Envelope => true,
            Self::Exact { id, .. } => {
                *id == TypeId::of::<InboundEnvelope>() || *id == TypeId::of::<OutboundEnvelope>()
            }
            _ => false,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact { name, .. } => write!(f, "{name}"),
            Self::Kind(kind) => write!(f, "{kind:?}"),
            Self::Envelope => write!(f, "Envelope"),
            Self::Any => write!(f, "Any"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{OrderCreated, PlaceOrder};

    #[test]
    fn test_downcast_through_arc() {
        let message: AnyMessage = Arc::new(OrderCreated { id: 7 });

        assert!(message.is::<OrderCreated>());
        assert_eq!(message.downcast_ref::<OrderCreated>().map(|m| m.id), Some(7));
        assert!(message.downcast_ref::<PlaceOrder>().is_none());
        assert_eq!(message.message_type_id(), TypeId::of::<OrderCreated>());
    }

    #[test]
    fn test_matches_by_kind() {
        let event: AnyMessage = Arc::new(OrderCreated { id: 1 });
        let command: AnyMessage = Arc::new(PlaceOrder { id: 1 });

        let events = MessageType::Kind(MessageKind::Event);
        assert!(events.matches(event.as_ref()));
        assert!(!events.matches(command.as_ref()));
        assert!(MessageType::Any.matches(command.as_ref()));
        assert!(!MessageType::Envelope.matches(command.as_ref()));
    }

    #[test]
    fn test_envelope_types_are_detected() {
        assert!(MessageType::Envelope.is_envelope());
        assert!(MessageType::of::<InboundEnvelope>().is_envelope());
        assert!(!MessageType::of::<OrderCreated>().is_envelope());
    }
}
