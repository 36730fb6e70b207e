//! Argument resolution for subscribed methods.
//!
//! The message parameter decides how matching messages are handed to a
//! handler (one call per message, or one call with all of them). Additional
//! parameters are filled per invocation, typically from a
//! [`ComponentResolver`]. Resolvers are tried in reverse registration
//! order, so later registrations override the built-ins.

use std::sync::Arc;

use crate::components::{Component, ComponentResolver};
use crate::messages::{AnyMessage, MessageType};

use super::{Parameter, SubscribedMethod};

/// Invalid subscriber configuration, detected at dispatch.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("No resolver for parameter '{parameter}' of subscriber '{method}'")]
    NoResolver { method: String, parameter: String },

    #[error("Component {component} for subscriber '{method}' is not registered")]
    UnresolvedTarget {
        method: String,
        component: &'static str,
    },
}

/// How messages are passed to one handler invocation.
#[derive(Debug, Clone)]
pub enum MessageArgument {
    Single(AnyMessage),
    Batch(Vec<AnyMessage>),
}

/// Maps the messages of a dispatch onto handler invocations.
pub trait MessageArgumentResolver: Send + Sync {
    fn can_resolve(&self, parameter: &Parameter) -> bool;

    /// Type of messages the parameter accepts.
    fn message_type(&self, parameter: &Parameter) -> MessageType;

    /// One entry per handler invocation.
    fn arguments(&self, messages: Vec<AnyMessage>) -> Vec<MessageArgument>;
}

/// Fallback resolver: any message-shaped parameter, one invocation per message.
pub struct SingleMessageArgumentResolver;

impl MessageArgumentResolver for SingleMessageArgumentResolver {
    fn can_resolve(&self, parameter: &Parameter) -> bool {
        matches!(parameter, Parameter::Message(_) | Parameter::Messages(_))
    }

    fn message_type(&self, parameter: &Parameter) -> MessageType {
        match parameter {
            Parameter::Message(t) | Parameter::Messages(t) => *t,
            _ => MessageType::Any,
        }
    }

    fn arguments(&self, messages: Vec<AnyMessage>) -> Vec<MessageArgument> {
        messages.into_iter().map(MessageArgument::Single).collect()
    }
}

/// Sequence parameters: one invocation with every matching message.
pub struct EnumerableMessageArgumentResolver;

impl MessageArgumentResolver for EnumerableMessageArgumentResolver {
    fn can_resolve(&self, parameter: &Parameter) -> bool {
        matches!(parameter, Parameter::Messages(_))
    }

    fn message_type(&self, parameter: &Parameter) -> MessageType {
        match parameter {
            Parameter::Messages(t) => *t,
            _ => MessageType::Any,
        }
    }

    fn arguments(&self, messages: Vec<AnyMessage>) -> Vec<MessageArgument> {
        vec![MessageArgument::Batch(messages)]
    }
}

/// Fills a non-message parameter.
pub trait AdditionalArgumentResolver: Send + Sync {
    fn can_resolve(&self, parameter: &Parameter) -> bool;

    fn value(&self, parameter: &Parameter, components: &dyn ComponentResolver) -> Option<Component>;
}

/// Resolves [`Parameter::Service`] from the component resolver.
pub struct ServiceArgumentResolver;

impl AdditionalArgumentResolver for ServiceArgumentResolver {
    fn can_resolve(&self, parameter: &Parameter) -> bool {
        matches!(parameter, Parameter::Service { .. })
    }

    fn value(&self, parameter: &Parameter, components: &dyn ComponentResolver) -> Option<Component> {
        match parameter {
            Parameter::Service { type_id, .. } => components.resolve_component(*type_id),
            _ => None,
        }
    }
}

/// Ordered set of argument resolvers.
#[derive(Clone)]
pub struct ArgumentsResolver {
    message_resolvers: Vec<Arc<dyn MessageArgumentResolver>>,
    additional_resolvers: Vec<Arc<dyn AdditionalArgumentResolver>>,
}

impl Default for ArgumentsResolver {
    fn default() -> Self {
        Self::empty()
            .with_message_resolver(SingleMessageArgumentResolver)
            .with_message_resolver(EnumerableMessageArgumentResolver)
            .with_additional_resolver(ServiceArgumentResolver)
    }
}

impl ArgumentsResolver {
    /// A resolver set without the built-ins.
    pub fn empty() -> Self {
        Self {
            message_resolvers: Vec::new(),
            additional_resolvers: Vec::new(),
        }
    }

    pub fn with_message_resolver(mut self, resolver: impl MessageArgumentResolver + 'static) -> Self {
        self.message_resolvers.push(Arc::new(resolver));
        self
    }

    pub fn with_additional_resolver(
        mut self,
        resolver: impl AdditionalArgumentResolver + 'static,
    ) -> Self {
        self.additional_resolvers.push(Arc::new(resolver));
        self
    }

    /// The resolver for the method's message parameter and the type it accepts.
    pub fn message_resolver(
        &self,
        method: &SubscribedMethod,
    ) -> Result<(&dyn MessageArgumentResolver, MessageType), ConfigurationError> {
        let parameter = method.message_parameter();
        self.message_resolvers
            .iter()
            .rev()
            .find(|r| r.can_resolve(parameter))
            .map(|r| (r.as_ref(), r.message_type(parameter)))
            .ok_or_else(|| ConfigurationError::NoResolver {
                method: method.name().to_string(),
                parameter: parameter.to_string(),
            })
    }

    /// Values for the method's additional parameters, in declaration order.
    pub fn additional_arguments(
        &self,
        method: &SubscribedMethod,
        components: &dyn ComponentResolver,
    ) -> Result<Vec<Option<Component>>, ConfigurationError> {
        method
            .additional_parameters()
            .iter()
            .map(|parameter| {
                self.additional_resolvers
                    .iter()
                    .rev()
                    .find(|r| r.can_resolve(parameter))
                    .map(|r| r.value(parameter, components))
                    .ok_or_else(|| ConfigurationError::NoResolver {
                        method: method.name().to_string(),
                        parameter: parameter.to_string(),
                    })
            })
            .collect()
    }
}
