//! Subscribed methods and their registry.
//!
//! A [`SubscribedMethod`] binds a handler to the message type it accepts,
//! plus any extra parameters resolved at dispatch time. Methods are
//! collected into an immutable [`SubscriberRegistry`] when the publisher
//! is built.

pub mod arguments;
pub mod invoker;

use std::any::{Any, TypeId};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};

pub use arguments::{
    AdditionalArgumentResolver, ArgumentsResolver, ConfigurationError,
    EnumerableMessageArgumentResolver, MessageArgument, MessageArgumentResolver,
    ServiceArgumentResolver, SingleMessageArgumentResolver,
};
pub use invoker::SubscribedMethodInvoker;

use crate::components::Component;
use crate::messages::{AnyMessage, Message, MessageType};

/// Error returned by a handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result returned by a handler.
pub type HandlerResult = std::result::Result<ReturnValue, HandlerError>;

// ============================================================================
// Handler surface
// ============================================================================

/// What a handler produced.
///
/// Returned messages are published again through the pipeline.
pub enum ReturnValue {
    None,
    Value(Component),
    Messages(Vec<AnyMessage>),
}

impl ReturnValue {
    pub fn value<T: Any + Send + Sync>(value: T) -> Self {
        Self::Value(Arc::new(value))
    }

    pub fn message<M: Message>(message: M) -> Self {
        Self::Messages(vec![Arc::new(message)])
    }

    pub fn messages(messages: impl IntoIterator<Item = AnyMessage>) -> Self {
        Self::Messages(messages.into_iter().collect())
    }
}

impl fmt::Debug for ReturnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Value(_) => write!(f, "Value(..)"),
            Self::Messages(messages) => f.debug_tuple("Messages").field(messages).finish(),
        }
    }
}

/// Arguments of one handler invocation.
pub struct HandlerContext {
    message: MessageArgument,
    arguments: Vec<Option<Component>>,
    target: Option<Component>,
}

impl HandlerContext {
    pub(crate) fn new(
        message: MessageArgument,
        arguments: Vec<Option<Component>>,
        target: Option<Component>,
    ) -> Self {
        Self {
            message,
            arguments,
            target,
        }
    }

    /// The message, for single-message subscribers.
    pub fn message(&self) -> Option<&AnyMessage> {
        match &self.message {
            MessageArgument::Single(message) => Some(message),
            MessageArgument::Batch(_) => None,
        }
    }

    pub fn message_as<T: Message>(&self) -> Option<&T> {
        self.message().and_then(|m| m.downcast_ref::<T>())
    }

    /// All messages of this invocation. A single message yields a one-element slice.
    pub fn messages(&self) -> &[AnyMessage] {
        match &self.message {
            MessageArgument::Single(message) => std::slice::from_ref(message),
            MessageArgument::Batch(messages) => messages,
        }
    }

    pub fn messages_as<T: Message>(&self) -> Vec<&T> {
        self.messages()
            .iter()
            .filter_map(|m| m.downcast_ref::<T>())
            .collect()
    }

    /// Additional argument at `index`, in declaration order. `None` when
    /// the resolver could not provide it.
    pub fn argument<T: Any + Send + Sync>(&self, index: usize) -> Option<Arc<T>> {
        self.arguments
            .get(index)
            .cloned()
            .flatten()
            .and_then(|a| a.downcast::<T>().ok())
    }

    /// The component this method is declared on.
    pub fn target<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.target.clone().and_then(|t| t.downcast::<T>().ok())
    }
}

type AsyncHandler = Arc<dyn Fn(HandlerContext) -> BoxFuture<'static, HandlerResult> + Send + Sync>;
type BlockingHandler = Arc<dyn Fn(HandlerContext) -> HandlerResult + Send + Sync>;

#[derive(Clone)]
pub(crate) enum Handler {
    Async(AsyncHandler),
    Blocking(BlockingHandler),
}

/// Predicate deciding whether a subscriber sees a message.
pub trait MessageFilter: Send + Sync {
    fn must_process(&self, message: &dyn Message) -> bool;
}

impl<F> MessageFilter for F
where
    F: Fn(&dyn Message) -> bool + Send + Sync,
{
    fn must_process(&self, message: &dyn Message) -> bool {
        self(message)
    }
}

// ============================================================================
// Parameters
// ============================================================================

/// A handler parameter, resolved per invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parameter {
    /// One message per invocation.
    Message(MessageType),
    /// All matching messages in one invocation.
    Messages(MessageType),
    /// A component looked up by type.
    Service { type_id: TypeId, name: &'static str },
    /// Understood only by a custom resolver.
    Custom(&'static str),
}

impl Parameter {
    pub fn service<T: Any>() -> Self {
        Self::Service {
            type_id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Message(t) => write!(f, "{t}"),
            Self::Messages(t) => write!(f, "[{t}]"),
            Self::Service { name, .. } => write!(f, "service {name}"),
            Self::Custom(name) => write!(f, "custom {name}"),
        }
    }
}

// ============================================================================
// Subscribed methods
// ============================================================================

/// A handler bound to the messages it subscribes to.
#[derive(Clone)]
pub struct SubscribedMethod {
    name: String,
    handler: Handler,
    message_parameter: Parameter,
    additional_parameters: Vec<Parameter>,
    target: Option<(TypeId, &'static str)>,
    exclusive: bool,
    parallel: bool,
    max_degree_of_parallelism: Option<usize>,
    filters: Vec<Arc<dyn MessageFilter>>,
}

impl SubscribedMethod {
    pub fn builder(name: impl Into<String>) -> SubscribedMethodBuilder {
        SubscribedMethodBuilder {
            name: name.into(),
            message_parameter: Parameter::Message(MessageType::Any),
            additional_parameters: Vec::new(),
            target: None,
            exclusive: true,
            parallel: false,
            max_degree_of_parallelism: None,
            filters: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message_parameter(&self) -> &Parameter {
        &self.message_parameter
    }

    pub fn additional_parameters(&self) -> &[Parameter] {
        &self.additional_parameters
    }

    /// Exclusive methods run one after the other; the rest run concurrently.
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    pub fn max_degree_of_parallelism(&self) -> Option<usize> {
        self.max_degree_of_parallelism
    }

    pub(crate) fn handler(&self) -> &Handler {
        &self.handler
    }

    pub(crate) fn target_type(&self) -> Option<(TypeId, &'static str)> {
        self.target
    }

    pub(crate) fn accepts(&self, message: &dyn Message) -> bool {
        self.filters.iter().all(|f| f.must_process(message))
    }
}

impl fmt::Debug for SubscribedMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribedMethod")
            .field("name", &self.name)
            .field("message_parameter", &self.message_parameter)
            .field("exclusive", &self.exclusive)
            .field("parallel", &self.parallel)
            .finish_non_exhaustive()
    }
}

/// Builder for [`SubscribedMethod`].
pub struct SubscribedMethodBuilder {
    name: String,
    message_parameter: Parameter,
    additional_parameters: Vec<Parameter>,
    target: Option<(TypeId, &'static str)>,
    exclusive: bool,
    parallel: bool,
    max_degree_of_parallelism: Option<usize>,
    filters: Vec<Arc<dyn MessageFilter>>,
}

impl SubscribedMethodBuilder {
    /// Subscribes to single messages of type `T`.
    pub fn message<T: Message>(self) -> Self {
        self.parameter(Parameter::Message(MessageType::of::<T>()))
    }

    /// Subscribes to all matching messages of a publish call at once.
    pub fn batch(self, message_type: MessageType) -> Self {
        self.parameter(Parameter::Messages(message_type))
    }

    pub fn parameter(mut self, parameter: Parameter) -> Self {
        self.message_parameter = parameter;
        self
    }

    /// Appends an additional parameter, exposed as [`HandlerContext::argument`].
    pub fn argument(mut self, parameter: Parameter) -> Self {
        self.additional_parameters.push(parameter);
        self
    }

    /// Declares the method on component `T`, resolved at dispatch time.
    pub fn on_component<T: Any>(mut self) -> Self {
        self.target = Some((TypeId::of::<T>(), std::any::type_name::<T>()));
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    /// Invokes the handler concurrently per message, up to
    /// `max_degree_of_parallelism` at once (unbounded when `None`).
    pub fn parallel(mut self, max_degree_of_parallelism: Option<usize>) -> Self {
        self.parallel = true;
        self.max_degree_of_parallelism = max_degree_of_parallelism;
        self
    }

    pub fn filter(mut self, filter: impl MessageFilter + 'static) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    pub fn handle<F, Fut>(self, handler: F) -> SubscribedMethod
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.build(Handler::Async(Arc::new(move |ctx| handler(ctx).boxed())))
    }

    /// Synchronous handler. Runs on the blocking pool when dispatched asynchronously.
    pub fn handle_blocking<F>(self, handler: F) -> SubscribedMethod
    where
        F: Fn(HandlerContext) -> HandlerResult + Send + Sync + 'static,
    {
        self.build(Handler::Blocking(Arc::new(handler)))
    }

    fn build(self, handler: Handler) -> SubscribedMethod {
        SubscribedMethod {
            name: self.name,
            handler,
            message_parameter: self.message_parameter,
            additional_parameters: self.additional_parameters,
            target: self.target,
            exclusive: self.exclusive,
            parallel: self.parallel,
            max_degree_of_parallelism: self.max_degree_of_parallelism,
            filters: self.filters,
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Immutable set of subscribed methods.
#[derive(Clone, Default)]
pub struct SubscriberRegistry {
    methods: Arc<Vec<SubscribedMethod>>,
}

impl SubscriberRegistry {
    pub fn new(methods: Vec<SubscribedMethod>) -> Self {
        Self {
            methods: Arc::new(methods),
        }
    }

    pub fn methods(&self) -> &[SubscribedMethod] {
        &self.methods
    }

    pub fn exclusive(&self) -> impl Iterator<Item = &SubscribedMethod> {
        self.methods.iter().filter(|m| m.exclusive)
    }

    pub fn non_exclusive(&self) -> impl Iterator<Item = &SubscribedMethod> {
        self.methods.iter().filter(|m| !m.exclusive)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}
