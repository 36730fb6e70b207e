//! In-process publishing.
//!
//! [`Publisher`] runs published messages through an ordered chain of
//! [`Behavior`]s and then dispatches them to the subscribed methods.
//! Exclusive methods are awaited one after the other; non-exclusive ones
//! run concurrently. Messages returned by handlers are published again.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{self, BoxFuture, FutureExt};
use tracing::debug;

use crate::broker::ProduceError;
use crate::components::{Component, ComponentResolver, Components};
use crate::messages::{AnyMessage, Message, MessageKind};
use crate::subscribers::{
    ArgumentsResolver, ConfigurationError, HandlerError, ReturnValue, SubscribedMethod,
    SubscribedMethodInvoker, SubscriberRegistry,
};

/// Result type for publishing.
pub type Result<T> = std::result::Result<T, PublishError>;

/// Errors that can occur while publishing.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("Subscriber '{method}' failed: {source}")]
    Handler {
        method: String,
        #[source]
        source: HandlerError,
    },

    #[error("Subscriber '{method}' panicked")]
    HandlerPanicked { method: String },

    #[error("{type_name} is not a {expected:?}")]
    WrongKind {
        type_name: &'static str,
        expected: MessageKind,
    },

    #[error("Producing to '{endpoint}' failed: {source}")]
    Produce {
        endpoint: String,
        #[source]
        source: ProduceError,
    },

    #[error("Behavior failed: {0}")]
    Behavior(HandlerError),

    #[error("Blocking publish failed: {0}")]
    Runtime(String),
}

/// How synchronous handlers are run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Inline, on the publishing thread.
    Blocking,
    /// On the blocking thread pool, awaited.
    Async,
}

// ============================================================================
// Behaviors
// ============================================================================

/// A stage wrapping dispatch.
///
/// Behaviors run in ascending [`sort_index`](Behavior::sort_index) order.
/// A behavior may transform the messages, call `next`, or short-circuit.
#[async_trait]
pub trait Behavior: Send + Sync {
    fn sort_index(&self) -> i32 {
        0
    }

    async fn handle(&self, messages: Vec<AnyMessage>, next: Next<'_>) -> Result<Vec<Component>>;
}

/// The rest of the behavior chain.
pub struct Next<'a> {
    behaviors: &'a [Arc<dyn Behavior>],
    publisher: &'a Publisher,
    mode: ExecutionMode,
}

impl<'a> Next<'a> {
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub async fn run(self, messages: Vec<AnyMessage>) -> Result<Vec<Component>> {
        match self.behaviors.split_first() {
            Some((behavior, rest)) => {
                let next = Next {
                    behaviors: rest,
                    publisher: self.publisher,
                    mode: self.mode,
                };
                behavior.handle(messages, next).await
            }
            None => self.publisher.dispatch(messages, self.mode).await,
        }
    }
}

// ============================================================================
// Publisher
// ============================================================================

/// Publishes messages to subscribed methods.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

struct PublisherInner {
    behaviors: Vec<Arc<dyn Behavior>>,
    subscribers: SubscriberRegistry,
    invoker: SubscribedMethodInvoker,
}

impl Publisher {
    pub fn builder() -> PublisherBuilder {
        PublisherBuilder::default()
    }

    pub fn subscribers(&self) -> &SubscriberRegistry {
        &self.inner.subscribers
    }

    pub async fn publish(&self, message: impl Message) -> Result<()> {
        let message: AnyMessage = Arc::new(message);
        self.publish_all(vec![message]).await.map(|_| ())
    }

    /// Publishes messages and returns the values handlers returned.
    #[tracing::instrument(name = "publisher.publish", skip_all, fields(messages = messages.len()))]
    pub async fn publish_all(&self, messages: Vec<AnyMessage>) -> Result<Vec<Component>> {
        self.execute(messages, ExecutionMode::Async).await
    }

    /// Publishes and keeps only results of type `T`.
    pub async fn publish_for<T: Any + Send + Sync>(
        &self,
        messages: Vec<AnyMessage>,
    ) -> Result<Vec<Arc<T>>> {
        Ok(typed(self.publish_all(messages).await?))
    }

    /// Publishes from synchronous code.
    ///
    /// Runs the pipeline to completion on a dedicated thread with its own
    /// runtime, so it is safe to call from inside an async context.
    /// Synchronous handlers run inline.
    pub fn publish_blocking(&self, messages: Vec<AnyMessage>) -> Result<Vec<Component>> {
        std::thread::scope(|scope| {
            scope
                .spawn(move || {
                    let runtime = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .map_err(|e| PublishError::Runtime(e.to_string()))?;
                    runtime.block_on(self.execute(messages, ExecutionMode::Blocking))
                })
                .join()
                .map_err(|_| PublishError::Runtime("publishing thread panicked".to_string()))?
        })
    }

    pub fn publish_for_blocking<T: Any + Send + Sync>(
        &self,
        messages: Vec<AnyMessage>,
    ) -> Result<Vec<Arc<T>>> {
        Ok(typed(self.publish_blocking(messages)?))
    }

    pub fn commands(&self) -> KindPublisher<'_> {
        KindPublisher::new(self, MessageKind::Command)
    }

    pub fn events(&self) -> KindPublisher<'_> {
        KindPublisher::new(self, MessageKind::Event)
    }

    pub fn queries(&self) -> KindPublisher<'_> {
        KindPublisher::new(self, MessageKind::Query)
    }

    /// Publishes a query and returns the first result of type `R`.
    pub async fn execute_query<R: Any + Send + Sync>(
        &self,
        query: impl Message,
    ) -> Result<Option<Arc<R>>> {
        let query: AnyMessage = Arc::new(query);
        let results = self.queries().publish_all(vec![query]).await?;
        Ok(typed::<R>(results).into_iter().next())
    }

    pub(crate) async fn execute(
        &self,
        messages: Vec<AnyMessage>,
        mode: ExecutionMode,
    ) -> Result<Vec<Component>> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        Next {
            behaviors: &self.inner.behaviors,
            publisher: self,
            mode,
        }
        .run(messages)
        .await
    }

    fn dispatch(
        &self,
        messages: Vec<AnyMessage>,
        mode: ExecutionMode,
    ) -> BoxFuture<'_, Result<Vec<Component>>> {
        async move {
            let invoker = &self.inner.invoker;
            let mut return_values = Vec::new();

            for method in self.inner.subscribers.exclusive() {
                return_values.extend(invoker.invoke(method, &messages, mode).await?);
            }

            let concurrent = future::try_join_all(
                self.inner
                    .subscribers
                    .non_exclusive()
                    .map(|method| invoker.invoke(method, &messages, mode)),
            )
            .await?;
            return_values.extend(concurrent.into_iter().flatten());

            self.handle_return_values(return_values, mode).await
        }
        .boxed()
    }

    /// Collects plain results and republishes returned messages.
    ///
    /// Results of the republished messages are discarded; their errors are not.
    async fn handle_return_values(
        &self,
        values: Vec<ReturnValue>,
        mode: ExecutionMode,
    ) -> Result<Vec<Component>> {
        let mut results = Vec::new();
        let mut republish = Vec::new();
        for value in values {
            match value {
                ReturnValue::None => {}
                ReturnValue::Value(value) => results.push(value),
                ReturnValue::Messages(messages) => republish.extend(messages),
            }
        }

        if !republish.is_empty() {
            debug!(messages = republish.len(), "Republishing returned messages");
            self.execute(republish, mode).await?;
        }

        Ok(results)
    }
}

fn typed<T: Any + Send + Sync>(values: Vec<Component>) -> Vec<Arc<T>> {
    values
        .into_iter()
        .filter_map(|value| match value.downcast::<T>() {
            Ok(value) => Some(value),
            Err(_) => {
                debug!(
                    expected = std::any::type_name::<T>(),
                    "Discarding result of another type"
                );
                None
            }
        })
        .collect()
}

/// Publisher restricted to one message kind.
pub struct KindPublisher<'a> {
    publisher: &'a Publisher,
    kind: MessageKind,
}

impl<'a> KindPublisher<'a> {
    fn new(publisher: &'a Publisher, kind: MessageKind) -> Self {
        Self { publisher, kind }
    }

    pub async fn publish(&self, message: impl Message) -> Result<Vec<Component>> {
        let message: AnyMessage = Arc::new(message);
        self.publish_all(vec![message]).await
    }

    /// Fails with [`PublishError::WrongKind`] before dispatching anything
    /// if a message lacks the kind.
    pub async fn publish_all(&self, messages: Vec<AnyMessage>) -> Result<Vec<Component>> {
        if let Some(message) = messages.iter().find(|m| !m.has_kind(self.kind)) {
            return Err(PublishError::WrongKind {
                type_name: message.message_type_name(),
                expected: self.kind,
            });
        }
        self.publisher.publish_all(messages).await
    }
}

/// Builder for [`Publisher`].
pub struct PublisherBuilder {
    behaviors: Vec<Arc<dyn Behavior>>,
    methods: Vec<SubscribedMethod>,
    arguments: ArgumentsResolver,
    components: Arc<dyn ComponentResolver>,
}

impl Default for PublisherBuilder {
    fn default() -> Self {
        Self {
            behaviors: Vec::new(),
            methods: Vec::new(),
            arguments: ArgumentsResolver::default(),
            components: Arc::new(Components::new()),
        }
    }
}

impl PublisherBuilder {
    pub fn behavior(mut self, behavior: impl Behavior + 'static) -> Self {
        self.behaviors.push(Arc::new(behavior));
        self
    }

    pub fn subscribe(mut self, method: SubscribedMethod) -> Self {
        self.methods.push(method);
        self
    }

    pub fn arguments(mut self, arguments: ArgumentsResolver) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn components(mut self, components: Arc<dyn ComponentResolver>) -> Self {
        self.components = components;
        self
    }

    pub fn build(mut self) -> Publisher {
        // Stable: equal indexes keep registration order.
        self.behaviors.sort_by_key(|b| b.sort_index());
        Publisher {
            inner: Arc::new(PublisherInner {
                behaviors: self.behaviors,
                subscribers: SubscriberRegistry::new(self.methods),
                invoker: SubscribedMethodInvoker::new(self.arguments, self.components),
            }),
        }
    }
}
