//! Invocation of a single subscribed method.

use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::debug;

use crate::components::ComponentResolver;
use crate::messages::{AnyMessage, MessageType};
use crate::publishing::{ExecutionMode, PublishError};

use super::arguments::{ArgumentsResolver, ConfigurationError};
use super::{Handler, HandlerContext, ReturnValue, SubscribedMethod};

/// Calls subscribed methods with resolved arguments.
#[derive(Clone)]
pub struct SubscribedMethodInvoker {
    arguments: ArgumentsResolver,
    components: Arc<dyn ComponentResolver>,
}

impl SubscribedMethodInvoker {
    pub fn new(arguments: ArgumentsResolver, components: Arc<dyn ComponentResolver>) -> Self {
        Self {
            arguments,
            components,
        }
    }

    /// Invokes `method` with the messages it accepts.
    ///
    /// Returns the non-empty return values. Nothing is called when no
    /// message matches.
    pub async fn invoke(
        &self,
        method: &SubscribedMethod,
        messages: &[AnyMessage],
        mode: ExecutionMode,
    ) -> Result<Vec<ReturnValue>, PublishError> {
        let (resolver, message_type) = self.arguments.message_resolver(method)?;

        let selected = select_messages(method, message_type, messages);
        if selected.is_empty() {
            return Ok(Vec::new());
        }

        let target = match method.target_type() {
            Some((type_id, component)) => Some(
                self.components
                    .resolve_component(type_id)
                    .ok_or_else(|| ConfigurationError::UnresolvedTarget {
                        method: method.name().to_string(),
                        component,
                    })?,
            ),
            None => None,
        };
        let arguments = self
            .arguments
            .additional_arguments(method, self.components.as_ref())?;

        let contexts: Vec<HandlerContext> = resolver
            .arguments(selected)
            .into_iter()
            .map(|message| HandlerContext::new(message, arguments.clone(), target.clone()))
            .collect();

        debug!(
            method = %method.name(),
            invocations = contexts.len(),
            parallel = method.is_parallel(),
            "Invoking subscriber"
        );

        let results: Vec<ReturnValue> = if method.is_parallel() && contexts.len() > 1 {
            let limit = method
                .max_degree_of_parallelism()
                .unwrap_or(contexts.len())
                .max(1);
            stream::iter(contexts)
                .map(|ctx| call(method, ctx, mode))
                .buffered(limit)
                .try_collect()
                .await?
        } else {
            let mut results = Vec::with_capacity(contexts.len());
            for ctx in contexts {
                results.push(call(method, ctx, mode).await?);
            }
            results
        };

        Ok(results
            .into_iter()
            .filter(|r| !matches!(r, ReturnValue::None))
            .collect())
    }
}

async fn call(
    method: &SubscribedMethod,
    ctx: HandlerContext,
    mode: ExecutionMode,
) -> Result<ReturnValue, PublishError> {
    let result = match (method.handler(), mode) {
        (Handler::Async(handler), _) => handler(ctx).await,
        (Handler::Blocking(handler), ExecutionMode::Blocking) => handler(ctx),
        (Handler::Blocking(handler), ExecutionMode::Async) => {
            let handler = Arc::clone(handler);
            tokio::task::spawn_blocking(move || handler(ctx))
                .await
                .map_err(|_| PublishError::HandlerPanicked {
                    method: method.name().to_string(),
                })?
        }
    };
    result.map_err(|source| PublishError::Handler {
        method: method.name().to_string(),
        source,
    })
}

/// Applies filters, unwraps envelopes and keeps what the method accepts.
fn select_messages(
    method: &SubscribedMethod,
    message_type: MessageType,
    messages: &[AnyMessage],
) -> Vec<AnyMessage> {
    let keep_envelopes = message_type.is_envelope();
    messages
        .iter()
        .filter(|m| method.accepts(m.as_ref()))
        .filter_map(|m| unwrap(m, keep_envelopes))
        .filter(|m| message_type.matches(m.as_ref()))
        .collect()
}

fn unwrap(message: &AnyMessage, keep_envelopes: bool) -> Option<AnyMessage> {
    match message.as_envelope() {
        Some(_) if keep_envelopes => Some(message.clone()),
        Some(envelope) if envelope.auto_unwrap() => envelope.message().cloned(),
        Some(_) => None,
        None => Some(message.clone()),
    }
}
