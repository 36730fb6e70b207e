//! Outbound routing: a publisher behavior forwarding messages to broker endpoints.
//!
//! While a consumer dispatches an inbound batch, produces go through the
//! batch's [`Outbox`] and happen on commit.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::debug;

use super::{Broker, Outbox};
use crate::components::Component;
use crate::messages::{AnyMessage, Endpoint, Envelope, MessageType, OutboundEnvelope};
use crate::publishing::{Behavior, Next, PublishError, Result};

/// Runs after application behaviors with the default sort index.
pub const OUTBOUND_ROUTER_SORT_INDEX: i32 = 300;

/// Messages matching `message_type` are produced to `endpoint`.
#[derive(Debug, Clone)]
pub struct OutboundRoute {
    pub message_type: MessageType,
    pub endpoint: Endpoint,
    /// Also dispatch the message to local subscribers.
    pub publish_locally: bool,
}

/// Produces routed messages through the broker's producers.
///
/// Published [`OutboundEnvelope`]s go to their own endpoint. Inbound
/// envelopes are never routed back out.
pub struct OutboundRouter {
    broker: Weak<Broker>,
    routes: Vec<OutboundRoute>,
}

impl OutboundRouter {
    pub fn new(broker: &Arc<Broker>) -> Self {
        Self {
            broker: Arc::downgrade(broker),
            routes: Vec::new(),
        }
    }

    /// Routes matching messages to `endpoint` instead of local subscribers.
    pub fn route(self, message_type: MessageType, endpoint: Endpoint) -> Self {
        self.with_route(OutboundRoute {
            message_type,
            endpoint,
            publish_locally: false,
        })
    }

    /// Routes matching messages to `endpoint` and still dispatches them locally.
    pub fn route_and_publish(self, message_type: MessageType, endpoint: Endpoint) -> Self {
        self.with_route(OutboundRoute {
            message_type,
            endpoint,
            publish_locally: true,
        })
    }

    pub fn with_route(mut self, route: OutboundRoute) -> Self {
        self.routes.push(route);
        self
    }

    pub fn routes(&self) -> &[OutboundRoute] {
        &self.routes
    }

    fn broker(&self) -> Result<Arc<Broker>> {
        self.broker
            .upgrade()
            .ok_or_else(|| PublishError::Behavior("broker has been dropped".into()))
    }

    /// Produces now, or queues in the current outbox when there is one.
    async fn send(&self, envelope: OutboundEnvelope) -> Result<()> {
        let endpoint = envelope.endpoint().clone();
        let producer = self.broker()?.get_producer(&endpoint);
        if let Some(outbox) = Outbox::current() {
            outbox.add(producer, envelope).await;
            return Ok(());
        }
        producer
            .produce_envelope(&envelope)
            .await
            .map_err(|source| PublishError::Produce {
                endpoint: endpoint.name.clone(),
                source,
            })?;
        Ok(())
    }
}

#[async_trait]
impl Behavior for OutboundRouter {
    fn sort_index(&self) -> i32 {
        OUTBOUND_ROUTER_SORT_INDEX
    }

    async fn handle(&self, messages: Vec<AnyMessage>, next: Next<'_>) -> Result<Vec<Component>> {
        let mut local = Vec::with_capacity(messages.len());

        for message in messages {
            if let Some(envelope) = message.downcast_ref::<OutboundEnvelope>() {
                self.send(envelope.clone()).await?;
                continue;
            }
            if message.as_envelope().is_some() {
                local.push(message);
                continue;
            }

            let routes: Vec<&OutboundRoute> = self
                .routes
                .iter()
                .filter(|route| route.message_type.matches(message.as_ref()))
                .collect();
            if routes.is_empty() {
                local.push(message);
                continue;
            }

            for route in &routes {
                self.send(OutboundEnvelope::new(message.clone(), route.endpoint.clone()))
                    .await?;
                debug!(
                    message_type = message.message_type_name(),
                    endpoint = %route.endpoint,
                    "Message routed to broker"
                );
            }
            if routes.iter().any(|route| route.publish_locally) {
                local.push(message);
            }
        }

        if local.is_empty() {
            return Ok(Vec::new());
        }
        next.run(local).await
    }
}
