//! Test utilities and mock implementations.
//!
//! Sample messages plus mock transactional resources for unit tests that
//! need neither a broker nor a database.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::messages::{Message, MessageKind};
use crate::serialization::{JsonSerializer, MessageTypeRegistry};
use crate::storage::{Result as StoreResult, StoreError};
use crate::transaction::Transactional;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCreated {
    pub id: u32,
}

impl Message for OrderCreated {
    fn kinds(&self) -> &'static [MessageKind] {
        &[MessageKind::Event]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderShipped {
    pub id: u32,
}

impl Message for OrderShipped {
    fn kinds(&self) -> &'static [MessageKind] {
        &[MessageKind::Event]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceOrder {
    pub id: u32,
}

impl Message for PlaceOrder {
    fn kinds(&self) -> &'static [MessageKind] {
        &[MessageKind::Command]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetOrder {
    pub id: u32,
}

impl Message for GetOrder {
    fn kinds(&self) -> &'static [MessageKind] {
        &[MessageKind::Query]
    }
}

/// JSON serializer knowing every sample message.
pub fn json_serializer() -> JsonSerializer {
    let mut registry = MessageTypeRegistry::new();
    registry.register::<OrderCreated>("OrderCreated");
    registry.register::<OrderShipped>("OrderShipped");
    registry.register::<PlaceOrder>("PlaceOrder");
    registry.register::<GetOrder>("GetOrder");
    JsonSerializer::new(registry)
}

/// Transactional resource recording commit/rollback calls into a shared journal.
pub struct MockResource {
    name: String,
    journal: Arc<RwLock<Vec<String>>>,
    fail_on_commit: RwLock<bool>,
}

impl MockResource {
    pub fn new(name: impl Into<String>, journal: Arc<RwLock<Vec<String>>>) -> Self {
        Self {
            name: name.into(),
            journal,
            fail_on_commit: RwLock::new(false),
        }
    }

    pub async fn set_fail_on_commit(&self, fail: bool) {
        *self.fail_on_commit.write().await = fail;
    }
}

#[async_trait]
impl Transactional for MockResource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn commit(&mut self) -> StoreResult<()> {
        if *self.fail_on_commit.read().await {
            return Err(StoreError::Backend(format!("{} refused to commit", self.name)));
        }
        self.journal.write().await.push(format!("commit:{}", self.name));
        Ok(())
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        self.journal
            .write()
            .await
            .push(format!("rollback:{}", self.name));
        Ok(())
    }
}
