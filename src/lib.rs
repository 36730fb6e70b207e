//! Courier - broker-agnostic messaging middleware
//!
//! An in-process publisher dispatching messages to subscribed methods
//! through a behavior pipeline, plus a reliable inbound pipeline that
//! consumes from message brokers with chunk reassembly, deduplication,
//! error policies and transactional commit/rollback.

pub mod broker;
pub mod chunking;
pub mod components;
pub mod config;
pub mod error_policy;
pub mod inbound;
pub mod inbound_log;
pub mod messages;
pub mod publishing;
pub mod serialization;
pub mod storage;
pub mod subscribers;
pub mod transaction;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_utils;

pub use messages::{AnyMessage, Message, MessageKind, MessageType};
pub use publishing::{Publisher, PublishError};
