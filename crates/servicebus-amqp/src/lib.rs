//! # Service Bus AMQP
//!
//! Receive-side AMQP 1.0 link engine for Service Bus style brokers.
//!
//! This library provides:
//! - Streaming, batching and session receivers over peek-lock or
//!   receive-and-delete links
//! - Settlement (complete, abandon, defer, deadletter) with acknowledgement
//!   tracking and credit replenishment
//! - Automatic message lock renewal
//! - Re-establishment of detached links with a retry policy
//! - Claim negotiation and proactive token renewal per link
//! - Deferred message receive and settlement over the management channel
//!
//! The AMQP stack itself is abstracted behind the traits in [`transport`];
//! [`providers::memory`] implements them without a broker.
//!
//! ## Module Organization
//!
//! - [`context`] - Connection and entity coordination, receiver creation
//! - [`receiver`] - Receiver core, handler traits and the streaming receiver
//! - [`batch`] - Batching receiver
//! - [`session`] - Session receiver
//! - [`sender`] - Message sender
//! - [`link`] - Link lifecycle state and claim renewal
//! - [`settlement`] - Disposition outcomes and acknowledgement tracking
//! - [`renewal`] - Message lock renewal
//! - [`retry`] - Retry orchestration
//! - [`correlation`] - Expiring key/value store
//! - [`config`] - Receiver and client configuration
//! - [`error`] - Error types and transport error translation
//! - [`message`] - Identifiers and message types
//! - [`transport`] - Interfaces of the external collaborators

use std::sync::{Mutex, MutexGuard, PoisonError};

// Module declarations
pub mod batch;
pub mod config;
pub mod context;
pub mod correlation;
pub mod error;
pub mod link;
pub mod message;
pub mod providers;
pub mod receiver;
pub mod renewal;
pub mod retry;
pub mod sender;
pub mod session;
pub mod settlement;
pub mod transport;

#[cfg(test)]
mod test_support;

// Re-export commonly used types at crate root for convenience
pub use batch::BatchingReceiver;
pub use config::{
    BatchOptions, ClientConfig, ReceiveMode, ReceiverOptions, SettlementTimeoutPolicy,
    TokenOptions,
};
pub use context::{ConnectionContext, EntityContext};
pub use correlation::ExpiringStore;
pub use error::{
    ConfigurationError, ErrorCondition, ReceiverError, TransportError, ValidationError,
};
pub use link::LinkState;
pub use message::{
    BrokeredMessage, Delivery, DeliveryId, EntityPath, LinkName, LockToken, Message, MessageId,
    PropertyMap, ReceivedMessage, SessionId, SettlementKind, SettlementOptions, Timestamp,
};
pub use receiver::{ErrorHandler, MessageHandler, ReceiverRole, StreamingReceiver};
pub use retry::{retry, RetryOperationType, RetryPolicy};
pub use sender::MessageSender;
pub use session::SessionReceiver;

/// Lock a mutex, recovering the data of a poisoned one.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
