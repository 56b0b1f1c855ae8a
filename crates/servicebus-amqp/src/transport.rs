//! Interfaces of the external collaborators: the AMQP transport, the claim
//! negotiator and the management (request/response) channel.
//!
//! Nothing in this crate frames AMQP itself. Implementations of these traits
//! wrap a concrete AMQP stack; [`crate::providers::memory`] provides in-memory
//! implementations for tests and development.

use crate::config::ReceiveMode;
use crate::error::TransportError;
use crate::message::{
    BrokeredMessage, Delivery, DeliveryId, EntityPath, LinkName, LockToken, Message, PropertyMap,
    SessionId, SettlementKind, SettlementOptions, Timestamp,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

// ============================================================================
// Link Options and Events
// ============================================================================

/// Which session a session-scoped receiver link asks the broker to lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionFilter {
    /// First session with available messages
    Next,
    /// A specific session
    Named(SessionId),
}

/// Parameters for opening a receiver link
#[derive(Debug, Clone)]
pub struct ReceiverLinkOptions {
    pub name: LinkName,
    pub address: EntityPath,
    pub receive_mode: ReceiveMode,
    pub session: Option<SessionFilter>,
}

/// Parameters for opening a sender link
#[derive(Debug, Clone)]
pub struct SenderLinkOptions {
    pub name: LinkName,
    pub address: EntityPath,
}

/// Error payload attached to a rejected disposition
#[derive(Debug, Clone, PartialEq)]
pub struct AmqpErrorPayload {
    pub condition: String,
    pub description: String,
    pub info: PropertyMap,
}

/// Local disposition outcome sent for a delivery
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Accepted,
    Modified {
        delivery_failed: bool,
        undeliverable_here: bool,
        message_annotations: PropertyMap,
    },
    Rejected {
        error: Option<AmqpErrorPayload>,
    },
}

/// Events raised by an open link
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A transfer arrived
    Message(Delivery),
    /// The remote peer settled a delivery this side disposed
    Settled {
        delivery: DeliveryId,
        error: Option<TransportError>,
    },
    LinkError(TransportError),
    /// The remote peer detached the link
    LinkClosed(Option<TransportError>),
    SessionError(TransportError),
    /// The remote peer ended the link's session
    SessionClosed(Option<TransportError>),
}

/// Stream of events for one link; ends when the link is gone.
pub type LinkEvents = mpsc::UnboundedReceiver<LinkEvent>;

/// A receiver link and its event stream
pub struct OpenedReceiver {
    pub link: Arc<dyn ReceiverLink>,
    pub events: LinkEvents,
}

/// A sender link and its event stream
pub struct OpenedSender {
    pub link: Arc<dyn SenderLink>,
    pub events: LinkEvents,
}

// ============================================================================
// Transport Traits
// ============================================================================

/// Link factory over an established AMQP connection
#[async_trait]
pub trait AmqpTransport: Send + Sync {
    /// Open a receiver link (and its session)
    async fn open_receiver(
        &self,
        options: ReceiverLinkOptions,
    ) -> Result<OpenedReceiver, TransportError>;

    /// Open a sender link (and its session)
    async fn open_sender(&self, options: SenderLinkOptions)
        -> Result<OpenedSender, TransportError>;

    /// Forget a link in any transport-level cache
    fn remove_link(&self, name: &LinkName);
}

/// An open receiver link
#[async_trait]
pub trait ReceiverLink: Send + Sync {
    fn name(&self) -> &LinkName;

    /// Session locked by this link, for session-scoped links
    fn session_id(&self) -> Option<SessionId>;

    /// Expiry of the session lock, for session-scoped links
    fn session_locked_until(&self) -> Option<Timestamp>;

    /// Grant the peer `credit` more transfers
    fn add_credit(&self, credit: u32);

    /// Withdraw all outstanding credit
    fn drain_credit(&self);

    /// Send a disposition frame for `delivery`
    fn dispose(&self, delivery: DeliveryId, outcome: Outcome) -> Result<(), TransportError>;

    /// Close the link and its session
    async fn close(&self) -> Result<(), TransportError>;
}

/// An open sender link
#[async_trait]
pub trait SenderLink: Send + Sync {
    fn name(&self) -> &LinkName;

    /// Transfer a message and wait for the peer to accept it
    async fn send(&self, message: &Message) -> Result<(), TransportError>;

    /// Close the link and its session
    async fn close(&self) -> Result<(), TransportError>;
}

// ============================================================================
// Security and Management Channel
// ============================================================================

/// Result of a claim negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenInfo {
    pub expires_at: Timestamp,
}

/// Negotiates the security claim a link needs before it can be opened
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn negotiate_claim(&self, address: &str, audience: &str)
        -> Result<TokenInfo, TransportError>;
}

/// Request/response channel of an entity
#[async_trait]
pub trait ManagementClient: Send + Sync {
    /// Renew a message lock, returning the new expiry
    async fn renew_lock(&self, lock_token: &LockToken) -> Result<Timestamp, TransportError>;

    /// Settle a message by lock token, without a receive link
    async fn update_disposition(
        &self,
        lock_token: &LockToken,
        kind: SettlementKind,
        options: &SettlementOptions,
    ) -> Result<(), TransportError>;

    /// Receive deferred messages by sequence number
    async fn receive_deferred(
        &self,
        sequence_numbers: &[i64],
        receive_mode: ReceiveMode,
    ) -> Result<Vec<BrokeredMessage>, TransportError>;

    /// Renew a session lock, returning the new expiry
    async fn renew_session_lock(&self, session_id: &SessionId)
        -> Result<Timestamp, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Creates the management client of an entity path
pub trait ManagementClientFactory: Send + Sync {
    fn create(&self, path: &EntityPath) -> Arc<dyn ManagementClient>;
}

impl<F> ManagementClientFactory for F
where
    F: Fn(&EntityPath) -> Arc<dyn ManagementClient> + Send + Sync,
{
    fn create(&self, path: &EntityPath) -> Arc<dyn ManagementClient> {
        self(path)
    }
}
