//! Message types for link operations including core domain identifiers.

use crate::error::{ReceiverError, ValidationError};
use crate::lock;
use crate::settlement::MessageSettler;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;

/// Application properties and message annotations.
pub type PropertyMap = HashMap<String, serde_json::Value>;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Validated entity path (queue, topic or `topic/subscriptions/name`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityPath(String);

impl EntityPath {
    /// Create new entity path with validation
    pub fn new(path: String) -> Result<Self, ValidationError> {
        if path.is_empty() || path.len() > 260 {
            return Err(ValidationError::OutOfRange {
                field: "entity_path".to_string(),
                message: "must be 1-260 characters".to_string(),
            });
        }

        if !path
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '$'))
        {
            return Err(ValidationError::InvalidFormat {
                field: "entity_path".to_string(),
                message: "only ASCII alphanumeric, '-', '_', '.', '/' and '$' allowed".to_string(),
            });
        }

        if path.starts_with('/') || path.ends_with('/') || path.contains("//") {
            return Err(ValidationError::InvalidFormat {
                field: "entity_path".to_string(),
                message: "no leading, trailing or empty path segments".to_string(),
            });
        }

        Ok(Self(path))
    }

    /// Get entity path as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntityPath {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

/// Name of an AMQP link
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkName(String);

impl LinkName {
    /// Generate a fresh, unique link name for an entity
    pub fn generate(path: &EntityPath) -> Self {
        Self(format!("{}-{}", path, uuid::Uuid::new_v4()))
    }

    /// Use an explicit link name
    pub fn new(name: String) -> Result<Self, ValidationError> {
        if name.is_empty() {
            return Err(ValidationError::Required {
                field: "link_name".to_string(),
            });
        }

        Ok(Self(name))
    }

    /// Get link name as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LinkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lock token identifying a peek-locked message on the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockToken(uuid::Uuid);

impl LockToken {
    /// Generate a new random lock token
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Wrap a lock token received from the broker
    pub fn from_uuid(id: uuid::Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> uuid::Uuid {
        self.0
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LockToken {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| ValidationError::InvalidFormat {
                field: "lock_token".to_string(),
                message: e.to_string(),
            })
    }
}

/// Unique identifier for messages
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

/// Identifier for grouping related messages for ordered processing
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Create new session ID with validation
    pub fn new(id: String) -> Result<Self, ValidationError> {
        if id.is_empty() {
            return Err(ValidationError::Required {
                field: "session_id".to_string(),
            });
        }

        if id.len() > 128 {
            return Err(ValidationError::OutOfRange {
                field: "session_id".to_string(),
                message: "maximum 128 characters".to_string(),
            });
        }

        if !id.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
            return Err(ValidationError::InvalidFormat {
                field: "session_id".to_string(),
                message: "only ASCII printable characters allowed".to_string(),
            });
        }

        Ok(Self(id))
    }

    /// Get session ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

/// Link-scoped numeric identifier of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryId(u32);

impl DeliveryId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create timestamp from DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Timestamp offset from now
    pub fn from_now(offset: chrono::Duration) -> Self {
        Self(Utc::now() + offset)
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Time left until this timestamp, zero when already passed
    pub fn duration_until(&self) -> std::time::Duration {
        (self.0 - Utc::now()).to_std().unwrap_or_default()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S UTC"))
    }
}

impl FromStr for Timestamp {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dt = s.parse::<DateTime<Utc>>()?;
        Ok(Self::from_datetime(dt))
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// A message to be sent to an entity
#[derive(Debug, Clone)]
pub struct Message {
    pub message_id: MessageId,
    pub body: Bytes,
    pub application_properties: PropertyMap,
    pub session_id: Option<SessionId>,
    pub correlation_id: Option<String>,
    pub time_to_live: Option<chrono::Duration>,
}

impl Message {
    /// Create new message with body
    pub fn new(body: Bytes) -> Self {
        Self {
            message_id: MessageId::new(),
            body,
            application_properties: PropertyMap::new(),
            session_id: None,
            correlation_id: None,
            time_to_live: None,
        }
    }

    /// Add session ID for ordered processing
    pub fn with_session_id(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Add application property
    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.application_properties.insert(key.into(), value);
        self
    }

    /// Add correlation ID for tracking
    pub fn with_correlation_id(mut self, correlation_id: String) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Add time-to-live for message expiration
    pub fn with_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }
}

/// A message as delivered by the broker, before any local state is attached
#[derive(Debug, Clone)]
pub struct BrokeredMessage {
    pub message_id: MessageId,
    pub body: Bytes,
    pub application_properties: PropertyMap,
    pub session_id: Option<SessionId>,
    pub correlation_id: Option<String>,
    pub lock_token: Option<LockToken>,
    pub locked_until: Option<Timestamp>,
    pub sequence_number: i64,
    pub delivery_count: u32,
    pub enqueued_at: Timestamp,
}

impl BrokeredMessage {
    /// Create an unlocked broker message with body
    pub fn new(body: Bytes) -> Self {
        Self {
            message_id: MessageId::new(),
            body,
            application_properties: PropertyMap::new(),
            session_id: None,
            correlation_id: None,
            lock_token: None,
            locked_until: None,
            sequence_number: 0,
            delivery_count: 0,
            enqueued_at: Timestamp::now(),
        }
    }

    /// Attach a peek-lock
    pub fn with_lock(mut self, lock_token: LockToken, locked_until: Timestamp) -> Self {
        self.lock_token = Some(lock_token);
        self.locked_until = Some(locked_until);
        self
    }

    pub fn with_sequence_number(mut self, sequence_number: i64) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    pub fn with_session_id(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.application_properties.insert(key.into(), value);
        self
    }
}

/// A transfer received on a link
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: DeliveryId,
    pub message: BrokeredMessage,
}

// ============================================================================
// Settlement
// ============================================================================

/// Terminal outcome reported for a received message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SettlementKind {
    Complete,
    Abandon,
    Defer,
    DeadLetter,
}

impl SettlementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Abandon => "abandon",
            Self::Defer => "defer",
            Self::DeadLetter => "deadletter",
        }
    }
}

impl fmt::Display for SettlementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SettlementKind {
    type Err = ReceiverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "complete" => Ok(Self::Complete),
            "abandon" => Ok(Self::Abandon),
            "defer" => Ok(Self::Defer),
            "deadletter" => Ok(Self::DeadLetter),
            other => Err(ReceiverError::InvalidSettlementKind {
                kind: other.to_string(),
            }),
        }
    }
}

/// Optional details attached to a settlement
#[derive(Debug, Clone, Default)]
pub struct SettlementOptions {
    /// Property overrides applied by abandon and defer
    pub properties_to_modify: PropertyMap,
    /// Reason recorded by deadletter
    pub dead_letter_reason: Option<String>,
    /// Description recorded by deadletter
    pub dead_letter_description: Option<String>,
}

impl SettlementOptions {
    pub fn with_properties(properties: PropertyMap) -> Self {
        Self {
            properties_to_modify: properties,
            ..Self::default()
        }
    }

    pub fn dead_letter(reason: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            dead_letter_reason: Some(reason.into()),
            dead_letter_description: Some(description.into()),
            ..Self::default()
        }
    }
}

/// A message handed to the application, carrying its lock and settlement state.
///
/// Clones share the lock expiry and settled flag, so a renewal or settlement
/// through one clone is visible through all of them.
#[derive(Clone)]
pub struct ReceivedMessage {
    message: Arc<BrokeredMessage>,
    delivery: Option<DeliveryId>,
    link_name: Option<LinkName>,
    locked_until: Arc<Mutex<Option<Timestamp>>>,
    settled: Arc<AtomicBool>,
    settler: Arc<dyn MessageSettler>,
}

impl ReceivedMessage {
    /// Wrap a transfer received on a link
    pub(crate) fn from_delivery(
        delivery: Delivery,
        link_name: LinkName,
        settler: Arc<dyn MessageSettler>,
    ) -> Self {
        let locked_until = delivery.message.locked_until;
        Self {
            message: Arc::new(delivery.message),
            delivery: Some(delivery.id),
            link_name: Some(link_name),
            locked_until: Arc::new(Mutex::new(locked_until)),
            settled: Arc::new(AtomicBool::new(false)),
            settler,
        }
    }

    /// Wrap a message obtained through the management channel
    pub(crate) fn from_management(
        message: BrokeredMessage,
        settler: Arc<dyn MessageSettler>,
    ) -> Self {
        let locked_until = message.locked_until;
        Self {
            message: Arc::new(message),
            delivery: None,
            link_name: None,
            locked_until: Arc::new(Mutex::new(locked_until)),
            settled: Arc::new(AtomicBool::new(false)),
            settler,
        }
    }

    pub fn body(&self) -> &Bytes {
        &self.message.body
    }

    pub fn message_id(&self) -> &MessageId {
        &self.message.message_id
    }

    pub fn application_properties(&self) -> &PropertyMap {
        &self.message.application_properties
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.message.session_id.as_ref()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.message.correlation_id.as_deref()
    }

    pub fn lock_token(&self) -> Option<LockToken> {
        self.message.lock_token
    }

    pub fn sequence_number(&self) -> i64 {
        self.message.sequence_number
    }

    pub fn delivery_count(&self) -> u32 {
        self.message.delivery_count
    }

    pub fn enqueued_at(&self) -> Timestamp {
        self.message.enqueued_at
    }

    /// Current lock expiry, including any renewals
    pub fn locked_until(&self) -> Option<Timestamp> {
        *lock(&self.locked_until)
    }

    /// Delivery on the receiving link, `None` for management-channel messages
    pub fn delivery_id(&self) -> Option<DeliveryId> {
        self.delivery
    }

    pub(crate) fn link_name(&self) -> Option<&LinkName> {
        self.link_name.as_ref()
    }

    /// Check if a settlement for this message has been confirmed
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    pub(crate) fn mark_settled(&self) {
        self.settled.store(true, Ordering::Release);
    }

    pub(crate) fn set_locked_until(&self, locked_until: Timestamp) {
        *lock(&self.locked_until) = Some(locked_until);
    }

    /// Settle the message with an explicit outcome
    pub async fn settle(
        &self,
        kind: SettlementKind,
        options: SettlementOptions,
    ) -> Result<(), ReceiverError> {
        self.settler.settle(self, kind, options).await
    }

    /// Remove the message from the entity
    pub async fn complete(&self) -> Result<(), ReceiverError> {
        self.settle(SettlementKind::Complete, SettlementOptions::default())
            .await
    }

    /// Release the lock so the message can be redelivered
    pub async fn abandon(&self, properties: Option<PropertyMap>) -> Result<(), ReceiverError> {
        self.settle(
            SettlementKind::Abandon,
            SettlementOptions::with_properties(properties.unwrap_or_default()),
        )
        .await
    }

    /// Set the message aside for retrieval by sequence number
    pub async fn defer(&self, properties: Option<PropertyMap>) -> Result<(), ReceiverError> {
        self.settle(
            SettlementKind::Defer,
            SettlementOptions::with_properties(properties.unwrap_or_default()),
        )
        .await
    }

    /// Move the message to the dead-letter sub-queue
    pub async fn dead_letter(&self, options: SettlementOptions) -> Result<(), ReceiverError> {
        self.settle(SettlementKind::DeadLetter, options).await
    }

    /// Extend the message lock through the management channel
    pub async fn renew_lock(&self) -> Result<Timestamp, ReceiverError> {
        self.settler.renew_lock(self).await
    }
}

impl fmt::Debug for ReceivedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedMessage")
            .field("message_id", &self.message.message_id)
            .field("sequence_number", &self.message.sequence_number)
            .field("delivery", &self.delivery)
            .field("lock_token", &self.message.lock_token)
            .field("locked_until", &self.locked_until())
            .field("settled", &self.is_settled())
            .finish()
    }
}
