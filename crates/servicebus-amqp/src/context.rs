//! Per-connection and per-entity coordination.
//!
//! A [`ConnectionContext`] hands out one [`EntityContext`] per entity path.
//! The entity context owns the entity's management client and lock-token
//! store, creates senders and receivers, and keeps one slot per role:
//!
//! - one sender
//! - one streaming receiver
//! - one batching receiver
//! - one session receiver per session id
//!
//! When the connection is lost the context drives the detach protocol of
//! every occupant in a fixed order: sender, streaming receiver, batching
//! receiver, then session receivers by ascending session id.

use crate::batch::BatchingReceiver;
use crate::config::{ClientConfig, ReceiveMode, ReceiverOptions};
use crate::correlation::ExpiringStore;
use crate::error::{ErrorCondition, ReceiverError, TransportError, ValidationError};
use crate::lock;
use crate::message::{
    EntityPath, LockToken, ReceivedMessage, SessionId, SettlementKind, SettlementOptions,
    Timestamp,
};
use crate::receiver::{
    ErrorHandler, MessageHandler, ReceiverCore, ReceiverRole, StreamingReceiver,
};
use crate::sender::MessageSender;
use crate::session::SessionReceiver;
use crate::settlement::MessageSettler;
use crate::transport::{
    AmqpTransport, ManagementClient, ManagementClientFactory, SessionFilter, TokenProvider,
};
use async_trait::async_trait;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "context_tests.rs"]
mod tests;

#[derive(Default)]
struct Slots {
    sender: Option<Arc<MessageSender>>,
    streaming: Option<Arc<ReceiverCore>>,
    batching: Option<Arc<ReceiverCore>>,
    sessions: BTreeMap<SessionId, Arc<ReceiverCore>>,
}

// ============================================================================
// Entity Context
// ============================================================================

/// Coordinator of every link to one entity path.
pub struct EntityContext {
    path: EntityPath,
    audience: String,
    transport: Arc<dyn AmqpTransport>,
    token_provider: Arc<dyn TokenProvider>,
    management: Arc<dyn ManagementClient>,
    config: ClientConfig,
    lock_tokens: ExpiringStore<LockToken, Timestamp>,
    slots: Mutex<Slots>,
    self_ref: Weak<EntityContext>,
}

impl EntityContext {
    /// Create the context of `path`.
    ///
    /// Must be called from within a Tokio runtime; the lock-token store is
    /// swept in the background.
    pub fn new(
        path: EntityPath,
        audience: String,
        transport: Arc<dyn AmqpTransport>,
        token_provider: Arc<dyn TokenProvider>,
        management: Arc<dyn ManagementClient>,
        config: ClientConfig,
    ) -> Arc<Self> {
        let lock_tokens = ExpiringStore::with_sweep(config.lock_token_sweep_interval());

        Arc::new_cyclic(|self_ref| Self {
            path,
            audience,
            transport,
            token_provider,
            management,
            config,
            lock_tokens,
            slots: Mutex::new(Slots::default()),
            self_ref: self_ref.clone(),
        })
    }

    pub fn path(&self) -> &EntityPath {
        &self.path
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn management(&self) -> Arc<dyn ManagementClient> {
        self.management.clone()
    }

    pub(crate) fn transport(&self) -> Arc<dyn AmqpTransport> {
        self.transport.clone()
    }

    pub(crate) fn token_provider(&self) -> Arc<dyn TokenProvider> {
        self.token_provider.clone()
    }

    // ------------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------------

    fn ensure_vacant(&self, role: ReceiverRole) -> Result<(), ReceiverError> {
        let slots = lock(&self.slots);
        let occupied = match role {
            ReceiverRole::Streaming => slots.streaming.as_ref(),
            ReceiverRole::Batching => slots.batching.as_ref(),
            ReceiverRole::Session => None,
        };

        match occupied {
            Some(existing) if existing.is_active() => Err(ReceiverError::RoleOccupied {
                role: role.to_string(),
                entity: self.path.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Open a receiver delivering every message to `handler`.
    pub async fn create_streaming_receiver(
        self: &Arc<Self>,
        options: ReceiverOptions,
        handler: Arc<dyn MessageHandler>,
        error_handler: Arc<dyn ErrorHandler>,
    ) -> Result<StreamingReceiver, ReceiverError> {
        self.ensure_vacant(ReceiverRole::Streaming)?;

        let core = ReceiverCore::new(ReceiverRole::Streaming, options, None, self, error_handler)?;
        core.start_handler(handler)?;
        core.open().await?;

        Ok(StreamingReceiver::new(core))
    }

    /// Create a receiver that returns messages on request; its link opens on
    /// the first batch.
    pub fn create_batching_receiver(
        self: &Arc<Self>,
        options: ReceiverOptions,
        error_handler: Arc<dyn ErrorHandler>,
    ) -> Result<BatchingReceiver, ReceiverError> {
        self.ensure_vacant(ReceiverRole::Batching)?;

        let core = ReceiverCore::new(ReceiverRole::Batching, options, None, self, error_handler)?;
        Ok(BatchingReceiver::new(core))
    }

    /// Lock `session_id`, or the next available session when `None`.
    ///
    /// A failure to lock the session is returned as is, without retry.
    pub async fn accept_session(
        self: &Arc<Self>,
        session_id: Option<SessionId>,
        options: ReceiverOptions,
        error_handler: Arc<dyn ErrorHandler>,
    ) -> Result<SessionReceiver, ReceiverError> {
        if let Some(id) = &session_id {
            let occupied = lock(&self.slots)
                .sessions
                .get(id)
                .is_some_and(|existing| existing.is_active());
            if occupied {
                return Err(ReceiverError::RoleOccupied {
                    role: format!("session '{}'", id),
                    entity: self.path.to_string(),
                });
            }
        }

        let filter = match session_id {
            Some(id) => SessionFilter::Named(id),
            None => SessionFilter::Next,
        };
        let core = ReceiverCore::new(
            ReceiverRole::Session,
            options,
            Some(filter),
            self,
            error_handler,
        )?;
        core.open().await?;

        SessionReceiver::new(core)
    }

    /// Shared sender of this entity, created on first use.
    pub fn sender(self: &Arc<Self>) -> Arc<MessageSender> {
        let mut slots = lock(&self.slots);
        if let Some(sender) = slots.sender.as_ref().filter(|s| !s.is_closed_by_us()) {
            return sender.clone();
        }

        let sender = MessageSender::new(self);
        slots.sender = Some(sender.clone());
        sender
    }

    /// Receive deferred messages by sequence number over the management channel.
    ///
    /// Peek-locked messages are settled by lock token through the management
    /// channel; no receive link is involved.
    pub async fn receive_deferred_messages(
        self: &Arc<Self>,
        sequence_numbers: &[i64],
        receive_mode: ReceiveMode,
    ) -> Result<Vec<ReceivedMessage>, ReceiverError> {
        if sequence_numbers.is_empty() {
            return Err(ValidationError::Required {
                field: "sequence_numbers".to_string(),
            }
            .into());
        }

        let messages = self
            .management
            .receive_deferred(sequence_numbers, receive_mode)
            .await?;

        let settler: Arc<dyn MessageSettler> = self.clone();
        let received = messages
            .into_iter()
            .map(|message| {
                if let (Some(token), Some(locked_until)) = (message.lock_token, message.locked_until)
                {
                    self.lock_tokens
                        .set(token, locked_until, locked_until.duration_until());
                }
                ReceivedMessage::from_management(message, settler.clone())
            })
            .collect::<Vec<_>>();

        debug!(
            entity = %self.path,
            requested = sequence_numbers.len(),
            received = received.len(),
            "Deferred messages received"
        );
        Ok(received)
    }

    /// Check if a lock token obtained through the management channel is still held
    pub fn holds_lock_token(&self, lock_token: &LockToken) -> bool {
        self.lock_tokens.has(lock_token)
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    /// Occupy the receiver's slot if it is vacant.
    ///
    /// Returns whether the slot now holds `receiver`.
    pub(crate) fn register_receiver(&self, receiver: &Arc<ReceiverCore>) -> bool {
        let mut slots = lock(&self.slots);
        let slot = match receiver.role() {
            ReceiverRole::Streaming => &mut slots.streaming,
            ReceiverRole::Batching => &mut slots.batching,
            ReceiverRole::Session => {
                let Some(session_id) = receiver.session_id() else {
                    return false;
                };
                return match slots.sessions.entry(session_id) {
                    Entry::Vacant(entry) => {
                        entry.insert(receiver.clone());
                        true
                    }
                    Entry::Occupied(mut entry) => Self::replace_stale(entry.get_mut(), receiver),
                };
            }
        };

        match slot {
            Some(existing) => Self::replace_stale(existing, receiver),
            None => {
                *slot = Some(receiver.clone());
                true
            }
        }
    }

    // A closed occupant that was never deregistered gives way to a new receiver.
    fn replace_stale(existing: &mut Arc<ReceiverCore>, receiver: &Arc<ReceiverCore>) -> bool {
        if Arc::ptr_eq(existing, receiver) {
            return true;
        }
        if existing.is_active() {
            return false;
        }
        *existing = receiver.clone();
        true
    }

    /// Clear the receiver's slot if it holds `receiver`.
    pub(crate) fn deregister_receiver(&self, receiver: &ReceiverCore) {
        let holds = |existing: &Arc<ReceiverCore>| std::ptr::eq(Arc::as_ptr(existing), receiver);

        let mut slots = lock(&self.slots);
        match receiver.role() {
            ReceiverRole::Streaming => {
                if slots.streaming.as_ref().is_some_and(holds) {
                    slots.streaming = None;
                }
            }
            ReceiverRole::Batching => {
                if slots.batching.as_ref().is_some_and(holds) {
                    slots.batching = None;
                }
            }
            ReceiverRole::Session => {
                slots.sessions.retain(|_, existing| !holds(existing));
            }
        }
    }

    pub(crate) fn register_sender(&self, sender: &Arc<MessageSender>) {
        let mut slots = lock(&self.slots);
        if slots.sender.is_none() {
            slots.sender = Some(sender.clone());
        }
    }

    pub(crate) fn deregister_sender(&self, sender: &MessageSender) {
        let mut slots = lock(&self.slots);
        if slots
            .sender
            .as_ref()
            .is_some_and(|existing| std::ptr::eq(Arc::as_ptr(existing), sender))
        {
            slots.sender = None;
        }
    }

    /// Check if a receiver currently occupies the role's slot
    pub fn has_receiver(&self, role: ReceiverRole) -> bool {
        let slots = lock(&self.slots);
        match role {
            ReceiverRole::Streaming => slots.streaming.is_some(),
            ReceiverRole::Batching => slots.batching.is_some(),
            ReceiverRole::Session => !slots.sessions.is_empty(),
        }
    }

    pub fn has_sender(&self) -> bool {
        lock(&self.slots).sender.is_some()
    }

    /// Sessions held by registered session receivers, ascending
    pub fn session_ids(&self) -> Vec<SessionId> {
        lock(&self.slots).sessions.keys().cloned().collect()
    }

    // ------------------------------------------------------------------------
    // Recovery and Shutdown
    // ------------------------------------------------------------------------

    /// Run the detach protocol of every link of this entity, one at a time.
    pub async fn on_connection_lost(&self, error: Option<TransportError>) {
        let (sender, streaming, batching, sessions) = {
            let slots = lock(&self.slots);
            (
                slots.sender.clone(),
                slots.streaming.clone(),
                slots.batching.clone(),
                slots.sessions.values().cloned().collect::<Vec<_>>(),
            )
        };
        let cause = || error.clone().map(ReceiverError::from);

        info!(
            entity = %self.path,
            sessions = sessions.len(),
            error = ?error.as_ref().map(|e| e.to_string()),
            "Recovering entity links after connection loss"
        );

        if let Some(sender) = sender {
            sender.on_detached(cause()).await;
        }
        for receiver in streaming.into_iter().chain(batching).chain(sessions) {
            receiver.on_detached(cause()).await;
        }
    }

    /// Close every link, the management client and the lock-token store.
    pub async fn close(&self) {
        let slots = std::mem::take(&mut *lock(&self.slots));

        if let Some(sender) = slots.sender {
            if let Err(error) = sender.close().await {
                warn!(entity = %self.path, error = %error, "Failed to close sender");
            }
        }
        let receivers = slots
            .streaming
            .into_iter()
            .chain(slots.batching)
            .chain(slots.sessions.into_values());
        for receiver in receivers {
            if let Err(error) = receiver.close().await {
                warn!(entity = %self.path, error = %error, "Failed to close receiver");
            }
        }

        if let Err(error) = self.management.close().await {
            warn!(entity = %self.path, error = %error, "Failed to close management client");
        }
        self.lock_tokens.clear();

        info!(entity = %self.path, "Entity context closed");
    }

    fn lock_lost(lock_token: &LockToken) -> ReceiverError {
        ReceiverError::amqp(
            ErrorCondition::MessageLockLost,
            format!("lock token {} is no longer held", lock_token),
        )
    }
}

/// Settlement of messages received through the management channel.
#[async_trait]
impl MessageSettler for EntityContext {
    async fn settle(
        &self,
        message: &ReceivedMessage,
        kind: SettlementKind,
        options: SettlementOptions,
    ) -> Result<(), ReceiverError> {
        let Some(lock_token) = message.lock_token() else {
            return Err(ReceiverError::UnsupportedInMode {
                mode: ReceiveMode::ReceiveAndDelete,
                operation: kind.to_string(),
            });
        };
        if message.is_settled() {
            return Err(ReceiverError::AlreadySettled {
                sequence_number: message.sequence_number(),
            });
        }
        if !self.lock_tokens.has(&lock_token) {
            return Err(Self::lock_lost(&lock_token));
        }

        self.management
            .update_disposition(&lock_token, kind, &options)
            .await?;
        self.lock_tokens.remove(&lock_token);
        message.mark_settled();

        debug!(entity = %self.path, %lock_token, %kind, "Message settled by lock token");
        Ok(())
    }

    async fn renew_lock(&self, message: &ReceivedMessage) -> Result<Timestamp, ReceiverError> {
        let lock_token = message.lock_token().ok_or_else(|| ValidationError::Required {
            field: "lock_token".to_string(),
        })?;
        if !self.lock_tokens.has(&lock_token) {
            return Err(Self::lock_lost(&lock_token));
        }

        let locked_until = self.management.renew_lock(&lock_token).await?;
        message.set_locked_until(locked_until);
        self.lock_tokens
            .set(lock_token, locked_until, locked_until.duration_until());
        Ok(locked_until)
    }
}

// ============================================================================
// Connection Context
// ============================================================================

/// Shared state of one AMQP connection: collaborators, configuration and the
/// entity contexts created on it.
pub struct ConnectionContext {
    namespace: String,
    transport: Arc<dyn AmqpTransport>,
    token_provider: Arc<dyn TokenProvider>,
    management_factory: Arc<dyn ManagementClientFactory>,
    config: ClientConfig,
    entities: Mutex<BTreeMap<EntityPath, Arc<EntityContext>>>,
}

impl ConnectionContext {
    /// Create a connection context.
    ///
    /// `namespace` is the audience prefix of every entity, for example
    /// `sb://contoso.servicebus.windows.net`.
    pub fn new(
        namespace: impl Into<String>,
        transport: Arc<dyn AmqpTransport>,
        token_provider: Arc<dyn TokenProvider>,
        management_factory: Arc<dyn ManagementClientFactory>,
        config: ClientConfig,
    ) -> Result<Self, ReceiverError> {
        config.validate()?;

        Ok(Self {
            namespace: namespace.into(),
            transport,
            token_provider,
            management_factory,
            config,
            entities: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Context of `path`, shared by every caller for the same path.
    pub fn entity(&self, path: &EntityPath) -> Arc<EntityContext> {
        let mut entities = lock(&self.entities);
        entities
            .entry(path.clone())
            .or_insert_with(|| {
                EntityContext::new(
                    path.clone(),
                    format!("{}/{}", self.namespace.trim_end_matches('/'), path),
                    self.transport.clone(),
                    self.token_provider.clone(),
                    self.management_factory.create(path),
                    self.config.clone(),
                )
            })
            .clone()
    }

    pub fn entity_paths(&self) -> Vec<EntityPath> {
        lock(&self.entities).keys().cloned().collect()
    }

    /// Recover every entity after the connection was lost.
    pub async fn on_disconnected(&self, error: Option<TransportError>) {
        let entities: Vec<_> = lock(&self.entities).values().cloned().collect();
        warn!(
            entities = entities.len(),
            error = ?error.as_ref().map(|e| e.to_string()),
            "Connection lost"
        );

        for entity in entities {
            entity.on_connection_lost(error.clone()).await;
        }
    }

    /// Close every entity context.
    pub async fn close(&self) {
        let entities = std::mem::take(&mut *lock(&self.entities));
        for entity in entities.into_values() {
            entity.close().await;
        }
    }
}
