//! Message receiver core shared by streaming, batching and session receivers.
//!
//! A [`ReceiverCore`] owns one receiver link at a time. It pumps the link's
//! events, hands messages to the registered intake (a durable handler or a
//! temporary batch channel), settles messages over the link, renews their
//! locks and re-establishes the link after an unsolicited detach.
//!
//! # Message Flow
//!
//! In streaming mode each message runs through its own task:
//!
//! 1. lock renewal starts (peek-lock with a positive auto-renew window)
//! 2. the handler runs
//! 3. lock renewal is cancelled
//! 4. on success with auto-complete the message is completed; on failure it
//!    is abandoned unless its lock is already lost
//!
//! Link credit bounds the number of messages in flight: one credit is
//! returned per disposition in peek-lock mode and per handler completion in
//! receive-and-delete mode.

use crate::config::{BatchOptions, ReceiveMode, ReceiverOptions};
use crate::context::EntityContext;
use crate::error::{ErrorCondition, ReceiverError, TransportError, ValidationError};
use crate::link::{reconnect_decision, LinkEntity, LinkState, ReconnectDecision};
use crate::lock;
use crate::message::{
    EntityPath, LinkName, ReceivedMessage, SessionId, SettlementKind, SettlementOptions, Timestamp,
};
use crate::renewal::LockRenewal;
use crate::retry::{retry, RetryOperationType, RetryPolicy};
use crate::settlement::{outcome_for, MessageSettler, PendingSettlements};
use crate::transport::{
    AmqpTransport, LinkEvent, LinkEvents, ManagementClient, ReceiverLink, ReceiverLinkOptions,
    SessionFilter,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "receiver_tests.rs"]
mod tests;

// ============================================================================
// Application Interfaces
// ============================================================================

/// Application-provided message handler.
///
/// Handlers run concurrently, up to the receiver's `max_concurrent_calls`,
/// each on its own task. A handler may settle the message itself; otherwise
/// the receiver completes it on success when auto-complete is enabled and
/// abandons it on failure.
///
/// # Error Handling
///
/// A failure is forwarded to the receiver's [`ErrorHandler`]. Returning a
/// [`ReceiverError`] whose lock is lost (for example the error of a failed
/// `complete` call) suppresses the abandon.
///
/// # Examples
///
/// ```rust,no_run
/// use servicebus_amqp::message::ReceivedMessage;
/// use servicebus_amqp::receiver::MessageHandler;
/// use async_trait::async_trait;
///
/// struct PrintHandler;
///
/// #[async_trait]
/// impl MessageHandler for PrintHandler {
///     async fn handle(&self, message: &ReceivedMessage) -> anyhow::Result<()> {
///         println!("Received {} bytes", message.body().len());
///         message.complete().await?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one message
    async fn handle(&self, message: &ReceivedMessage) -> anyhow::Result<()>;
}

/// Receives errors that occur outside any call made by the application:
/// handler failures, automatic settlement and renewal failures, link errors
/// and exhausted reconnection.
pub trait ErrorHandler: Send + Sync {
    fn on_error(&self, error: &ReceiverError);
}

impl<F> ErrorHandler for F
where
    F: Fn(&ReceiverError) + Send + Sync,
{
    fn on_error(&self, error: &ReceiverError) {
        self(error)
    }
}

/// Slot a receiver occupies in its entity context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReceiverRole {
    Streaming,
    Batching,
    Session,
}

impl fmt::Display for ReceiverRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Streaming => write!(f, "streaming"),
            Self::Batching => write!(f, "batching"),
            Self::Session => write!(f, "session"),
        }
    }
}

// ============================================================================
// Receiver Core
// ============================================================================

/// Where incoming messages go
#[derive(Clone)]
enum Intake {
    Idle,
    Handler(Arc<dyn MessageHandler>),
    Batch(mpsc::UnboundedSender<ReceivedMessage>),
}

struct ActiveLink {
    link: Arc<dyn ReceiverLink>,
    pump: JoinHandle<()>,
    /// A terminal error event of this link already reached the error handler
    error_surfaced: bool,
}

pub(crate) struct ReceiverCore {
    role: ReceiverRole,
    options: ReceiverOptions,
    batch_options: BatchOptions,
    link: LinkEntity,
    session: Mutex<Option<SessionFilter>>,
    session_locked_until: Mutex<Option<Timestamp>>,
    transport: Arc<dyn AmqpTransport>,
    management: Arc<dyn ManagementClient>,
    context: Weak<EntityContext>,
    active: Mutex<Option<ActiveLink>>,
    intake: Mutex<Intake>,
    /// Receive-and-delete messages that arrived after their batch resolved
    held_back: Mutex<VecDeque<ReceivedMessage>>,
    pending: PendingSettlements,
    renewals: Mutex<HashMap<u64, LockRenewal>>,
    next_renewal: AtomicU64,
    batch_in_progress: AtomicBool,
    error_handler: Arc<dyn ErrorHandler>,
    reconnect: RetryPolicy,
    open_retry: RetryPolicy,
}

impl ReceiverCore {
    pub fn new(
        role: ReceiverRole,
        options: ReceiverOptions,
        session: Option<SessionFilter>,
        context: &Arc<EntityContext>,
        error_handler: Arc<dyn ErrorHandler>,
    ) -> Result<Arc<Self>, ReceiverError> {
        options.validate()?;

        let path = context.path().clone();
        let name = match &options.name {
            Some(name) => LinkName::new(name.clone())?,
            None => LinkName::generate(&path),
        };
        let config = context.config();

        Ok(Arc::new(Self {
            role,
            batch_options: config.batch.clone(),
            link: LinkEntity::new(
                path,
                context.audience().to_string(),
                name,
                context.token_provider(),
                config.token.clone(),
            ),
            session: Mutex::new(session),
            session_locked_until: Mutex::new(None),
            transport: context.transport(),
            management: context.management(),
            context: Arc::downgrade(context),
            active: Mutex::new(None),
            intake: Mutex::new(Intake::Idle),
            held_back: Mutex::new(VecDeque::new()),
            pending: PendingSettlements::new(config.settlement_timeout_policy),
            renewals: Mutex::new(HashMap::new()),
            next_renewal: AtomicU64::new(0),
            batch_in_progress: AtomicBool::new(false),
            error_handler,
            reconnect: config.reconnect.clone(),
            open_retry: config.operation_retry.clone(),
            options,
        }))
    }

    pub fn role(&self) -> ReceiverRole {
        self.role
    }

    pub fn name(&self) -> LinkName {
        self.link.name()
    }

    pub fn entity_path(&self) -> &EntityPath {
        self.link.address()
    }

    pub fn state(&self) -> LinkState {
        self.link.state()
    }

    pub fn is_open(&self) -> bool {
        self.link.is_open()
    }

    /// Open, or in the middle of re-establishing its link
    pub fn is_active(&self) -> bool {
        self.link.state() != LinkState::Closed
    }

    pub fn options(&self) -> &ReceiverOptions {
        &self.options
    }

    /// Session locked by this receiver, once accepted
    pub fn session_id(&self) -> Option<SessionId> {
        match &*lock(&self.session) {
            Some(SessionFilter::Named(id)) => Some(id.clone()),
            _ => None,
        }
    }

    pub fn session_locked_until(&self) -> Option<Timestamp> {
        *lock(&self.session_locked_until)
    }

    pub fn set_session_locked_until(&self, locked_until: Timestamp) {
        *lock(&self.session_locked_until) = Some(locked_until);
    }

    pub fn management(&self) -> &Arc<dyn ManagementClient> {
        &self.management
    }

    fn closed_error(&self) -> ReceiverError {
        ReceiverError::ReceiverClosed {
            name: self.link.name(),
        }
    }

    fn active_link(&self) -> Option<Arc<dyn ReceiverLink>> {
        lock(&self.active).as_ref().map(|active| active.link.clone())
    }

    fn link_operation(&self) -> RetryOperationType {
        match self.role {
            ReceiverRole::Session => RetryOperationType::SessionLink,
            _ => RetryOperationType::ReceiverLink,
        }
    }

    // ------------------------------------------------------------------------
    // Establishment
    // ------------------------------------------------------------------------

    /// Open the link unless it is already open.
    ///
    /// Session links get a single attempt; other links retry retryable
    /// failures with the operation retry policy.
    pub async fn open(self: &Arc<Self>) -> Result<(), ReceiverError> {
        if self.link.closed_by_us() {
            return Err(self.closed_error());
        }
        if !self.link.begin_connecting()? {
            return Ok(());
        }

        let result = match self.role {
            ReceiverRole::Session => self.establish().await,
            _ => {
                let core = self.clone();
                retry(
                    move || {
                        let core = core.clone();
                        async move { core.establish().await }
                    },
                    self.link_operation(),
                    &self.open_retry,
                )
                .await
            }
        };

        if let Err(error) = &result {
            warn!(
                entity = %self.entity_path(),
                link = %self.link.name(),
                role = %self.role,
                error = %error,
                "Failed to open receiver link"
            );
            self.link.mark_closed();
        }
        result
    }

    /// Negotiate the claim, open the link and start pumping its events.
    async fn establish(self: &Arc<Self>) -> Result<(), ReceiverError> {
        if self.link.closed_by_us() {
            return Err(self.closed_error());
        }

        let name = self.link.name();
        let token = self.link.negotiate_claim().await?;
        let session = lock(&self.session).clone();

        let opened = self
            .transport
            .open_receiver(ReceiverLinkOptions {
                name: name.clone(),
                address: self.entity_path().clone(),
                receive_mode: self.options.receive_mode,
                session,
            })
            .await?;

        if let Some(session_id) = opened.link.session_id() {
            *lock(&self.session) = Some(SessionFilter::Named(session_id));
        }
        if let Some(locked_until) = opened.link.session_locked_until() {
            self.set_session_locked_until(locked_until);
        }

        let pump = tokio::spawn(pump_events(
            Arc::downgrade(self),
            name.clone(),
            opened.events,
        ));
        let credit = match &*lock(&self.intake) {
            Intake::Handler(_) => self.options.max_concurrent_calls,
            _ => 0,
        };
        *lock(&self.active) = Some(ActiveLink {
            link: opened.link.clone(),
            pump,
            error_surfaced: false,
        });
        if credit > 0 {
            opened.link.add_credit(credit);
        }

        if !self.link.mark_open() {
            // Closed while attaching: the new link must not outlive the receiver.
            let orphan = lock(&self.active).take();
            if let Some(orphan) = orphan {
                orphan.pump.abort();
                let _ = orphan.link.close().await;
                self.transport.remove_link(&name);
            }
            debug!(
                entity = %self.entity_path(),
                link = %name,
                "Receiver closed while its link was being established"
            );
            return Err(self.closed_error());
        }

        self.link.schedule_token_renewal(token);
        self.register();

        info!(
            entity = %self.entity_path(),
            link = %name,
            role = %self.role,
            session_id = ?self.session_id(),
            credit,
            "Receiver link established"
        );
        Ok(())
    }

    fn register(self: &Arc<Self>) {
        if let Some(context) = self.context.upgrade() {
            context.register_receiver(self);
        }
    }

    fn deregister(&self) {
        if let Some(context) = self.context.upgrade() {
            context.deregister_receiver(self);
        }
    }

    // ------------------------------------------------------------------------
    // Intake
    // ------------------------------------------------------------------------

    /// Register a durable handler and grant its credit window.
    pub fn start_handler(&self, handler: Arc<dyn MessageHandler>) -> Result<(), ReceiverError> {
        {
            let mut intake = lock(&self.intake);
            match &*intake {
                Intake::Idle => *intake = Intake::Handler(handler),
                _ => {
                    return Err(ReceiverError::amqp(
                        ErrorCondition::InvalidOperation,
                        format!("receiver '{}' is already receiving", self.link.name()),
                    ))
                }
            }
        }

        if let Some(link) = self.active_link() {
            link.add_credit(self.options.max_concurrent_calls);
        }
        Ok(())
    }

    fn has_handler(&self) -> bool {
        matches!(&*lock(&self.intake), Intake::Handler(_))
    }

    /// Drop a batch channel so a pending batch resolves.
    fn end_batch_intake(&self) {
        let mut intake = lock(&self.intake);
        if matches!(&*intake, Intake::Batch(_)) {
            *intake = Intake::Idle;
        }
    }

    fn handle_event(self: &Arc<Self>, link_name: &LinkName, event: LinkEvent) {
        match event {
            LinkEvent::Message(delivery) => {
                let settler: Arc<dyn MessageSettler> = self.clone();
                let message = ReceivedMessage::from_delivery(delivery, link_name.clone(), settler);
                self.dispatch(message);
            }
            LinkEvent::Settled { delivery, error } => {
                self.pending.acknowledge(delivery, error);
            }
            LinkEvent::LinkError(error) | LinkEvent::SessionError(error) => {
                self.on_link_error(link_name, &error);
            }
            LinkEvent::LinkClosed(error) | LinkEvent::SessionClosed(error) => {
                if self.link.closed_by_us() || self.link.is_connecting() {
                    debug!(
                        entity = %self.entity_path(),
                        link = %link_name,
                        "Ignoring link closure during local close or reconnection"
                    );
                    return;
                }
                let core = self.clone();
                let error = error.map(ReceiverError::from);
                tokio::spawn(async move { core.on_detached(error).await });
            }
        }
    }

    fn dispatch(self: &Arc<Self>, message: ReceivedMessage) {
        let intake = lock(&self.intake).clone();
        match intake {
            Intake::Handler(handler) => {
                let core = self.clone();
                tokio::spawn(async move { core.process_message(handler, message).await });
            }
            Intake::Batch(channel) => {
                if let Err(mpsc::error::SendError(message)) = channel.send(message) {
                    self.release_late(message);
                }
            }
            Intake::Idle => self.release_late(message),
        }
    }

    /// Give back a message that arrived after its batch resolved.
    fn release_late(self: &Arc<Self>, message: ReceivedMessage) {
        match self.options.receive_mode {
            ReceiveMode::PeekLock => {
                debug!(
                    entity = %self.entity_path(),
                    delivery = ?message.delivery_id(),
                    "Abandoning message that arrived without an intake"
                );
                tokio::spawn(async move {
                    if let Err(error) = message.abandon(None).await {
                        debug!(error = %error, "Failed to abandon late message");
                    }
                });
            }
            ReceiveMode::ReceiveAndDelete => {
                debug!(
                    entity = %self.entity_path(),
                    message_id = %message.message_id(),
                    "Holding back message that arrived without an intake"
                );
                lock(&self.held_back).push_back(message);
            }
        }
    }

    fn on_link_error(&self, link_name: &LinkName, error: &TransportError) {
        let error = ReceiverError::from(error.clone());
        if error.is_retryable() || self.link.closed_by_us() {
            debug!(
                entity = %self.entity_path(),
                link = %link_name,
                error = %error,
                "Link error will be handled on detach"
            );
            return;
        }

        let first_report = match lock(&self.active).as_mut() {
            Some(active) if active.link.name() == link_name => {
                !std::mem::replace(&mut active.error_surfaced, true)
            }
            _ => true,
        };
        if !first_report {
            debug!(
                entity = %self.entity_path(),
                link = %link_name,
                error = %error,
                "Link error already reported"
            );
            return;
        }

        warn!(entity = %self.entity_path(), link = %link_name, error = %error, "Link error");
        self.error_handler.on_error(&error);
    }

    // ------------------------------------------------------------------------
    // Message Processing
    // ------------------------------------------------------------------------

    async fn process_message(self: Arc<Self>, handler: Arc<dyn MessageHandler>, message: ReceivedMessage) {
        let renewal = self.start_renewal(&message);

        let outcome = handler.handle(&message).await;

        if let Some(renewal) = renewal {
            self.stop_renewal(renewal);
        }

        let peek_lock = self.options.receive_mode == ReceiveMode::PeekLock;
        match outcome {
            Ok(()) => {
                if peek_lock
                    && self.options.auto_complete
                    && !message.is_settled()
                    && !self.link.closed_by_us()
                {
                    if let Err(error) = message.complete().await {
                        warn!(
                            entity = %self.entity_path(),
                            message_id = %message.message_id(),
                            error = %error,
                            "Automatic completion failed"
                        );
                        self.error_handler.on_error(&error);
                    }
                }
            }
            Err(failure) => {
                let failure = ReceiverError::from_handler(failure);
                warn!(
                    entity = %self.entity_path(),
                    message_id = %message.message_id(),
                    error = %failure,
                    "Message handler failed"
                );

                if peek_lock
                    && !failure.is_lock_lost()
                    && !message.is_settled()
                    && !self.link.closed_by_us()
                {
                    if let Err(error) = message.abandon(None).await {
                        self.error_handler.on_error(&error);
                    }
                }
                self.error_handler.on_error(&failure);
            }
        }

        if !peek_lock && self.has_handler() {
            if let Some(link) = self.active_link() {
                link.add_credit(1);
            }
        }
    }

    fn start_renewal(&self, message: &ReceivedMessage) -> Option<u64> {
        if !self.options.auto_renew_enabled() || message.lock_token().is_none() {
            return None;
        }

        let id = self.next_renewal.fetch_add(1, Ordering::Relaxed);
        let renewal = LockRenewal::start(
            message.clone(),
            self.options.max_auto_renew_duration(),
            self.error_handler.clone(),
        );
        lock(&self.renewals).insert(id, renewal);
        Some(id)
    }

    fn stop_renewal(&self, id: u64) {
        if let Some(renewal) = lock(&self.renewals).remove(&id) {
            renewal.cancel();
        }
    }

    fn cancel_renewals(&self) {
        let renewals: Vec<_> = lock(&self.renewals).drain().map(|(_, r)| r).collect();
        for renewal in renewals {
            renewal.cancel();
        }
    }

    // ------------------------------------------------------------------------
    // Batches
    // ------------------------------------------------------------------------

    /// Collect up to `max_messages`, ending early on the wait limit, the idle
    /// timeout after the latest message, or a detach.
    pub async fn collect_batch(
        self: &Arc<Self>,
        max_messages: u32,
        max_wait: Option<Duration>,
    ) -> Result<Vec<ReceivedMessage>, ReceiverError> {
        if max_messages == 0 {
            return Err(ValidationError::OutOfRange {
                field: "max_messages".to_string(),
                message: "must be at least 1".to_string(),
            }
            .into());
        }
        if self.has_handler() {
            return Err(ReceiverError::amqp(
                ErrorCondition::InvalidOperation,
                format!("receiver '{}' is already receiving with a handler", self.link.name()),
            ));
        }
        let _guard = BatchGuard::acquire(&self.batch_in_progress).ok_or_else(|| {
            ReceiverError::BatchInProgress {
                name: self.link.name(),
            }
        })?;

        self.open().await?;
        let link = self.active_link().ok_or_else(|| self.closed_error())?;

        let mut batch: Vec<ReceivedMessage> = {
            let mut held_back = lock(&self.held_back);
            let count = held_back.len().min(max_messages as usize);
            held_back.drain(..count).collect()
        };
        if batch.len() >= max_messages as usize {
            return Ok(batch);
        }

        let (channel, mut messages) = mpsc::unbounded_channel();
        *lock(&self.intake) = Intake::Batch(channel);
        link.add_credit(max_messages - batch.len() as u32);

        let max_wait = max_wait.unwrap_or_else(|| self.batch_options.max_wait_time());
        let idle_timeout = self.batch_options.idle_timeout();
        let deadline = tokio::time::sleep(max_wait);
        tokio::pin!(deadline);

        loop {
            let started = !batch.is_empty();
            let idle = async move {
                if started {
                    tokio::time::sleep(idle_timeout).await
                } else {
                    std::future::pending::<()>().await
                }
            };

            tokio::select! {
                received = messages.recv() => match received {
                    Some(message) => {
                        batch.push(message);
                        if batch.len() >= max_messages as usize {
                            break;
                        }
                    }
                    None => break,
                },
                _ = &mut deadline => break,
                _ = idle => break,
            }
        }

        self.end_batch_intake();
        link.drain_credit();
        messages.close();
        while let Ok(late) = messages.try_recv() {
            self.release_late(late);
        }

        debug!(
            entity = %self.entity_path(),
            link = %link.name(),
            requested = max_messages,
            received = batch.len(),
            "Batch receive finished"
        );

        if batch.is_empty() && self.link.state() == LinkState::Closed {
            return Err(self.closed_error());
        }
        Ok(batch)
    }

    // ------------------------------------------------------------------------
    // Detach and Close
    // ------------------------------------------------------------------------

    /// React to an unsolicited detach of the link or its session.
    pub async fn on_detached(self: Arc<Self>, error: Option<ReceiverError>) {
        let decision = reconnect_decision(self.link.closed_by_us(), error.as_ref());
        if decision == ReconnectDecision::Ignore {
            return;
        }
        if !self.link.begin_detach() {
            debug!(
                entity = %self.entity_path(),
                link = %self.link.name(),
                state = %self.link.state(),
                "Detach ignored, link is not open"
            );
            return;
        }

        let previous = self.link.name();
        info!(
            entity = %self.entity_path(),
            link = %previous,
            role = %self.role,
            ?decision,
            error = ?error.as_ref().map(|e| e.to_string()),
            "Receiver link detached"
        );

        let error_surfaced = lock(&self.active)
            .as_ref()
            .is_some_and(|active| active.error_surfaced);
        self.pending.fail_all(|_| {
            ReceiverError::amqp(
                ErrorCondition::MessageLockLost,
                "the link was detached before the settlement was acknowledged",
            )
        });
        if let Err(close_error) = self.tear_down_link().await {
            debug!(link = %previous, error = %close_error, "Closing detached link failed");
        }

        if decision == ReconnectDecision::Surface {
            if let Some(error) = error.as_ref().filter(|_| !error_surfaced) {
                self.error_handler.on_error(error);
            }
            self.link.mark_closed();
            self.deregister();
            return;
        }

        let core = self.clone();
        let result = retry(
            move || {
                let core = core.clone();
                async move {
                    core.link.regenerate_name();
                    core.establish().await
                }
            },
            self.link_operation(),
            &self.reconnect,
        )
        .await;

        if let Err(error) = result {
            if self.link.closed_by_us() {
                return;
            }
            error!(
                entity = %self.entity_path(),
                role = %self.role,
                error = %error,
                "Receiver link could not be re-established"
            );
            self.link.mark_closed();
            self.end_batch_intake();
            self.deregister();
            self.error_handler.on_error(&error);
        }
    }

    /// Stop the current link: token renewal, event pump, link and cache entry.
    async fn tear_down_link(&self) -> Result<(), TransportError> {
        self.link.stop_token_renewal();
        self.end_batch_intake();

        let active = lock(&self.active).take();
        let Some(active) = active else {
            return Ok(());
        };

        active.pump.abort();
        let name = active.link.name().clone();
        let result = active.link.close().await;
        self.transport.remove_link(&name);
        result
    }

    /// Close the receiver. It never reconnects afterwards.
    pub async fn close(&self) -> Result<(), ReceiverError> {
        let previous = self.link.begin_close();
        self.cancel_renewals();

        let name = self.link.name();
        let failed = self.pending.fail_all(|_| ReceiverError::ReceiverClosed {
            name: name.clone(),
        });
        *lock(&self.intake) = Intake::Idle;
        let discarded = std::mem::take(&mut *lock(&self.held_back)).len();
        if discarded > 0 {
            warn!(
                entity = %self.entity_path(),
                link = %name,
                discarded,
                "Receiver closed with received messages never handed out"
            );
        }

        let result = self.tear_down_link().await;
        self.deregister();

        info!(
            entity = %self.entity_path(),
            link = %name,
            role = %self.role,
            previous_state = %previous,
            failed_settlements = failed,
            "Receiver closed"
        );
        result.map_err(ReceiverError::from)
    }
}

#[async_trait]
impl MessageSettler for ReceiverCore {
    async fn settle(
        &self,
        message: &ReceivedMessage,
        kind: SettlementKind,
        options: SettlementOptions,
    ) -> Result<(), ReceiverError> {
        if self.options.receive_mode == ReceiveMode::ReceiveAndDelete {
            return Err(ReceiverError::UnsupportedInMode {
                mode: self.options.receive_mode,
                operation: kind.to_string(),
            });
        }
        if message.is_settled() {
            return Err(ReceiverError::AlreadySettled {
                sequence_number: message.sequence_number(),
            });
        }

        let lock_lost = || {
            ReceiverError::amqp(
                ErrorCondition::MessageLockLost,
                "the link the message was received on is no longer open",
            )
        };
        let delivery = message.delivery_id().ok_or_else(lock_lost)?;
        let link = self
            .active_link()
            .filter(|link| Some(link.name()) == message.link_name())
            .ok_or_else(lock_lost)?;

        let acknowledged = self.pending.register(delivery)?;
        if let Err(error) = link.dispose(delivery, outcome_for(kind, &options)) {
            self.pending.withdraw(delivery);
            return Err(error.into());
        }
        debug!(
            entity = %self.entity_path(),
            link = %link.name(),
            %delivery,
            %kind,
            "Disposition sent"
        );

        if self.has_handler() {
            link.add_credit(1);
        }

        acknowledged
            .await
            .unwrap_or_else(|_| Err(self.closed_error()))?;
        message.mark_settled();
        Ok(())
    }

    async fn renew_lock(&self, message: &ReceivedMessage) -> Result<Timestamp, ReceiverError> {
        if self.options.receive_mode == ReceiveMode::ReceiveAndDelete {
            return Err(ReceiverError::UnsupportedInMode {
                mode: self.options.receive_mode,
                operation: "renew_lock".to_string(),
            });
        }
        let lock_token = message.lock_token().ok_or_else(|| ValidationError::Required {
            field: "lock_token".to_string(),
        })?;

        let locked_until = self.management.renew_lock(&lock_token).await?;
        message.set_locked_until(locked_until);
        Ok(locked_until)
    }
}

async fn pump_events(core: Weak<ReceiverCore>, link_name: LinkName, mut events: LinkEvents) {
    while let Some(event) = events.recv().await {
        let Some(core) = core.upgrade() else {
            return;
        };
        core.handle_event(&link_name, event);
    }
    debug!(link = %link_name, "Link event stream ended");
}

/// Marks a batch receive in progress until dropped.
struct BatchGuard<'a>(&'a AtomicBool);

impl<'a> BatchGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ============================================================================
// Streaming Receiver
// ============================================================================

/// Receiver delivering every message to a durable handler until closed.
///
/// Created by [`EntityContext::create_streaming_receiver`].
pub struct StreamingReceiver {
    core: Arc<ReceiverCore>,
}

impl StreamingReceiver {
    pub(crate) fn new(core: Arc<ReceiverCore>) -> Self {
        Self { core }
    }

    pub fn name(&self) -> LinkName {
        self.core.name()
    }

    pub fn entity_path(&self) -> &EntityPath {
        self.core.entity_path()
    }

    pub fn state(&self) -> LinkState {
        self.core.state()
    }

    pub fn is_open(&self) -> bool {
        self.core.is_open()
    }

    pub fn receive_mode(&self) -> ReceiveMode {
        self.core.options().receive_mode
    }

    /// Stop receiving. Renewals are cancelled and unacknowledged settlements fail.
    pub async fn close(&self) -> Result<(), ReceiverError> {
        self.core.close().await
    }
}

impl fmt::Debug for StreamingReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingReceiver")
            .field("name", &self.core.name())
            .field("state", &self.core.state())
            .finish()
    }
}
