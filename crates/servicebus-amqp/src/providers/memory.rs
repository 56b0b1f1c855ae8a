//! In-memory collaborators for testing and development.
//!
//! This module provides in-memory implementations of every external interface
//! the link engine depends on:
//! - [`InMemoryTransport`] opens receiver and sender links backed by local
//!   queues, honours link credit and session locks, and records dispositions
//! - [`InMemoryManagementClient`] answers lock renewal, deferred receive and
//!   disposition requests
//! - [`InMemoryTokenProvider`] grants claims with a fixed validity
//!
//! Each type also exposes inspection and fault-injection helpers so tests can
//! drive detaches, failures and slow acknowledgements.

use crate::config::ReceiveMode;
use crate::error::{conditions, TransportError};
use crate::lock;
use crate::message::{
    BrokeredMessage, Delivery, DeliveryId, LinkName, LockToken, Message, SessionId,
    SettlementKind, SettlementOptions, Timestamp,
};
use crate::transport::{
    AmqpTransport, LinkEvent, ManagementClient, OpenedReceiver, OpenedSender, Outcome,
    ReceiverLink, ReceiverLinkOptions, SenderLink, SenderLinkOptions, SessionFilter, TokenInfo,
    TokenProvider,
};
use async_trait::async_trait;
use chrono::Duration;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

fn pop_failure(failures: &mut VecDeque<TransportError>) -> Result<(), TransportError> {
    match failures.pop_front() {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Shared state of the in-memory transport
struct TransportState {
    lock_duration: Duration,
    open_delay: Option<std::time::Duration>,
    receiver_opens: Vec<ReceiverLinkOptions>,
    sender_opens: Vec<SenderLinkOptions>,
    open_failures: VecDeque<TransportError>,
    receivers: Vec<Arc<InMemoryReceiverLink>>,
    senders: Vec<Arc<InMemorySenderLink>>,
    removed_links: Vec<LinkName>,
    /// Known sessions and whether a link currently holds their lock
    sessions: BTreeMap<SessionId, bool>,
    sent: Vec<Message>,
    send_failures: VecDeque<TransportError>,
}

impl TransportState {
    fn lock_session(&mut self, filter: &SessionFilter) -> Result<SessionId, TransportError> {
        let session_id = match filter {
            SessionFilter::Named(id) => {
                if self.sessions.get(id).copied().unwrap_or(false) {
                    return Err(TransportError::new(
                        conditions::SESSION_CANNOT_BE_LOCKED,
                        format!("session '{}' is locked by another link", id),
                    ));
                }
                id.clone()
            }
            SessionFilter::Next => self
                .sessions
                .iter()
                .find(|(_, locked)| !**locked)
                .map(|(id, _)| id.clone())
                .ok_or_else(|| {
                    TransportError::new(conditions::TIMEOUT, "no unlocked session is available")
                })?,
        };

        self.sessions.insert(session_id.clone(), true);
        Ok(session_id)
    }

    fn release_session(&mut self, session_id: &SessionId) {
        if let Some(locked) = self.sessions.get_mut(session_id) {
            *locked = false;
        }
    }
}

/// In-memory AMQP transport
#[derive(Clone)]
pub struct InMemoryTransport {
    state: Arc<Mutex<TransportState>>,
}

impl InMemoryTransport {
    /// Create a transport whose peek-locked deliveries hold a 30 second lock
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TransportState {
                lock_duration: Duration::seconds(30),
                open_delay: None,
                receiver_opens: Vec::new(),
                sender_opens: Vec::new(),
                open_failures: VecDeque::new(),
                receivers: Vec::new(),
                senders: Vec::new(),
                removed_links: Vec::new(),
                sessions: BTreeMap::new(),
                sent: Vec::new(),
                send_failures: VecDeque::new(),
            })),
        }
    }

    /// Lock duration applied to peek-locked deliveries that carry no lock
    pub fn with_lock_duration(self, lock_duration: Duration) -> Self {
        lock(&self.state).lock_duration = lock_duration;
        self
    }

    /// Make every link open take `delay`
    pub fn set_open_delay(&self, delay: std::time::Duration) {
        lock(&self.state).open_delay = Some(delay);
    }

    /// Fail the next `count` link opens with `error`
    pub fn fail_next_opens(&self, count: usize, error: TransportError) {
        let mut state = lock(&self.state);
        for _ in 0..count {
            state.open_failures.push_back(error.clone());
        }
    }

    /// Fail the next `count` sends with `error`
    pub fn fail_next_sends(&self, count: usize, error: TransportError) {
        let mut state = lock(&self.state);
        for _ in 0..count {
            state.send_failures.push_back(error.clone());
        }
    }

    /// Make a session available for session receivers
    pub fn add_session(&self, session_id: SessionId) {
        lock(&self.state).sessions.entry(session_id).or_insert(false);
    }

    pub fn is_session_locked(&self, session_id: &SessionId) -> bool {
        lock(&self.state)
            .sessions
            .get(session_id)
            .copied()
            .unwrap_or(false)
    }

    /// Every receiver open request, including failed ones
    pub fn receiver_opens(&self) -> Vec<ReceiverLinkOptions> {
        lock(&self.state).receiver_opens.clone()
    }

    /// Every sender open request, including failed ones
    pub fn sender_opens(&self) -> Vec<SenderLinkOptions> {
        lock(&self.state).sender_opens.clone()
    }

    /// Successfully opened receiver links, oldest first
    pub fn receivers(&self) -> Vec<Arc<InMemoryReceiverLink>> {
        lock(&self.state).receivers.clone()
    }

    pub fn latest_receiver(&self) -> Option<Arc<InMemoryReceiverLink>> {
        lock(&self.state).receivers.last().cloned()
    }

    pub fn latest_sender(&self) -> Option<Arc<InMemorySenderLink>> {
        lock(&self.state).senders.last().cloned()
    }

    /// Link names removed from the link cache
    pub fn removed_links(&self) -> Vec<LinkName> {
        lock(&self.state).removed_links.clone()
    }

    /// Messages accepted by sender links
    pub fn sent_messages(&self) -> Vec<Message> {
        lock(&self.state).sent.clone()
    }

    async fn delay_open(&self) {
        let delay = lock(&self.state).open_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AmqpTransport for InMemoryTransport {
    async fn open_receiver(
        &self,
        options: ReceiverLinkOptions,
    ) -> Result<OpenedReceiver, TransportError> {
        self.delay_open().await;

        let mut state = lock(&self.state);
        state.receiver_opens.push(options.clone());
        pop_failure(&mut state.open_failures)?;

        let session_id = match &options.session {
            Some(filter) => Some(state.lock_session(filter)?),
            None => None,
        };
        let session_locked_until = session_id
            .as_ref()
            .map(|_| Timestamp::from_now(state.lock_duration));

        let (events_tx, events) = mpsc::unbounded_channel();
        let link = Arc::new(InMemoryReceiverLink {
            name: options.name,
            receive_mode: options.receive_mode,
            session_id,
            session_locked_until,
            lock_duration: state.lock_duration,
            events: events_tx,
            transport: Arc::downgrade(&self.state),
            state: Mutex::new(ReceiverLinkState::default()),
        });
        state.receivers.push(link.clone());

        Ok(OpenedReceiver { link, events })
    }

    async fn open_sender(
        &self,
        options: SenderLinkOptions,
    ) -> Result<OpenedSender, TransportError> {
        self.delay_open().await;

        let mut state = lock(&self.state);
        state.sender_opens.push(options.clone());
        pop_failure(&mut state.open_failures)?;

        let (events_tx, events) = mpsc::unbounded_channel();
        let link = Arc::new(InMemorySenderLink {
            name: options.name,
            events: events_tx,
            transport: Arc::downgrade(&self.state),
            closed: Mutex::new(false),
        });
        state.senders.push(link.clone());

        Ok(OpenedSender { link, events })
    }

    fn remove_link(&self, name: &LinkName) {
        lock(&self.state).removed_links.push(name.clone());
    }
}

// ============================================================================
// Receiver Link
// ============================================================================

struct ReceiverLinkState {
    credit: u32,
    backlog: VecDeque<BrokeredMessage>,
    next_delivery: u32,
    dispositions: Vec<(DeliveryId, Outcome)>,
    auto_acknowledge: bool,
    acknowledge_error: Option<TransportError>,
    closed: bool,
}

impl Default for ReceiverLinkState {
    fn default() -> Self {
        Self {
            credit: 0,
            backlog: VecDeque::new(),
            next_delivery: 0,
            dispositions: Vec::new(),
            auto_acknowledge: true,
            acknowledge_error: None,
            closed: false,
        }
    }
}

/// Receiver link over a local backlog of messages
pub struct InMemoryReceiverLink {
    name: LinkName,
    receive_mode: ReceiveMode,
    session_id: Option<SessionId>,
    session_locked_until: Option<Timestamp>,
    lock_duration: Duration,
    events: mpsc::UnboundedSender<LinkEvent>,
    transport: Weak<Mutex<TransportState>>,
    state: Mutex<ReceiverLinkState>,
}

impl InMemoryReceiverLink {
    /// Queue a message; it is transferred as soon as credit allows
    pub fn deliver(&self, message: BrokeredMessage) {
        let mut state = lock(&self.state);
        state.backlog.push_back(message);
        self.flush(&mut state);
    }

    fn flush(&self, state: &mut ReceiverLinkState) {
        while state.credit > 0 && !state.closed {
            let Some(mut message) = state.backlog.pop_front() else {
                break;
            };
            if self.receive_mode == ReceiveMode::PeekLock && message.lock_token.is_none() {
                message = message.with_lock(LockToken::new(), Timestamp::from_now(self.lock_duration));
            }
            if message.session_id.is_none() {
                message.session_id = self.session_id.clone();
            }

            let id = DeliveryId::new(state.next_delivery);
            state.next_delivery += 1;
            state.credit -= 1;
            let _ = self.events.send(LinkEvent::Message(Delivery { id, message }));
        }
    }

    /// Outstanding link credit
    pub fn credit(&self) -> u32 {
        lock(&self.state).credit
    }

    /// Messages waiting for credit
    pub fn backlog_len(&self) -> usize {
        lock(&self.state).backlog.len()
    }

    /// Every disposition issued on this link, in order
    pub fn dispositions(&self) -> Vec<(DeliveryId, Outcome)> {
        lock(&self.state).dispositions.clone()
    }

    /// Dispositions mapped back to the settlement kinds that produced them
    pub fn settled_kinds(&self) -> Vec<SettlementKind> {
        lock(&self.state)
            .dispositions
            .iter()
            .map(|(_, outcome)| match outcome {
                Outcome::Accepted => SettlementKind::Complete,
                Outcome::Modified {
                    undeliverable_here: true,
                    ..
                } => SettlementKind::Defer,
                Outcome::Modified { .. } => SettlementKind::Abandon,
                Outcome::Rejected { .. } => SettlementKind::DeadLetter,
            })
            .collect()
    }

    /// Stop echoing settlement acknowledgements for dispositions
    pub fn set_auto_acknowledge(&self, enabled: bool) {
        lock(&self.state).auto_acknowledge = enabled;
    }

    /// Error returned in subsequent settlement acknowledgements
    pub fn set_acknowledge_error(&self, error: Option<TransportError>) {
        lock(&self.state).acknowledge_error = error;
    }

    /// Acknowledge a disposition explicitly
    pub fn acknowledge(&self, delivery: DeliveryId, error: Option<TransportError>) {
        let _ = self.events.send(LinkEvent::Settled { delivery, error });
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Raise an arbitrary link event
    pub fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    /// Detach the link from the broker side
    pub fn close_remotely(&self, error: Option<TransportError>) {
        self.shut();
        let _ = self.events.send(LinkEvent::LinkClosed(error));
    }

    /// End the link's session from the broker side
    pub fn close_session_remotely(&self, error: Option<TransportError>) {
        self.shut();
        let _ = self.events.send(LinkEvent::SessionClosed(error));
    }

    fn shut(&self) {
        lock(&self.state).closed = true;
        if let (Some(session_id), Some(transport)) = (&self.session_id, self.transport.upgrade()) {
            lock(&transport).release_session(session_id);
        }
    }
}

#[async_trait]
impl ReceiverLink for InMemoryReceiverLink {
    fn name(&self) -> &LinkName {
        &self.name
    }

    fn session_id(&self) -> Option<SessionId> {
        self.session_id.clone()
    }

    fn session_locked_until(&self) -> Option<Timestamp> {
        self.session_locked_until
    }

    fn add_credit(&self, credit: u32) {
        let mut state = lock(&self.state);
        state.credit += credit;
        self.flush(&mut state);
    }

    fn drain_credit(&self) {
        lock(&self.state).credit = 0;
    }

    fn dispose(&self, delivery: DeliveryId, outcome: Outcome) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(TransportError::new(
                conditions::DETACH_FORCED,
                format!("link '{}' is detached", self.name),
            ));
        }

        state.dispositions.push((delivery, outcome));
        if state.auto_acknowledge {
            let error = state.acknowledge_error.clone();
            let _ = self.events.send(LinkEvent::Settled { delivery, error });
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shut();
        Ok(())
    }
}

// ============================================================================
// Sender Link
// ============================================================================

/// Sender link recording the messages it transfers
pub struct InMemorySenderLink {
    name: LinkName,
    events: mpsc::UnboundedSender<LinkEvent>,
    transport: Weak<Mutex<TransportState>>,
    closed: Mutex<bool>,
}

impl InMemorySenderLink {
    pub fn is_closed(&self) -> bool {
        *lock(&self.closed)
    }

    /// Detach the link from the broker side
    pub fn close_remotely(&self, error: Option<TransportError>) {
        *lock(&self.closed) = true;
        let _ = self.events.send(LinkEvent::LinkClosed(error));
    }
}

#[async_trait]
impl SenderLink for InMemorySenderLink {
    fn name(&self) -> &LinkName {
        &self.name
    }

    async fn send(&self, message: &Message) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::new(
                conditions::DETACH_FORCED,
                format!("link '{}' is detached", self.name),
            ));
        }

        let transport = self
            .transport
            .upgrade()
            .ok_or_else(|| TransportError::io("transport dropped"))?;
        let mut state = lock(&transport);
        pop_failure(&mut state.send_failures)?;
        state.sent.push(message.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        *lock(&self.closed) = true;
        Ok(())
    }
}

// ============================================================================
// Management Client
// ============================================================================

#[derive(Default)]
struct ManagementState {
    renewed_tokens: Vec<LockToken>,
    renew_failures: VecDeque<TransportError>,
    deferred: HashMap<i64, BrokeredMessage>,
    dispositions: Vec<(LockToken, SettlementKind, SettlementOptions)>,
    session_renewals: Vec<SessionId>,
    closed: bool,
}

/// Management channel answering from local state
pub struct InMemoryManagementClient {
    lock_duration: Duration,
    state: Mutex<ManagementState>,
}

impl InMemoryManagementClient {
    pub fn new() -> Self {
        Self::with_lock_duration(Duration::seconds(30))
    }

    /// Duration of locks granted by renewals and deferred receives
    pub fn with_lock_duration(lock_duration: Duration) -> Self {
        Self {
            lock_duration,
            state: Mutex::new(ManagementState::default()),
        }
    }

    /// Store a deferred message, retrievable by its sequence number
    pub fn add_deferred(&self, message: BrokeredMessage) {
        lock(&self.state)
            .deferred
            .insert(message.sequence_number, message);
    }

    /// Fail the next `count` lock renewals with `error`
    pub fn fail_next_renewals(&self, count: usize, error: TransportError) {
        let mut state = lock(&self.state);
        for _ in 0..count {
            state.renew_failures.push_back(error.clone());
        }
    }

    /// Lock tokens of every renewal request, including failed ones
    pub fn renewed_tokens(&self) -> Vec<LockToken> {
        lock(&self.state).renewed_tokens.clone()
    }

    pub fn renew_count(&self) -> usize {
        lock(&self.state).renewed_tokens.len()
    }

    /// Settlements issued over the management channel
    pub fn dispositions(&self) -> Vec<(LockToken, SettlementKind)> {
        lock(&self.state)
            .dispositions
            .iter()
            .map(|(token, kind, _)| (*token, *kind))
            .collect()
    }

    pub fn session_renewals(&self) -> Vec<SessionId> {
        lock(&self.state).session_renewals.clone()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

impl Default for InMemoryManagementClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ManagementClient for InMemoryManagementClient {
    async fn renew_lock(&self, lock_token: &LockToken) -> Result<Timestamp, TransportError> {
        let mut state = lock(&self.state);
        state.renewed_tokens.push(*lock_token);
        pop_failure(&mut state.renew_failures)?;
        Ok(Timestamp::from_now(self.lock_duration))
    }

    async fn update_disposition(
        &self,
        lock_token: &LockToken,
        kind: SettlementKind,
        options: &SettlementOptions,
    ) -> Result<(), TransportError> {
        lock(&self.state)
            .dispositions
            .push((*lock_token, kind, options.clone()));
        Ok(())
    }

    async fn receive_deferred(
        &self,
        sequence_numbers: &[i64],
        receive_mode: ReceiveMode,
    ) -> Result<Vec<BrokeredMessage>, TransportError> {
        let mut state = lock(&self.state);
        if let Some(missing) = sequence_numbers
            .iter()
            .find(|sequence| !state.deferred.contains_key(*sequence))
        {
            return Err(TransportError::new(
                conditions::MESSAGE_NOT_FOUND,
                format!("no deferred message with sequence number {}", missing),
            ));
        }

        let messages = sequence_numbers
            .iter()
            .filter_map(|sequence| state.deferred.remove(sequence))
            .map(|message| match receive_mode {
                ReceiveMode::PeekLock => {
                    message.with_lock(LockToken::new(), Timestamp::from_now(self.lock_duration))
                }
                ReceiveMode::ReceiveAndDelete => message,
            })
            .collect();
        Ok(messages)
    }

    async fn renew_session_lock(
        &self,
        session_id: &SessionId,
    ) -> Result<Timestamp, TransportError> {
        lock(&self.state).session_renewals.push(session_id.clone());
        Ok(Timestamp::from_now(self.lock_duration))
    }

    async fn close(&self) -> Result<(), TransportError> {
        lock(&self.state).closed = true;
        Ok(())
    }
}

// ============================================================================
// Token Provider
// ============================================================================

#[derive(Default)]
struct TokenState {
    claims: Vec<(String, String)>,
    failures: VecDeque<TransportError>,
}

/// Claim negotiator granting tokens with a fixed validity
pub struct InMemoryTokenProvider {
    validity: Duration,
    state: Mutex<TokenState>,
}

impl InMemoryTokenProvider {
    /// Grant one-hour tokens
    pub fn new() -> Self {
        Self::with_validity(Duration::hours(1))
    }

    pub fn with_validity(validity: Duration) -> Self {
        Self {
            validity,
            state: Mutex::new(TokenState::default()),
        }
    }

    /// Fail the next `count` negotiations with `error`
    pub fn fail_next(&self, count: usize, error: TransportError) {
        let mut state = lock(&self.state);
        for _ in 0..count {
            state.failures.push_back(error.clone());
        }
    }

    /// (address, audience) of every negotiation, including failed ones
    pub fn claims(&self) -> Vec<(String, String)> {
        lock(&self.state).claims.clone()
    }

    pub fn claim_count(&self) -> usize {
        lock(&self.state).claims.len()
    }
}

impl Default for InMemoryTokenProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenProvider for InMemoryTokenProvider {
    async fn negotiate_claim(
        &self,
        address: &str,
        audience: &str,
    ) -> Result<TokenInfo, TransportError> {
        let mut state = lock(&self.state);
        state
            .claims
            .push((address.to_string(), audience.to_string()));
        pop_failure(&mut state.failures)?;

        Ok(TokenInfo {
            expires_at: Timestamp::from_now(self.validity),
        })
    }
}
