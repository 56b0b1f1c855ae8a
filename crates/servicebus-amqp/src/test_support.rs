//! Shared fixtures for unit tests: an entity context over the in-memory
//! collaborators, a scripted message handler and an error recorder.

use crate::config::{ClientConfig, ReceiverOptions};
use crate::context::EntityContext;
use crate::error::ReceiverError;
use crate::message::{BrokeredMessage, EntityPath, ReceivedMessage};
use crate::providers::memory::{InMemoryManagementClient, InMemoryTokenProvider, InMemoryTransport};
use crate::receiver::{ErrorHandler, MessageHandler};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(crate) struct Fixture {
    pub transport: InMemoryTransport,
    pub management: Arc<InMemoryManagementClient>,
    pub tokens: Arc<InMemoryTokenProvider>,
    pub entity: Arc<EntityContext>,
    pub errors: Arc<RecordingErrors>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    pub fn with_config(config: ClientConfig) -> Self {
        let transport = InMemoryTransport::new();
        let management = Arc::new(InMemoryManagementClient::new());
        let tokens = Arc::new(InMemoryTokenProvider::new());
        let entity = EntityContext::new(
            "orders".parse::<EntityPath>().expect("Valid entity path"),
            "sb://example.servicebus.windows.net/orders".to_string(),
            Arc::new(transport.clone()),
            tokens.clone(),
            management.clone(),
            config,
        );

        Self {
            transport,
            management,
            tokens,
            entity,
            errors: Arc::new(RecordingErrors::default()),
        }
    }

    pub fn error_handler(&self) -> Arc<dyn ErrorHandler> {
        self.errors.clone()
    }
}

/// Receiver options with auto-complete on and the given concurrency
pub(crate) fn peek_lock_options(max_concurrent_calls: u32) -> ReceiverOptions {
    ReceiverOptions {
        max_concurrent_calls,
        auto_complete: true,
        ..ReceiverOptions::default()
    }
}

pub(crate) fn message(body: &'static str, sequence_number: i64) -> BrokeredMessage {
    BrokeredMessage::new(Bytes::from_static(body.as_bytes())).with_sequence_number(sequence_number)
}

/// Let spawned tasks run; with paused time this also fires due timers.
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

// ============================================================================
// Handlers
// ============================================================================

/// Error handler recording error codes in arrival order
#[derive(Default)]
pub(crate) struct RecordingErrors {
    codes: Mutex<Vec<String>>,
}

impl RecordingErrors {
    pub fn codes(&self) -> Vec<String> {
        self.codes.lock().unwrap().clone()
    }
}

impl ErrorHandler for RecordingErrors {
    fn on_error(&self, error: &ReceiverError) {
        self.codes.lock().unwrap().push(error.code().to_string());
    }
}

type HandlerOutcome = Box<dyn Fn(&ReceivedMessage) -> anyhow::Result<()> + Send + Sync>;

/// Message handler that sleeps, records the message and returns a scripted result
pub(crate) struct ScriptedHandler {
    delay: Duration,
    outcome: HandlerOutcome,
    seen: Mutex<Vec<ReceivedMessage>>,
}

impl ScriptedHandler {
    pub fn succeeding() -> Arc<Self> {
        Self::new(Duration::ZERO, Box::new(|_| Ok(())))
    }

    pub fn sleeping(delay: Duration) -> Arc<Self> {
        Self::new(delay, Box::new(|_| Ok(())))
    }

    pub fn failing(error: fn() -> anyhow::Error) -> Arc<Self> {
        Self::new(Duration::ZERO, Box::new(move |_| Err(error())))
    }

    pub fn new(delay: Duration, outcome: HandlerOutcome) -> Arc<Self> {
        Arc::new(Self {
            delay,
            outcome,
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn seen(&self) -> Vec<ReceivedMessage> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageHandler for ScriptedHandler {
    async fn handle(&self, message: &ReceivedMessage) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(message.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.outcome)(message)
    }
}
