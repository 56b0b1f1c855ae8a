//! Common test utilities for servicebus-amqp integration tests
//!
//! This module provides:
//! - A harness wiring an entity context to the in-memory collaborators
//! - A configurable message handler that records what it sees
//! - An error log usable as the receiver error handler

use async_trait::async_trait;
use bytes::Bytes;
use servicebus_amqp::providers::memory::{
    InMemoryManagementClient, InMemoryTokenProvider, InMemoryTransport,
};
use servicebus_amqp::{
    BrokeredMessage, ClientConfig, EntityContext, EntityPath, ErrorHandler, MessageHandler,
    ReceivedMessage, ReceiverError, ReceiverOptions,
};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

static TRACING: Once = Once::new();

/// Route library logs to the test output, filtered by `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// Harness
// ============================================================================

#[allow(dead_code)]
pub struct Harness {
    pub transport: InMemoryTransport,
    pub management: Arc<InMemoryManagementClient>,
    pub tokens: Arc<InMemoryTokenProvider>,
    pub entity: Arc<EntityContext>,
    pub errors: Arc<ErrorLog>,
}

#[allow(dead_code)]
impl Harness {
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    pub fn with_config(config: ClientConfig) -> Self {
        init_tracing();

        let transport = InMemoryTransport::new();
        let management = Arc::new(InMemoryManagementClient::new());
        let tokens = Arc::new(InMemoryTokenProvider::new());
        let path: EntityPath = "orders".parse().expect("Valid entity path");
        let entity = EntityContext::new(
            path,
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
            errors: Arc::new(ErrorLog::default()),
        }
    }

    pub fn error_handler(&self) -> Arc<dyn ErrorHandler> {
        self.errors.clone()
    }
}

/// Peek-lock options with auto-complete and the given concurrency
#[allow(dead_code)]
pub fn auto_complete_options(max_concurrent_calls: u32) -> ReceiverOptions {
    ReceiverOptions {
        max_concurrent_calls,
        auto_complete: true,
        ..ReceiverOptions::default()
    }
}

#[allow(dead_code)]
pub fn brokered(sequence_number: i64) -> BrokeredMessage {
    BrokeredMessage::new(Bytes::from(format!("order-{}", sequence_number)))
        .with_sequence_number(sequence_number)
}

/// Let spawned tasks run; with paused time this also fires due timers.
#[allow(dead_code)]
pub async fn yield_to_tasks() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

// ============================================================================
// Error Log
// ============================================================================

/// Error handler keeping the code of every reported error
#[derive(Default)]
pub struct ErrorLog {
    codes: Mutex<Vec<String>>,
}

#[allow(dead_code)]
impl ErrorLog {
    pub fn codes(&self) -> Vec<String> {
        self.codes.lock().unwrap().clone()
    }
}

impl ErrorHandler for ErrorLog {
    fn on_error(&self, error: &ReceiverError) {
        self.codes.lock().unwrap().push(error.code().to_string());
    }
}

// ============================================================================
// Mock Message Handler
// ============================================================================

type ResultFactory = Box<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

/// Message handler with a configurable processing time and result
#[allow(dead_code)]
pub struct MockHandler {
    processing_time: Duration,
    result_factory: ResultFactory,
    seen: Mutex<Vec<ReceivedMessage>>,
}

#[allow(dead_code)]
impl MockHandler {
    pub fn new(processing_time: Duration) -> Arc<Self> {
        Self::with_result(processing_time, Box::new(|| Ok(())))
    }

    pub fn with_result(processing_time: Duration, result_factory: ResultFactory) -> Arc<Self> {
        Arc::new(Self {
            processing_time,
            result_factory,
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn seen(&self) -> Vec<ReceivedMessage> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageHandler for MockHandler {
    async fn handle(&self, message: &ReceivedMessage) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(message.clone());
        tokio::time::sleep(self.processing_time).await;
        (self.result_factory)()
    }
}
