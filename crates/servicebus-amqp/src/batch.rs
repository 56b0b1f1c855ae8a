//! Batching receiver.
//!
//! Each [`BatchingReceiver::receive_batch`] call grants temporary credit for
//! the requested count and resolves once with the messages that arrived, in
//! arrival order.

use crate::error::ReceiverError;
use crate::link::LinkState;
use crate::message::{EntityPath, LinkName, ReceivedMessage};
use crate::receiver::ReceiverCore;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[cfg(test)]
#[path = "batch_tests.rs"]
mod tests;

/// Receiver returning messages in batches on request.
///
/// Created by [`crate::context::EntityContext::create_batching_receiver`]. The
/// link is opened by the first batch request.
pub struct BatchingReceiver {
    core: Arc<ReceiverCore>,
}

impl BatchingReceiver {
    pub(crate) fn new(core: Arc<ReceiverCore>) -> Self {
        Self { core }
    }

    /// Receive up to `max_messages`.
    ///
    /// Resolves when the count is reached, `max_wait` (default from
    /// `BatchOptions::max_wait_time_secs`) elapses, no message arrives for the
    /// idle timeout after the latest one, or the link detaches. Only one batch
    /// may be in flight per receiver.
    pub async fn receive_batch(
        &self,
        max_messages: u32,
        max_wait: Option<Duration>,
    ) -> Result<Vec<ReceivedMessage>, ReceiverError> {
        self.core.collect_batch(max_messages, max_wait).await
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

    pub async fn close(&self) -> Result<(), ReceiverError> {
        self.core.close().await
    }
}

impl fmt::Debug for BatchingReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchingReceiver")
            .field("name", &self.core.name())
            .field("state", &self.core.state())
            .finish()
    }
}
