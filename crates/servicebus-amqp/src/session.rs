//! Session-scoped receiver.
//!
//! A session receiver holds the broker's exclusive lock on one session. The
//! session is chosen when the receiver is accepted, either by id or as the
//! next available one, and is kept when the link is re-established after a
//! detach.

use crate::error::{ReceiverError, ValidationError};
use crate::link::LinkState;
use crate::message::{EntityPath, LinkName, ReceivedMessage, SessionId, Timestamp};
use crate::receiver::{MessageHandler, ReceiverCore};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;

/// Receiver locked to a single session.
///
/// Created by [`crate::context::EntityContext::accept_session`].
pub struct SessionReceiver {
    core: Arc<ReceiverCore>,
    session_id: SessionId,
}

impl SessionReceiver {
    pub(crate) fn new(core: Arc<ReceiverCore>) -> Result<Self, ReceiverError> {
        let session_id = core.session_id().ok_or_else(|| ValidationError::Required {
            field: "session_id".to_string(),
        })?;
        Ok(Self { core, session_id })
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Expiry of the session lock, including explicit renewals
    pub fn session_locked_until(&self) -> Option<Timestamp> {
        self.core.session_locked_until()
    }

    /// Deliver the session's messages to `handler` until the receiver closes.
    pub fn receive(&self, handler: Arc<dyn MessageHandler>) -> Result<(), ReceiverError> {
        self.core.start_handler(handler)
    }

    /// Receive up to `max_messages` of the session's messages.
    pub async fn receive_batch(
        &self,
        max_messages: u32,
        max_wait: Option<Duration>,
    ) -> Result<Vec<ReceivedMessage>, ReceiverError> {
        self.core.collect_batch(max_messages, max_wait).await
    }

    /// Extend the session lock through the management channel.
    pub async fn renew_session_lock(&self) -> Result<Timestamp, ReceiverError> {
        let locked_until = self
            .core
            .management()
            .renew_session_lock(&self.session_id)
            .await?;
        self.core.set_session_locked_until(locked_until);

        debug!(
            entity = %self.core.entity_path(),
            session_id = %self.session_id,
            %locked_until,
            "Session lock renewed"
        );
        Ok(locked_until)
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

    /// Close the receiver and release the session.
    pub async fn close(&self) -> Result<(), ReceiverError> {
        self.core.close().await
    }
}

impl fmt::Debug for SessionReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionReceiver")
            .field("session_id", &self.session_id)
            .field("name", &self.core.name())
            .field("state", &self.core.state())
            .finish()
    }
}
