//! Message sender.
//!
//! The sender opens its link lazily on the first send and follows the same
//! detach protocol as receivers: a remote detach without an error, or with a
//! retryable one, re-establishes the link under a new name.

use crate::context::EntityContext;
use crate::error::{ReceiverError, TransportError};
use crate::link::{reconnect_decision, LinkEntity, LinkState, ReconnectDecision};
use crate::lock;
use crate::message::{EntityPath, LinkName, Message};
use crate::retry::{retry, RetryOperationType, RetryPolicy};
use crate::transport::{AmqpTransport, LinkEvent, LinkEvents, SenderLink, SenderLinkOptions};
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "sender_tests.rs"]
mod tests;

struct ActiveSender {
    link: Arc<dyn SenderLink>,
    pump: JoinHandle<()>,
}

/// Sends messages to one entity.
///
/// Obtained from [`EntityContext::sender`]; every caller of the same entity
/// shares one sender.
pub struct MessageSender {
    link: LinkEntity,
    transport: Arc<dyn AmqpTransport>,
    context: Weak<EntityContext>,
    active: Mutex<Option<ActiveSender>>,
    reconnect: RetryPolicy,
    operation_retry: RetryPolicy,
    self_ref: Weak<MessageSender>,
}

impl MessageSender {
    pub(crate) fn new(context: &Arc<EntityContext>) -> Arc<Self> {
        let path = context.path().clone();
        let config = context.config();

        Arc::new_cyclic(|self_ref| Self {
            link: LinkEntity::new(
                path.clone(),
                context.audience().to_string(),
                LinkName::generate(&path),
                context.token_provider(),
                config.token.clone(),
            ),
            transport: context.transport(),
            context: Arc::downgrade(context),
            active: Mutex::new(None),
            reconnect: config.reconnect.clone(),
            operation_retry: config.operation_retry.clone(),
            self_ref: self_ref.clone(),
        })
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

    pub(crate) fn is_closed_by_us(&self) -> bool {
        self.link.closed_by_us()
    }

    /// Send a message, retrying retryable failures with the operation retry policy.
    pub async fn send(&self, message: Message) -> Result<(), ReceiverError> {
        let sender = self;
        let message = &message;
        retry(
            move || sender.try_send(message),
            RetryOperationType::SendMessage,
            &self.operation_retry,
        )
        .await
    }

    async fn try_send(&self, message: &Message) -> Result<(), ReceiverError> {
        self.open().await?;
        let link = lock(&self.active)
            .as_ref()
            .map(|active| active.link.clone())
            .ok_or_else(|| self.closed_error())?;

        link.send(message).await?;
        debug!(
            entity = %self.entity_path(),
            link = %link.name(),
            message_id = %message.message_id,
            "Message sent"
        );
        Ok(())
    }

    /// Open the link unless it is already open.
    pub async fn open(&self) -> Result<(), ReceiverError> {
        if self.link.closed_by_us() {
            return Err(self.closed_error());
        }
        if !self.link.begin_connecting()? {
            return Ok(());
        }

        let result = self.establish().await;
        if result.is_err() {
            self.link.mark_closed();
        }
        result
    }

    fn closed_error(&self) -> ReceiverError {
        ReceiverError::ReceiverClosed {
            name: self.link.name(),
        }
    }

    async fn establish(&self) -> Result<(), ReceiverError> {
        if self.link.closed_by_us() {
            return Err(self.closed_error());
        }

        let name = self.link.name();
        let token = self.link.negotiate_claim().await?;
        let opened = self
            .transport
            .open_sender(SenderLinkOptions {
                name: name.clone(),
                address: self.entity_path().clone(),
            })
            .await?;

        let pump = tokio::spawn(pump_events(
            self.self_ref.clone(),
            name.clone(),
            opened.events,
        ));
        *lock(&self.active) = Some(ActiveSender {
            link: opened.link,
            pump,
        });
        if !self.link.mark_open() {
            let orphan = lock(&self.active).take();
            if let Some(orphan) = orphan {
                orphan.pump.abort();
                let _ = orphan.link.close().await;
                self.transport.remove_link(&name);
            }
            return Err(self.closed_error());
        }
        self.link.schedule_token_renewal(token);

        if let (Some(context), Some(sender)) = (self.context.upgrade(), self.self_ref.upgrade()) {
            context.register_sender(&sender);
        }

        info!(entity = %self.entity_path(), link = %name, "Sender link established");
        Ok(())
    }

    fn handle_event(self: &Arc<Self>, link_name: &LinkName, event: LinkEvent) {
        match event {
            LinkEvent::LinkClosed(error) | LinkEvent::SessionClosed(error) => {
                if self.link.closed_by_us() || self.link.is_connecting() {
                    return;
                }
                let sender = self.clone();
                let error = error.map(ReceiverError::from);
                tokio::spawn(async move { sender.on_detached(error).await });
            }
            LinkEvent::LinkError(error) | LinkEvent::SessionError(error) => {
                warn!(entity = %self.entity_path(), link = %link_name, error = %error, "Sender link error");
            }
            LinkEvent::Message(_) | LinkEvent::Settled { .. } => {
                debug!(link = %link_name, "Ignoring receive-side event on a sender link");
            }
        }
    }

    /// React to an unsolicited detach of the link or its session.
    pub(crate) async fn on_detached(self: Arc<Self>, error: Option<ReceiverError>) {
        let decision = reconnect_decision(self.link.closed_by_us(), error.as_ref());
        if decision == ReconnectDecision::Ignore || !self.link.begin_detach() {
            return;
        }

        info!(
            entity = %self.entity_path(),
            link = %self.link.name(),
            ?decision,
            error = ?error.as_ref().map(|e| e.to_string()),
            "Sender link detached"
        );
        if let Err(close_error) = self.tear_down_link().await {
            debug!(error = %close_error, "Closing detached sender link failed");
        }

        if decision == ReconnectDecision::Surface {
            error!(
                entity = %self.entity_path(),
                error = ?error.as_ref().map(|e| e.to_string()),
                "Sender link detached with a non-retryable error"
            );
            self.link.mark_closed();
            self.deregister();
            return;
        }

        let sender = self.clone();
        let result = retry(
            move || {
                let sender = sender.clone();
                async move {
                    sender.link.regenerate_name();
                    sender.establish().await
                }
            },
            RetryOperationType::SenderLink,
            &self.reconnect,
        )
        .await;

        if let Err(failure) = result {
            if self.link.closed_by_us() {
                return;
            }
            error!(
                entity = %self.entity_path(),
                error = %failure,
                "Sender link could not be re-established"
            );
            self.link.mark_closed();
            self.deregister();
        }
    }

    async fn tear_down_link(&self) -> Result<(), TransportError> {
        self.link.stop_token_renewal();

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

    fn deregister(&self) {
        if let Some(context) = self.context.upgrade() {
            context.deregister_sender(self);
        }
    }

    /// Close the sender. It never reconnects afterwards.
    pub async fn close(&self) -> Result<(), ReceiverError> {
        let previous = self.link.begin_close();
        let result = self.tear_down_link().await;
        self.deregister();

        info!(
            entity = %self.entity_path(),
            link = %self.link.name(),
            previous_state = %previous,
            "Sender closed"
        );
        result.map_err(ReceiverError::from)
    }
}

async fn pump_events(sender: Weak<MessageSender>, link_name: LinkName, mut events: LinkEvents) {
    while let Some(event) = events.recv().await {
        let Some(sender) = sender.upgrade() else {
            return;
        };
        sender.handle_event(&link_name, event);
    }
}
