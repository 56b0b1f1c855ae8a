//! Link entity lifecycle shared by senders and receivers.
//!
//! A link moves `Closed -> Connecting -> Open`. An unsolicited detach moves an
//! open link back to `Connecting` while it is re-established, or to `Closed`
//! when it must not be. All transitions are check-then-set inside a single
//! critical section, so two concurrent triggers can never both start an
//! establishment attempt.

use crate::config::TokenOptions;
use crate::error::{ReceiverError, TransportError};
use crate::lock;
use crate::message::{EntityPath, LinkName, Timestamp};
use crate::transport::{TokenInfo, TokenProvider};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "link_tests.rs"]
mod tests;

/// Connection state of a link entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Closed,
    Connecting,
    Open,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// What to do after a link or its session was detached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// The detach was initiated locally
    Ignore,
    /// Re-establish the link
    Reopen,
    /// Give up on the link and report the error
    Surface,
}

/// Decide how to react to a detach.
pub fn reconnect_decision(closed_by_us: bool, error: Option<&ReceiverError>) -> ReconnectDecision {
    if closed_by_us {
        return ReconnectDecision::Ignore;
    }

    match error {
        None => ReconnectDecision::Reopen,
        Some(error) if error.is_retryable() => ReconnectDecision::Reopen,
        Some(_) => ReconnectDecision::Surface,
    }
}

/// Delay before renegotiating a claim that expires at `expires_at`.
pub fn token_refresh_delay(expires_at: Timestamp, margin: Duration) -> Duration {
    let remaining = expires_at.duration_until();
    let delay = if remaining > margin {
        remaining - margin
    } else {
        remaining / 2
    };

    delay.max(Duration::from_secs(1))
}

struct LinkStatus {
    state: LinkState,
    name: LinkName,
    closed_by_us: bool,
}

/// State and claim handling of one named AMQP link.
pub(crate) struct LinkEntity {
    address: EntityPath,
    audience: String,
    status: Mutex<LinkStatus>,
    token_provider: Arc<dyn TokenProvider>,
    token_options: TokenOptions,
    token_renewal: Mutex<Option<JoinHandle<()>>>,
}

impl LinkEntity {
    pub fn new(
        address: EntityPath,
        audience: String,
        name: LinkName,
        token_provider: Arc<dyn TokenProvider>,
        token_options: TokenOptions,
    ) -> Self {
        Self {
            address,
            audience,
            status: Mutex::new(LinkStatus {
                state: LinkState::Closed,
                name,
                closed_by_us: false,
            }),
            token_provider,
            token_options,
            token_renewal: Mutex::new(None),
        }
    }

    fn status(&self) -> MutexGuard<'_, LinkStatus> {
        lock(&self.status)
    }

    pub fn address(&self) -> &EntityPath {
        &self.address
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    pub fn name(&self) -> LinkName {
        self.status().name.clone()
    }

    pub fn state(&self) -> LinkState {
        self.status().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == LinkState::Open
    }

    pub fn is_connecting(&self) -> bool {
        self.state() == LinkState::Connecting
    }

    pub fn closed_by_us(&self) -> bool {
        self.status().closed_by_us
    }

    /// Enter `Connecting` for a first establishment.
    ///
    /// Returns `Ok(false)` when the link is already open and
    /// `AlreadyConnecting` when another attempt is in flight.
    pub fn begin_connecting(&self) -> Result<bool, ReceiverError> {
        let mut status = self.status();
        match status.state {
            LinkState::Open => Ok(false),
            LinkState::Connecting => Err(ReceiverError::AlreadyConnecting {
                name: status.name.clone(),
            }),
            LinkState::Closed => {
                status.state = LinkState::Connecting;
                Ok(true)
            }
        }
    }

    /// Enter `Connecting` after an unsolicited detach.
    ///
    /// Only an open link that was not closed locally makes the transition;
    /// every other caller gets `false` and must not touch the link.
    pub fn begin_detach(&self) -> bool {
        let mut status = self.status();
        if status.state != LinkState::Open || status.closed_by_us {
            return false;
        }
        status.state = LinkState::Connecting;
        true
    }

    /// Mark the link closed locally, returning the previous state.
    pub fn begin_close(&self) -> LinkState {
        let mut status = self.status();
        status.closed_by_us = true;
        std::mem::replace(&mut status.state, LinkState::Closed)
    }

    /// Complete an establishment attempt. Has no effect after a local close.
    pub fn mark_open(&self) -> bool {
        let mut status = self.status();
        if status.closed_by_us {
            return false;
        }
        status.state = LinkState::Open;
        true
    }

    pub fn mark_closed(&self) {
        self.status().state = LinkState::Closed;
    }

    /// Replace the link name with a freshly generated one.
    pub fn regenerate_name(&self) -> LinkName {
        let name = LinkName::generate(&self.address);
        self.status().name = name.clone();
        name
    }

    /// Negotiate the claim the link needs before it is opened.
    pub async fn negotiate_claim(&self) -> Result<TokenInfo, ReceiverError> {
        self.token_provider
            .negotiate_claim(self.address.as_str(), &self.audience)
            .await
            .map_err(|e: TransportError| {
                warn!(entity = %self.address, error = %e, "Claim negotiation failed");
                ReceiverError::from(e)
            })
    }

    /// Renegotiate the claim ahead of each token expiry until stopped.
    pub fn schedule_token_renewal(&self, token: TokenInfo) {
        let task = tokio::spawn(renew_claims(
            self.token_provider.clone(),
            self.address.clone(),
            self.audience.clone(),
            self.token_options.renewal_margin(),
            token,
        ));

        let previous = lock(&self.token_renewal).replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub fn stop_token_renewal(&self) {
        let task = lock(&self.token_renewal).take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl Drop for LinkEntity {
    fn drop(&mut self) {
        self.stop_token_renewal();
    }
}

async fn renew_claims(
    provider: Arc<dyn TokenProvider>,
    address: EntityPath,
    audience: String,
    margin: Duration,
    mut token: TokenInfo,
) {
    loop {
        tokio::time::sleep(token_refresh_delay(token.expires_at, margin)).await;

        match provider.negotiate_claim(address.as_str(), &audience).await {
            Ok(renewed) => {
                debug!(entity = %address, expires_at = %renewed.expires_at, "Claim renewed");
                token = renewed;
            }
            Err(error) => {
                warn!(entity = %address, error = %error, "Claim renewal failed, renewal stopped");
                return;
            }
        }
    }
}
