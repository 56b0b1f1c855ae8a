//! Per-message lock renewal.
//!
//! While a handler processes a peek-locked message, a [`LockRenewal`] task
//! extends the lock shortly before it expires, until the auto-renew window
//! ends. The receiver cancels the task as soon as the handler returns and
//! before any settlement of the message is attempted.

use crate::message::{ReceivedMessage, Timestamp};
use crate::receiver::ErrorHandler;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "renewal_tests.rs"]
mod tests;

/// Upper bound on how early a lock is renewed.
pub const MAX_RENEWAL_LEAD: Duration = Duration::from_secs(10);

/// Delay before renewing a lock that expires at `locked_until`.
///
/// The lock is renewed `min(remaining / 2, 10s)` before it expires, or right
/// away when less than a second remains.
pub fn renew_after(locked_until: Timestamp) -> Duration {
    let remaining = locked_until.duration_until();
    if remaining < Duration::from_secs(1) {
        return Duration::ZERO;
    }

    remaining - (remaining / 2).min(MAX_RENEWAL_LEAD)
}

/// Cancellable lock renewal task owned by one in-flight message.
pub(crate) struct LockRenewal {
    cancelled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl LockRenewal {
    /// Start renewing the lock of `message` until `window` has elapsed.
    pub fn start(
        message: ReceivedMessage,
        window: Duration,
        errors: Arc<dyn ErrorHandler>,
    ) -> Self {
        let cancelled = Arc::new(AtomicBool::new(false));
        let deadline = Instant::now() + window;
        let task = tokio::spawn(renew_until(message, deadline, cancelled.clone(), errors));

        Self { cancelled, task }
    }

    /// Stop renewing. No renewal request is issued after this returns.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.task.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Drop for LockRenewal {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn renew_until(
    message: ReceivedMessage,
    deadline: Instant,
    cancelled: Arc<AtomicBool>,
    errors: Arc<dyn ErrorHandler>,
) {
    loop {
        let Some(locked_until) = message.locked_until() else {
            return;
        };
        tokio::time::sleep(renew_after(locked_until)).await;

        if cancelled.load(Ordering::Acquire) {
            return;
        }
        if Instant::now() >= deadline {
            debug!(
                message_id = %message.message_id(),
                "Auto-renew window elapsed, lock renewal stopped"
            );
            return;
        }

        match message.renew_lock().await {
            Ok(renewed_until) => {
                debug!(
                    message_id = %message.message_id(),
                    lock_token = ?message.lock_token(),
                    %renewed_until,
                    "Message lock renewed"
                );
            }
            Err(error) => {
                if cancelled.load(Ordering::Acquire) {
                    return;
                }
                warn!(
                    message_id = %message.message_id(),
                    lock_token = ?message.lock_token(),
                    error = %error,
                    "Message lock renewal failed"
                );
                errors.on_error(&error);
                return;
            }
        }
    }
}
