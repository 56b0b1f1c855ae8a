//! Settlement (disposition) protocol.
//!
//! Every disposition issued on a link registers a pending record keyed by the
//! delivery id. The record is resolved exactly once: by the broker's settlement
//! acknowledgement, by the settlement timeout, or by the receiver closing.

use crate::config::SettlementTimeoutPolicy;
use crate::error::{conditions, translate, ReceiverError, TransportError};
use crate::lock;
use crate::message::{
    DeliveryId, ReceivedMessage, SettlementKind, SettlementOptions, Timestamp,
};
use crate::transport::{AmqpErrorPayload, Outcome};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "settlement_tests.rs"]
mod tests;

/// Time a disposition waits for the broker's acknowledgement.
pub const SETTLEMENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Something able to settle and renew the lock of a received message.
#[async_trait]
pub(crate) trait MessageSettler: Send + Sync {
    async fn settle(
        &self,
        message: &ReceivedMessage,
        kind: SettlementKind,
        options: SettlementOptions,
    ) -> Result<(), ReceiverError>;

    async fn renew_lock(&self, message: &ReceivedMessage) -> Result<Timestamp, ReceiverError>;
}

/// Disposition outcome for a settlement kind.
pub fn outcome_for(kind: SettlementKind, options: &SettlementOptions) -> Outcome {
    match kind {
        SettlementKind::Complete => Outcome::Accepted,
        SettlementKind::Abandon => Outcome::Modified {
            delivery_failed: false,
            undeliverable_here: false,
            message_annotations: options.properties_to_modify.clone(),
        },
        SettlementKind::Defer => Outcome::Modified {
            delivery_failed: false,
            undeliverable_here: true,
            message_annotations: options.properties_to_modify.clone(),
        },
        SettlementKind::DeadLetter => {
            let mut info = options.properties_to_modify.clone();
            if let Some(reason) = &options.dead_letter_reason {
                info.insert("DeadLetterReason".to_string(), reason.clone().into());
            }
            if let Some(description) = &options.dead_letter_description {
                info.insert(
                    "DeadLetterErrorDescription".to_string(),
                    description.clone().into(),
                );
            }
            Outcome::Rejected {
                error: Some(AmqpErrorPayload {
                    condition: conditions::DEAD_LETTER.to_string(),
                    description: options
                        .dead_letter_description
                        .clone()
                        .unwrap_or_default(),
                    info,
                }),
            }
        }
    }
}

type SettlementResult = Result<(), ReceiverError>;

struct PendingSettlement {
    responder: oneshot::Sender<SettlementResult>,
    timeout: JoinHandle<()>,
}

type Records = Mutex<HashMap<DeliveryId, PendingSettlement>>;

/// Table of dispositions awaiting acknowledgement.
pub(crate) struct PendingSettlements {
    records: Arc<Records>,
    policy: SettlementTimeoutPolicy,
    timeout: Duration,
}

impl PendingSettlements {
    pub fn new(policy: SettlementTimeoutPolicy) -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            policy,
            timeout: SETTLEMENT_TIMEOUT,
        }
    }

    /// Register a pending record for `delivery`.
    ///
    /// Fails without side effects when the delivery already has one.
    pub fn register(
        &self,
        delivery: DeliveryId,
    ) -> Result<oneshot::Receiver<SettlementResult>, ReceiverError> {
        let mut records = lock(&self.records);
        if records.contains_key(&delivery) {
            return Err(ReceiverError::SettlementInFlight { delivery });
        }

        let (responder, receiver) = oneshot::channel();
        let timeout = tokio::spawn(expire_after(
            Arc::downgrade(&self.records),
            delivery,
            self.timeout,
            self.policy,
        ));
        records.insert(delivery, PendingSettlement { responder, timeout });

        Ok(receiver)
    }

    /// Resolve the record for `delivery` from a broker acknowledgement.
    ///
    /// Returns `false` when no record exists (already timed out or unknown).
    pub fn acknowledge(&self, delivery: DeliveryId, error: Option<TransportError>) -> bool {
        let Some(record) = self.take(delivery) else {
            debug!(%delivery, "Settlement acknowledgement without pending record");
            return false;
        };

        record.timeout.abort();
        let result = match error {
            Some(error) => Err(translate(&error)),
            None => Ok(()),
        };
        let _ = record.responder.send(result);
        true
    }

    /// Drop the record for `delivery` without resolving it, used when the
    /// disposition frame could not be sent.
    pub fn withdraw(&self, delivery: DeliveryId) {
        if let Some(record) = self.take(delivery) {
            record.timeout.abort();
        }
    }

    /// Resolve every record with an error and cancel its timeout.
    pub fn fail_all(&self, make_error: impl Fn(DeliveryId) -> ReceiverError) -> usize {
        let drained: Vec<_> = lock(&self.records).drain().collect();

        let count = drained.len();
        for (delivery, record) in drained {
            record.timeout.abort();
            let _ = record.responder.send(Err(make_error(delivery)));
        }
        count
    }

    pub fn contains(&self, delivery: DeliveryId) -> bool {
        lock(&self.records).contains_key(&delivery)
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    fn take(&self, delivery: DeliveryId) -> Option<PendingSettlement> {
        lock(&self.records).remove(&delivery)
    }
}

async fn expire_after(
    records: std::sync::Weak<Records>,
    delivery: DeliveryId,
    timeout: Duration,
    policy: SettlementTimeoutPolicy,
) {
    tokio::time::sleep(timeout).await;

    let Some(records) = records.upgrade() else {
        return;
    };
    let record = lock(&records).remove(&delivery);

    if let Some(record) = record {
        let result = match policy {
            SettlementTimeoutPolicy::AssumeSuccess => {
                warn!(%delivery, ?timeout, "No settlement acknowledgement, assuming success");
                Ok(())
            }
            SettlementTimeoutPolicy::Fail => {
                warn!(%delivery, ?timeout, "No settlement acknowledgement, failing settlement");
                Err(ReceiverError::Timeout { duration: timeout })
            }
        };
        let _ = record.responder.send(result);
    }
}
