//! Tests for the receiver core and the streaming receiver.

use super::*;
use crate::config::{ClientConfig, SettlementTimeoutPolicy};
use crate::error::conditions;
use crate::message::{BrokeredMessage, Delivery, DeliveryId, LockToken};
use crate::test_support::{message, peek_lock_options, settle, Fixture, ScriptedHandler};

async fn streaming(
    fixture: &Fixture,
    options: ReceiverOptions,
    handler: Arc<dyn MessageHandler>,
) -> StreamingReceiver {
    fixture
        .entity
        .create_streaming_receiver(options, handler, fixture.error_handler())
        .await
        .expect("Receiver should open")
}

fn batching_core(fixture: &Fixture, options: ReceiverOptions) -> Arc<ReceiverCore> {
    ReceiverCore::new(
        ReceiverRole::Batching,
        options,
        None,
        &fixture.entity,
        fixture.error_handler(),
    )
    .expect("Valid receiver options")
}

fn locked(message: BrokeredMessage) -> BrokeredMessage {
    message.with_lock(
        LockToken::new(),
        Timestamp::from_now(chrono::Duration::seconds(30)),
    )
}

/// Handler settling every message itself with a deferral
struct DeferringHandler;

#[async_trait]
impl MessageHandler for DeferringHandler {
    async fn handle(&self, message: &ReceivedMessage) -> anyhow::Result<()> {
        message.defer(None).await?;
        Ok(())
    }
}

// ============================================================================
// Streaming Tests
// ============================================================================

mod streaming_receive {
    use super::*;

    /// Verify the initial credit equals the concurrency limit.
    #[tokio::test(start_paused = true)]
    async fn test_initial_credit_matches_concurrency() {
        let fixture = Fixture::new();
        let receiver = streaming(&fixture, peek_lock_options(4), ScriptedHandler::succeeding()).await;

        let link = fixture.transport.latest_receiver().expect("Link opened");
        assert!(receiver.is_open());
        assert_eq!(link.credit(), 4);
        assert_eq!(fixture.tokens.claim_count(), 1);
    }

    /// Verify a successful handler leads to exactly one completion and returns the credit.
    #[tokio::test(start_paused = true)]
    async fn test_success_auto_completes() {
        let fixture = Fixture::new();
        let handler = ScriptedHandler::succeeding();
        let _receiver = streaming(&fixture, peek_lock_options(1), handler.clone()).await;
        let link = fixture.transport.latest_receiver().expect("Link opened");

        link.deliver(message("order-1", 1));
        settle().await;

        assert_eq!(handler.seen().len(), 1);
        assert_eq!(link.settled_kinds(), vec![SettlementKind::Complete]);
        assert!(handler.seen()[0].is_settled());
        assert_eq!(link.credit(), 1);
        assert!(fixture.errors.codes().is_empty());
    }

    /// Verify auto-complete disabled leaves the message unsettled.
    #[tokio::test(start_paused = true)]
    async fn test_no_auto_complete() {
        let fixture = Fixture::new();
        let handler = ScriptedHandler::succeeding();
        let options = ReceiverOptions {
            auto_complete: false,
            ..peek_lock_options(1)
        };
        let _receiver = streaming(&fixture, options, handler.clone()).await;
        let link = fixture.transport.latest_receiver().expect("Link opened");

        link.deliver(message("order-1", 1));
        settle().await;

        assert_eq!(handler.seen().len(), 1);
        assert!(link.dispositions().is_empty());
    }

    /// Verify a handler failure abandons the message and reaches the error handler.
    #[tokio::test(start_paused = true)]
    async fn test_failure_abandons() {
        let fixture = Fixture::new();
        let handler = ScriptedHandler::failing(|| anyhow::anyhow!("database unavailable"));
        let _receiver = streaming(&fixture, peek_lock_options(1), handler).await;
        let link = fixture.transport.latest_receiver().expect("Link opened");

        link.deliver(message("order-1", 1));
        settle().await;

        assert_eq!(link.settled_kinds(), vec![SettlementKind::Abandon]);
        assert_eq!(fixture.errors.codes(), vec!["HandlerError".to_string()]);
    }

    /// Verify a lock-lost failure is forwarded without any disposition.
    #[tokio::test(start_paused = true)]
    async fn test_lock_lost_failure_is_not_abandoned() {
        let fixture = Fixture::new();
        let handler = ScriptedHandler::failing(|| {
            ReceiverError::amqp(ErrorCondition::MessageLockLost, "lock expired").into()
        });
        let _receiver = streaming(&fixture, peek_lock_options(1), handler).await;
        let link = fixture.transport.latest_receiver().expect("Link opened");

        link.deliver(message("order-1", 1));
        settle().await;

        assert!(link.dispositions().is_empty());
        assert_eq!(fixture.errors.codes(), vec!["MessageLockLostError".to_string()]);
    }

    /// Verify a message settled by the handler is not auto-completed.
    #[tokio::test(start_paused = true)]
    async fn test_handler_settlement_wins() {
        let fixture = Fixture::new();
        let _receiver = streaming(&fixture, peek_lock_options(1), Arc::new(DeferringHandler)).await;
        let link = fixture.transport.latest_receiver().expect("Link opened");

        link.deliver(message("order-1", 1));
        settle().await;

        assert_eq!(link.settled_kinds(), vec![SettlementKind::Defer]);
        assert!(fixture.errors.codes().is_empty());
    }

    /// Verify no more messages are in flight than the concurrency limit.
    #[tokio::test(start_paused = true)]
    async fn test_credit_bounds_concurrency() {
        let fixture = Fixture::new();
        let handler = ScriptedHandler::sleeping(Duration::from_secs(10));
        let _receiver = streaming(&fixture, peek_lock_options(2), handler.clone()).await;
        let link = fixture.transport.latest_receiver().expect("Link opened");

        for sequence in 1..=5 {
            link.deliver(message("order", sequence));
        }
        settle().await;

        assert_eq!(handler.seen().len(), 2);
        assert_eq!(link.backlog_len(), 3);

        tokio::time::sleep(Duration::from_secs(10)).await;
        settle().await;

        assert_eq!(handler.seen().len(), 4);
        assert_eq!(link.settled_kinds().len(), 2);
    }

    /// Verify receive-and-delete returns credit after each handler completes.
    #[tokio::test(start_paused = true)]
    async fn test_receive_and_delete_credit() {
        let fixture = Fixture::new();
        let handler = ScriptedHandler::sleeping(Duration::from_secs(5));
        let options = ReceiverOptions {
            receive_mode: ReceiveMode::ReceiveAndDelete,
            ..peek_lock_options(1)
        };
        let _receiver = streaming(&fixture, options, handler.clone()).await;
        let link = fixture.transport.latest_receiver().expect("Link opened");

        link.deliver(message("first", 1));
        link.deliver(message("second", 2));
        settle().await;
        assert_eq!(handler.seen().len(), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;

        assert_eq!(handler.seen().len(), 2);
        assert!(link.dispositions().is_empty());
        assert!(handler.seen()[0].lock_token().is_none());
    }

    /// Verify renewal is skipped when the renewal window is zero.
    #[tokio::test(start_paused = true)]
    async fn test_renewal_disabled() {
        let fixture = Fixture::new();
        let handler = ScriptedHandler::sleeping(Duration::from_secs(35));
        let options = ReceiverOptions {
            max_auto_renew_duration_secs: 0,
            ..peek_lock_options(1)
        };
        let _receiver = streaming(&fixture, options, handler).await;
        let link = fixture.transport.latest_receiver().expect("Link opened");

        link.deliver(message("slow", 1));
        tokio::time::sleep(Duration::from_secs(36)).await;
        settle().await;

        assert_eq!(fixture.management.renew_count(), 0);
        assert_eq!(link.settled_kinds(), vec![SettlementKind::Complete]);
    }

    /// Verify a second intake on the same core is refused.
    #[tokio::test(start_paused = true)]
    async fn test_second_handler_rejected() {
        let fixture = Fixture::new();
        let receiver = streaming(&fixture, peek_lock_options(1), ScriptedHandler::succeeding()).await;

        let result = receiver.core.start_handler(ScriptedHandler::succeeding());

        assert!(matches!(
            result,
            Err(ReceiverError::Amqp {
                condition: ErrorCondition::InvalidOperation,
                ..
            })
        ));
    }

    /// Verify a second streaming receiver for the same entity is refused.
    #[tokio::test(start_paused = true)]
    async fn test_role_occupied() {
        let fixture = Fixture::new();
        let _receiver = streaming(&fixture, peek_lock_options(1), ScriptedHandler::succeeding()).await;

        let second = fixture
            .entity
            .create_streaming_receiver(
                peek_lock_options(1),
                ScriptedHandler::succeeding(),
                fixture.error_handler(),
            )
            .await;

        assert!(matches!(second, Err(ReceiverError::RoleOccupied { .. })));
    }
}

// ============================================================================
// Settlement Tests
// ============================================================================

mod settlement {
    use super::*;

    async fn one_message(fixture: &Fixture, options: ReceiverOptions) -> (Arc<ReceiverCore>, ReceivedMessage) {
        let core = batching_core(fixture, options);
        core.open().await.expect("Link should open");
        fixture
            .transport
            .latest_receiver()
            .expect("Link opened")
            .deliver(message("order-1", 1));

        let mut batch = core
            .collect_batch(1, Some(Duration::from_secs(5)))
            .await
            .expect("Batch should resolve");
        assert_eq!(batch.len(), 1);
        (core, batch.remove(0))
    }

    /// Verify a settlement resolves only once the peer acknowledges it.
    #[tokio::test(start_paused = true)]
    async fn test_settlement_waits_for_acknowledgement() {
        let fixture = Fixture::new();
        let (_core, received) = one_message(&fixture, peek_lock_options(1)).await;
        let link = fixture.transport.latest_receiver().expect("Link opened");
        link.set_auto_acknowledge(false);

        let pending = {
            let received = received.clone();
            tokio::spawn(async move { received.complete().await })
        };
        settle().await;
        assert!(!pending.is_finished());
        assert!(!received.is_settled());

        let delivery = received.delivery_id().expect("Link delivery");
        link.acknowledge(delivery, None);
        settle().await;

        assert!(pending.await.expect("Task completes").is_ok());
        assert!(received.is_settled());
    }

    /// Verify an acknowledgement carrying an error fails the settlement.
    #[tokio::test(start_paused = true)]
    async fn test_acknowledgement_error() {
        let fixture = Fixture::new();
        let (_core, received) = one_message(&fixture, peek_lock_options(1)).await;
        let link = fixture.transport.latest_receiver().expect("Link opened");
        link.set_acknowledge_error(Some(TransportError::new(
            conditions::MESSAGE_LOCK_LOST,
            "lock expired",
        )));

        let result = received.complete().await;

        assert!(result.expect_err("Settlement should fail").is_lock_lost());
        assert!(!received.is_settled());
    }

    /// Verify a message cannot be settled twice.
    #[tokio::test(start_paused = true)]
    async fn test_already_settled() {
        let fixture = Fixture::new();
        let (_core, received) = one_message(&fixture, peek_lock_options(1)).await;

        received.complete().await.expect("First settlement succeeds");
        let second = received.abandon(None).await;

        assert!(matches!(second, Err(ReceiverError::AlreadySettled { .. })));
    }

    /// Verify settlement is refused in receive-and-delete mode.
    #[tokio::test(start_paused = true)]
    async fn test_receive_and_delete_cannot_settle() {
        let fixture = Fixture::new();
        let options = ReceiverOptions {
            receive_mode: ReceiveMode::ReceiveAndDelete,
            ..peek_lock_options(1)
        };
        let (_core, received) = one_message(&fixture, options).await;

        let result = received.complete().await;

        assert!(matches!(result, Err(ReceiverError::UnsupportedInMode { .. })));
        assert!(matches!(
            received.renew_lock().await,
            Err(ReceiverError::UnsupportedInMode { .. })
        ));
    }

    /// Verify an unacknowledged settlement resolves after the timeout by default.
    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_settlement_assumed_successful() {
        let fixture = Fixture::new();
        let (_core, received) = one_message(&fixture, peek_lock_options(1)).await;
        fixture
            .transport
            .latest_receiver()
            .expect("Link opened")
            .set_auto_acknowledge(false);

        let result = received.complete().await;

        assert!(result.is_ok());
        assert!(received.is_settled());
    }

    /// Verify the fail policy turns a missing acknowledgement into a timeout.
    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_settlement_fails_with_policy() {
        let fixture = Fixture::with_config(ClientConfig {
            settlement_timeout_policy: SettlementTimeoutPolicy::Fail,
            ..ClientConfig::default()
        });
        let (_core, received) = one_message(&fixture, peek_lock_options(1)).await;
        fixture
            .transport
            .latest_receiver()
            .expect("Link opened")
            .set_auto_acknowledge(false);

        let result = received.complete().await;

        assert!(matches!(result, Err(ReceiverError::Timeout { .. })));
    }

    /// Verify a detach fails unacknowledged settlements as lock-lost.
    #[tokio::test(start_paused = true)]
    async fn test_detach_fails_pending_settlement() {
        let fixture = Fixture::new();
        let (_core, received) = one_message(&fixture, peek_lock_options(1)).await;
        let link = fixture.transport.latest_receiver().expect("Link opened");
        link.set_auto_acknowledge(false);

        let pending = {
            let received = received.clone();
            tokio::spawn(async move { received.complete().await })
        };
        settle().await;
        link.close_remotely(None);
        settle().await;

        let result = pending.await.expect("Task completes");
        assert!(result.expect_err("Settlement should fail").is_lock_lost());
    }

    /// Verify messages from a replaced link cannot be settled.
    #[tokio::test(start_paused = true)]
    async fn test_settlement_on_replaced_link_is_lock_lost() {
        let fixture = Fixture::new();
        let (core, received) = one_message(&fixture, peek_lock_options(1)).await;

        fixture
            .transport
            .latest_receiver()
            .expect("Link opened")
            .close_remotely(None);
        settle().await;
        assert!(core.is_open());

        let result = received.complete().await;
        assert!(result.expect_err("Settlement should fail").is_lock_lost());
    }

    /// Verify close fails unacknowledged settlements and cancels renewals.
    #[tokio::test(start_paused = true)]
    async fn test_close_fails_pending_settlement() {
        let fixture = Fixture::new();
        let (core, received) = one_message(&fixture, peek_lock_options(1)).await;
        fixture
            .transport
            .latest_receiver()
            .expect("Link opened")
            .set_auto_acknowledge(false);

        let pending = {
            let received = received.clone();
            tokio::spawn(async move { received.complete().await })
        };
        settle().await;
        core.close().await.expect("Close succeeds");

        let result = pending.await.expect("Task completes");
        assert!(matches!(result, Err(ReceiverError::ReceiverClosed { .. })));
    }
}

// ============================================================================
// Intake Tests
// ============================================================================

mod intake {
    use super::*;

    fn late_delivery() -> LinkEvent {
        LinkEvent::Message(Delivery {
            id: DeliveryId::new(42),
            message: locked(message("late", 9)),
        })
    }

    /// Verify a message arriving with no intake is abandoned in peek-lock mode.
    #[tokio::test(start_paused = true)]
    async fn test_late_message_abandoned() {
        let fixture = Fixture::new();
        let core = batching_core(&fixture, peek_lock_options(1));
        core.open().await.expect("Link should open");
        let link = fixture.transport.latest_receiver().expect("Link opened");

        link.emit(late_delivery());
        settle().await;

        assert_eq!(link.settled_kinds(), vec![SettlementKind::Abandon]);
        assert_eq!(link.credit(), 0);
    }

    fn receive_and_delete_core(fixture: &Fixture) -> Arc<ReceiverCore> {
        let options = ReceiverOptions {
            receive_mode: ReceiveMode::ReceiveAndDelete,
            ..peek_lock_options(1)
        };
        batching_core(fixture, options)
    }

    /// Verify a receive-and-delete message arriving with no intake is handed
    /// out by the next batch.
    #[tokio::test(start_paused = true)]
    async fn test_late_message_held_for_next_batch() {
        let fixture = Fixture::new();
        let core = receive_and_delete_core(&fixture);
        core.open().await.expect("Link should open");
        let link = fixture.transport.latest_receiver().expect("Link opened");

        link.emit(late_delivery());
        settle().await;
        assert!(link.dispositions().is_empty());

        let batch = core
            .collect_batch(5, Some(Duration::from_secs(10)))
            .await
            .expect("Batch resolves");

        let sequences: Vec<i64> = batch.iter().map(|m| m.sequence_number()).collect();
        assert_eq!(sequences, vec![9]);
        assert!(link.dispositions().is_empty());
    }

    /// Verify held back messages alone can fill a batch without new credit.
    #[tokio::test(start_paused = true)]
    async fn test_held_back_messages_fill_batch() {
        let fixture = Fixture::new();
        let core = receive_and_delete_core(&fixture);
        core.open().await.expect("Link should open");
        let link = fixture.transport.latest_receiver().expect("Link opened");

        for id in 1..=3 {
            link.emit(LinkEvent::Message(Delivery {
                id: DeliveryId::new(id),
                message: message("late", i64::from(id)),
            }));
        }
        settle().await;

        let first = core.collect_batch(2, None).await.expect("Batch resolves");
        assert_eq!(link.credit(), 0);
        let second = core
            .collect_batch(2, Some(Duration::from_secs(5)))
            .await
            .expect("Batch resolves");

        let first: Vec<i64> = first.iter().map(|m| m.sequence_number()).collect();
        let second: Vec<i64> = second.iter().map(|m| m.sequence_number()).collect();
        assert_eq!(first, vec![1, 2]);
        assert_eq!(second, vec![3]);
    }

    /// Verify a batch that finds no link leaves no batch intake behind.
    #[tokio::test(start_paused = true)]
    async fn test_batch_without_link_resets_intake() {
        let fixture = Fixture::new();
        let core = batching_core(&fixture, peek_lock_options(1));
        core.open().await.expect("Link should open");
        let detached = lock(&core.active).take();
        if let Some(detached) = detached {
            detached.pump.abort();
        }

        let result = core.collect_batch(3, None).await;

        assert!(matches!(result, Err(ReceiverError::ReceiverClosed { .. })));
        assert!(matches!(&*lock(&core.intake), Intake::Idle));
        assert!(!core.batch_in_progress.load(Ordering::Acquire));
    }

    /// Verify terminal link errors reach the error handler and retryable ones do not.
    #[tokio::test(start_paused = true)]
    async fn test_link_errors() {
        let fixture = Fixture::new();
        let _receiver = streaming(&fixture, peek_lock_options(1), ScriptedHandler::succeeding()).await;
        let link = fixture.transport.latest_receiver().expect("Link opened");

        link.emit(LinkEvent::LinkError(TransportError::new(
            conditions::SERVER_BUSY,
            "busy",
        )));
        link.emit(LinkEvent::SessionError(TransportError::new(
            conditions::UNAUTHORIZED_ACCESS,
            "token expired",
        )));
        settle().await;

        assert_eq!(fixture.errors.codes(), vec!["UnauthorizedError".to_string()]);
    }
}

// ============================================================================
// Reconnect Tests
// ============================================================================

mod reconnect {
    use super::*;

    /// Verify a remote detach without an error reopens the link under a new name.
    #[tokio::test(start_paused = true)]
    async fn test_remote_detach_reopens() {
        let fixture = Fixture::new();
        let receiver = streaming(&fixture, peek_lock_options(3), ScriptedHandler::succeeding()).await;
        let first = fixture.transport.latest_receiver().expect("Link opened");

        first.close_remotely(None);
        settle().await;

        let opens = fixture.transport.receiver_opens();
        assert_eq!(opens.len(), 2);
        assert_ne!(opens[0].name, opens[1].name);
        assert_eq!(receiver.name(), opens[1].name);
        assert!(receiver.is_open());
        assert!(fixture.transport.removed_links().contains(&opens[0].name));

        let second = fixture.transport.latest_receiver().expect("Link reopened");
        assert_eq!(second.credit(), 3);
        assert_eq!(fixture.tokens.claim_count(), 2);
    }

    /// Verify a retryable detach error reopens the link.
    #[tokio::test(start_paused = true)]
    async fn test_retryable_detach_reopens() {
        let fixture = Fixture::new();
        let receiver = streaming(&fixture, peek_lock_options(1), ScriptedHandler::succeeding()).await;

        fixture
            .transport
            .latest_receiver()
            .expect("Link opened")
            .close_session_remotely(Some(TransportError::new(conditions::DETACH_FORCED, "idle")));
        settle().await;

        assert_eq!(fixture.transport.receiver_opens().len(), 2);
        assert!(receiver.is_open());
    }

    /// Verify a terminal detach error closes the receiver and is surfaced.
    #[tokio::test(start_paused = true)]
    async fn test_terminal_detach_surfaces() {
        let fixture = Fixture::new();
        let receiver = streaming(&fixture, peek_lock_options(1), ScriptedHandler::succeeding()).await;

        fixture
            .transport
            .latest_receiver()
            .expect("Link opened")
            .close_remotely(Some(TransportError::new(conditions::NOT_FOUND, "deleted")));
        settle().await;

        assert_eq!(fixture.transport.receiver_opens().len(), 1);
        assert_eq!(receiver.state(), LinkState::Closed);
        assert_eq!(
            fixture.errors.codes(),
            vec!["MessagingEntityNotFoundError".to_string()]
        );
        assert!(!fixture.entity.has_receiver(ReceiverRole::Streaming));
    }

    /// Verify a terminal error reported by an error event is not reported
    /// again by the detach carrying the same error.
    #[tokio::test(start_paused = true)]
    async fn test_error_event_then_detach_reported_once() {
        let fixture = Fixture::new();
        let receiver = streaming(&fixture, peek_lock_options(1), ScriptedHandler::succeeding()).await;
        let link = fixture.transport.latest_receiver().expect("Link opened");

        link.emit(LinkEvent::LinkError(TransportError::new(
            conditions::NOT_FOUND,
            "deleted",
        )));
        link.close_remotely(Some(TransportError::new(conditions::NOT_FOUND, "deleted")));
        settle().await;

        assert_eq!(
            fixture.errors.codes(),
            vec!["MessagingEntityNotFoundError".to_string()]
        );
        assert_eq!(receiver.state(), LinkState::Closed);
        assert_eq!(fixture.transport.receiver_opens().len(), 1);
    }

    /// Verify a session error followed by the session closing is reported once.
    #[tokio::test(start_paused = true)]
    async fn test_session_error_then_close_reported_once() {
        let fixture = Fixture::new();
        let _receiver = streaming(&fixture, peek_lock_options(1), ScriptedHandler::succeeding()).await;
        let link = fixture.transport.latest_receiver().expect("Link opened");
        let unauthorized = TransportError::new(conditions::UNAUTHORIZED_ACCESS, "token expired");

        link.emit(LinkEvent::SessionError(unauthorized.clone()));
        link.emit(LinkEvent::SessionError(unauthorized.clone()));
        link.close_session_remotely(Some(unauthorized));
        settle().await;

        assert_eq!(fixture.errors.codes(), vec!["UnauthorizedError".to_string()]);
    }

    /// Verify a link attached after the receiver was closed is torn down and
    /// the receiver stays out of its slot.
    #[tokio::test(start_paused = true)]
    async fn test_close_while_opening() {
        let fixture = Fixture::new();
        let core = batching_core(&fixture, peek_lock_options(1));
        fixture.transport.set_open_delay(Duration::from_secs(2));

        let opening = {
            let core = core.clone();
            tokio::spawn(async move { core.open().await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        core.close().await.expect("Close succeeds");
        let result = opening.await.expect("Task completes");

        assert!(matches!(result, Err(ReceiverError::ReceiverClosed { .. })));
        let link = fixture.transport.latest_receiver().expect("Link attached");
        assert!(link.is_closed());
        assert!(fixture.transport.removed_links().contains(&core.name()));
        assert_eq!(core.state(), LinkState::Closed);
        assert!(lock(&core.active).is_none());
        assert!(!fixture.entity.has_receiver(ReceiverRole::Batching));
    }

    /// Verify overlapping detach notifications lead to a single reconnect.
    #[tokio::test(start_paused = true)]
    async fn test_overlapping_detach_single_reconnect() {
        let fixture = Fixture::new();
        let receiver = streaming(&fixture, peek_lock_options(1), ScriptedHandler::succeeding()).await;
        let link = fixture.transport.latest_receiver().expect("Link opened");
        fixture.transport.set_open_delay(Duration::from_secs(5));

        link.close_remotely(None);
        link.emit(LinkEvent::SessionClosed(None));
        settle().await;
        receiver.core.clone().on_detached(None).await;

        tokio::time::sleep(Duration::from_secs(6)).await;
        settle().await;

        assert_eq!(fixture.transport.receiver_opens().len(), 2);
        assert!(receiver.is_open());
    }

    /// Verify reconnection gives up after the policy's attempts and closes the receiver.
    #[tokio::test(start_paused = true)]
    async fn test_reconnect_exhausted() {
        let fixture = Fixture::with_config(ClientConfig {
            reconnect: RetryPolicy::new(3, Duration::from_secs(1)),
            ..ClientConfig::default()
        });
        let receiver = streaming(&fixture, peek_lock_options(1), ScriptedHandler::succeeding()).await;
        fixture
            .transport
            .fail_next_opens(3, TransportError::new(conditions::SERVER_BUSY, "busy"));

        fixture
            .transport
            .latest_receiver()
            .expect("Link opened")
            .close_remotely(None);
        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;

        assert_eq!(fixture.transport.receiver_opens().len(), 4);
        assert_eq!(receiver.state(), LinkState::Closed);
        assert_eq!(fixture.errors.codes(), vec!["ServerBusyError".to_string()]);
    }

    /// Verify a closed receiver never reconnects.
    #[tokio::test(start_paused = true)]
    async fn test_close_prevents_reconnect() {
        let fixture = Fixture::new();
        let receiver = streaming(&fixture, peek_lock_options(1), ScriptedHandler::succeeding()).await;
        let link = fixture.transport.latest_receiver().expect("Link opened");

        receiver.close().await.expect("Close succeeds");
        receiver.core.clone().on_detached(None).await;
        settle().await;

        assert!(link.is_closed());
        assert_eq!(fixture.transport.receiver_opens().len(), 1);
        assert_eq!(receiver.state(), LinkState::Closed);
        assert!(!fixture.entity.has_receiver(ReceiverRole::Streaming));
    }

    /// Verify the initial open retries retryable failures.
    #[tokio::test(start_paused = true)]
    async fn test_initial_open_retries() {
        let fixture = Fixture::with_config(ClientConfig {
            operation_retry: RetryPolicy::new(3, Duration::from_secs(1)),
            ..ClientConfig::default()
        });
        fixture
            .transport
            .fail_next_opens(2, TransportError::new(conditions::SERVICE_UNAVAILABLE, "starting"));

        let receiver = streaming(&fixture, peek_lock_options(1), ScriptedHandler::succeeding()).await;

        assert!(receiver.is_open());
        assert_eq!(fixture.transport.receiver_opens().len(), 3);
    }
}
