//! Tests for the session receiver.

use super::*;
use crate::config::ReceiverOptions;
use crate::error::ErrorCondition;
use crate::message::SettlementKind;
use crate::receiver::ReceiverRole;
use crate::test_support::{message, peek_lock_options, settle, Fixture, ScriptedHandler};
use crate::transport::{AmqpTransport, ReceiverLinkOptions, SessionFilter};

fn session(id: &str) -> SessionId {
    SessionId::new(id.to_string()).expect("Valid session id")
}

async fn accept(
    fixture: &Fixture,
    session_id: Option<SessionId>,
    options: ReceiverOptions,
) -> Result<SessionReceiver, ReceiverError> {
    fixture
        .entity
        .accept_session(session_id, options, fixture.error_handler())
        .await
}

mod accepting {
    use super::*;

    /// Verify a named session is locked by the new link.
    #[tokio::test(start_paused = true)]
    async fn test_accept_named_session() {
        let fixture = Fixture::new();
        fixture.transport.add_session(session("tenant-1"));

        let receiver = accept(&fixture, Some(session("tenant-1")), ReceiverOptions::default())
            .await
            .expect("Session accepted");

        assert_eq!(receiver.session_id(), &session("tenant-1"));
        assert!(receiver.session_locked_until().is_some());
        assert!(fixture.transport.is_session_locked(&session("tenant-1")));
        assert_eq!(
            fixture.transport.receiver_opens()[0].session,
            Some(SessionFilter::Named(session("tenant-1")))
        );
        assert_eq!(fixture.entity.session_ids(), vec![session("tenant-1")]);
    }

    /// Verify the next available session is chosen when none is named.
    #[tokio::test(start_paused = true)]
    async fn test_accept_next_session() {
        let fixture = Fixture::new();
        fixture.transport.add_session(session("a"));
        fixture.transport.add_session(session("b"));

        let first = accept(&fixture, None, ReceiverOptions::default())
            .await
            .expect("Session accepted");
        let second = accept(&fixture, None, ReceiverOptions::default())
            .await
            .expect("Session accepted");

        assert_eq!(first.session_id(), &session("a"));
        assert_eq!(second.session_id(), &session("b"));
        assert_eq!(fixture.entity.session_ids(), vec![session("a"), session("b")]);
        assert!(fixture.entity.has_receiver(ReceiverRole::Session));
    }

    /// Verify a session locked elsewhere fails after a single attempt.
    #[tokio::test(start_paused = true)]
    async fn test_session_locked_elsewhere() {
        let fixture = Fixture::new();
        fixture.transport.add_session(session("busy"));
        let _other = fixture
            .transport
            .open_receiver(ReceiverLinkOptions {
                name: LinkName::new("other-client".to_string()).expect("Valid name"),
                address: fixture.entity.path().clone(),
                receive_mode: Default::default(),
                session: Some(SessionFilter::Named(session("busy"))),
            })
            .await
            .expect("Other client locks the session");

        let result = accept(&fixture, Some(session("busy")), ReceiverOptions::default()).await;

        let error = result.expect_err("Session is locked");
        assert_eq!(error.condition(), Some(ErrorCondition::SessionCannotBeLocked));
        assert_eq!(fixture.transport.receiver_opens().len(), 2);
        assert!(fixture.entity.session_ids().is_empty());
    }

    /// Verify a retryable failure to find a session is still not retried.
    #[tokio::test(start_paused = true)]
    async fn test_no_session_available() {
        let fixture = Fixture::new();

        let result = accept(&fixture, None, ReceiverOptions::default()).await;

        let error = result.expect_err("No session available");
        assert_eq!(error.condition(), Some(ErrorCondition::OperationTimeout));
        assert_eq!(fixture.transport.receiver_opens().len(), 1);
    }

    /// Verify the same session cannot be accepted twice by one entity.
    #[tokio::test(start_paused = true)]
    async fn test_session_already_accepted() {
        let fixture = Fixture::new();
        fixture.transport.add_session(session("tenant-1"));
        let _receiver = accept(&fixture, Some(session("tenant-1")), ReceiverOptions::default())
            .await
            .expect("Session accepted");

        let again = accept(&fixture, Some(session("tenant-1")), ReceiverOptions::default()).await;

        assert!(matches!(again, Err(ReceiverError::RoleOccupied { .. })));
    }
}

mod receiving {
    use super::*;

    /// Verify a handler receives the session's messages and completes them.
    #[tokio::test(start_paused = true)]
    async fn test_receive_with_handler() {
        let fixture = Fixture::new();
        fixture.transport.add_session(session("tenant-1"));
        let receiver = accept(&fixture, Some(session("tenant-1")), peek_lock_options(1))
            .await
            .expect("Session accepted");
        let handler = ScriptedHandler::succeeding();

        receiver.receive(handler.clone()).expect("Handler registered");
        let link = fixture.transport.latest_receiver().expect("Link opened");
        assert_eq!(link.credit(), 1);
        link.deliver(message("order-1", 1));
        settle().await;

        let seen = handler.seen();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].session_id(), Some(&session("tenant-1")));
        assert_eq!(link.settled_kinds(), vec![SettlementKind::Complete]);
    }

    /// Verify batches can be received from a session.
    #[tokio::test(start_paused = true)]
    async fn test_receive_batch() {
        let fixture = Fixture::new();
        fixture.transport.add_session(session("tenant-1"));
        let receiver = accept(&fixture, Some(session("tenant-1")), ReceiverOptions::default())
            .await
            .expect("Session accepted");
        let link = fixture.transport.latest_receiver().expect("Link opened");
        link.deliver(message("a", 1));
        link.deliver(message("b", 2));

        let batch = receiver
            .receive_batch(5, Some(Duration::from_secs(10)))
            .await
            .expect("Batch resolves");

        assert_eq!(batch.len(), 2);
    }

    /// Verify an explicit session lock renewal updates the expiry.
    #[tokio::test(start_paused = true)]
    async fn test_renew_session_lock() {
        let fixture = Fixture::new();
        fixture.transport.add_session(session("tenant-1"));
        let receiver = accept(&fixture, Some(session("tenant-1")), ReceiverOptions::default())
            .await
            .expect("Session accepted");

        let locked_until = receiver.renew_session_lock().await.expect("Renewal succeeds");

        assert_eq!(receiver.session_locked_until(), Some(locked_until));
        assert_eq!(fixture.management.session_renewals(), vec![session("tenant-1")]);
    }
}

mod lifecycle {
    use super::*;

    /// Verify a reconnect asks for the session it already held.
    #[tokio::test(start_paused = true)]
    async fn test_reconnect_keeps_session() {
        let fixture = Fixture::new();
        fixture.transport.add_session(session("a"));
        fixture.transport.add_session(session("b"));
        let receiver = accept(&fixture, None, ReceiverOptions::default())
            .await
            .expect("Session accepted");

        fixture
            .transport
            .latest_receiver()
            .expect("Link opened")
            .close_remotely(None);
        settle().await;

        let opens = fixture.transport.receiver_opens();
        assert_eq!(opens.len(), 2);
        assert_eq!(opens[1].session, Some(SessionFilter::Named(session("a"))));
        assert!(receiver.is_open());
        assert_eq!(receiver.session_id(), &session("a"));
    }

    /// Verify close releases the session and its slot.
    #[tokio::test(start_paused = true)]
    async fn test_close_releases_session() {
        let fixture = Fixture::new();
        fixture.transport.add_session(session("tenant-1"));
        let receiver = accept(&fixture, Some(session("tenant-1")), ReceiverOptions::default())
            .await
            .expect("Session accepted");

        receiver.close().await.expect("Close succeeds");

        assert!(!fixture.transport.is_session_locked(&session("tenant-1")));
        assert!(fixture.entity.session_ids().is_empty());
        assert_eq!(receiver.state(), LinkState::Closed);
    }
}
