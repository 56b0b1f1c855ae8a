//! Integration tests for batch receive
//!
//! These tests verify:
//! - Partial batches resolve with every arrived message in order
//! - Messages settled from a batch are completed over the link
//! - Deferred messages can be fetched and settled without a link

mod common;

use common::{brokered, yield_to_tasks, Harness};
use servicebus_amqp::{ReceiveMode, ReceiverOptions, SettlementKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Verify a batch of ten with only six available resolves with those six in order.
#[tokio::test(start_paused = true)]
async fn test_partial_batch_in_arrival_order() {
    let harness = Harness::new();
    let receiver = Arc::new(
        harness
            .entity
            .create_batching_receiver(ReceiverOptions::default(), harness.error_handler())
            .expect("Receiver created"),
    );
    let started = Instant::now();

    let pending = {
        let receiver = receiver.clone();
        tokio::spawn(async move { receiver.receive_batch(10, Some(Duration::from_secs(60))).await })
    };
    yield_to_tasks().await;
    let link = harness.transport.latest_receiver().expect("Link opened");
    for sequence in 1..=6 {
        link.deliver(brokered(sequence));
    }
    let batch = pending
        .await
        .expect("Task completes")
        .expect("Batch resolves");

    let sequences: Vec<i64> = batch.iter().map(|m| m.sequence_number()).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4, 5, 6]);
    assert!(started.elapsed() < Duration::from_secs(60));
    assert_eq!(link.credit(), 0);
}

/// Verify batch messages are settled individually over the link.
#[tokio::test(start_paused = true)]
async fn test_settle_batch_messages() {
    let harness = Harness::new();
    let receiver = Arc::new(
        harness
            .entity
            .create_batching_receiver(ReceiverOptions::default(), harness.error_handler())
            .expect("Receiver created"),
    );

    let pending = {
        let receiver = receiver.clone();
        tokio::spawn(async move { receiver.receive_batch(3, None).await })
    };
    yield_to_tasks().await;
    let link = harness.transport.latest_receiver().expect("Link opened");
    for sequence in 1..=3 {
        link.deliver(brokered(sequence));
    }
    let batch = pending
        .await
        .expect("Task completes")
        .expect("Batch resolves");

    batch[0].complete().await.expect("Complete succeeds");
    batch[1].defer(None).await.expect("Defer succeeds");
    batch[2]
        .dead_letter(servicebus_amqp::SettlementOptions::dead_letter(
            "poison",
            "unparseable payload",
        ))
        .await
        .expect("Dead-letter succeeds");

    assert_eq!(
        link.settled_kinds(),
        vec![
            SettlementKind::Complete,
            SettlementKind::Defer,
            SettlementKind::DeadLetter
        ]
    );
    assert!(batch.iter().all(|m| m.is_settled()));
    assert_eq!(link.credit(), 0);
}

/// Verify deferred messages are received and completed over the management channel.
#[tokio::test(start_paused = true)]
async fn test_deferred_round_trip() {
    let harness = Harness::new();
    harness.management.add_deferred(brokered(41));
    harness.management.add_deferred(brokered(42));

    let deferred = harness
        .entity
        .receive_deferred_messages(&[41, 42], ReceiveMode::PeekLock)
        .await
        .expect("Deferred receive succeeds");
    for message in &deferred {
        message.complete().await.expect("Complete succeeds");
    }

    let kinds: Vec<SettlementKind> = harness
        .management
        .dispositions()
        .into_iter()
        .map(|(_, kind)| kind)
        .collect();
    assert_eq!(kinds, vec![SettlementKind::Complete, SettlementKind::Complete]);
    assert!(harness.transport.receiver_opens().is_empty());
}
