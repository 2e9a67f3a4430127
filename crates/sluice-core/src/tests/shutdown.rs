use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use super::harness::{self, Harness, RecordingHandler, wait_until, wait_until_async};
use crate::config::DispatcherConfig;
use crate::domain::RecordId;
use crate::ports::Ledger;

#[tokio::test(start_paused = true)]
async fn shutdown_mid_stream_writes_every_acked_status() {
    let h = Harness::new(DispatcherConfig {
        batch_size: 50,
        flush_interval_ms: 500,
        ..harness::config()
    });
    let ids = h.seed("G1", 2_000);
    h.ledger.set_write_latency(Some(Duration::from_millis(5)));

    let handler = Arc::new(RecordingHandler::default());
    let dispatcher = h.start_with_consumers(handler).await;
    assert!(wait_until(Duration::from_secs(10), || h.broker.published_count() >= 300).await);

    let report = dispatcher.shutdown().await;
    assert!(report.is_clean(), "{report:?}");
    assert_eq!(report.abandoned_sends, 0);
    assert_eq!(report.status.pending_status_updates, 0);
    assert!(h.ledger.is_closed());

    // everything the broker acked has producedAt in the store
    let acked: HashSet<RecordId> = h
        .broker
        .published()
        .iter()
        .map(|m| harness::decode(m).record_id)
        .collect();
    for id in &acked {
        assert!(h.record(*id).produced_at().is_some(), "{id} acked but not produced");
    }
    // and nothing beyond that
    let produced = ids
        .iter()
        .filter(|id| h.record(**id).produced_at().is_some())
        .count();
    assert_eq!(produced, acked.len());

    // the store refuses work once released
    assert!(h.ledger.backlog(5).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn stuck_sends_are_abandoned_at_the_drain_timeout() {
    let h = Harness::new(DispatcherConfig {
        drain_timeout_ms: 200,
        ..harness::config()
    });
    let ids = h.seed("G1", 10);
    h.broker.hold_sends();

    let dispatcher = h.start().await;
    let control = dispatcher.control();
    assert!(
        wait_until_async(Duration::from_secs(5), || {
            let control = control.clone();
            async move { control.status().await.broker_outstanding == 10 }
        })
        .await
    );

    let report = dispatcher.shutdown().await;
    assert!(report.completions_timed_out);
    assert!(report.abandoned_sends > 0);
    assert!(!report.is_clean());
    assert_eq!(report.unflushed, 0);

    // nothing acked, so every record is still eligible for the next run
    assert_eq!(h.broker.published_count(), 0);
    assert!(ids.iter().all(|id| h.record(*id).produced_at().is_none()));
    assert!(ids.iter().all(|id| h.record(*id).retry_count == 0));
}

#[tokio::test(start_paused = true)]
async fn consumer_statuses_queued_before_shutdown_reach_the_store() {
    let h = Harness::new(DispatcherConfig {
        flush_interval_ms: 600_000,
        ..harness::config()
    });
    let ids = h.seed("G1", 5);

    let handler = Arc::new(RecordingHandler::default());
    let dispatcher = h.start_with_consumers(handler.clone()).await;
    assert!(wait_until(Duration::from_secs(5), || handler.handled().len() == 5).await);
    // nothing flushed yet
    assert!(ids.iter().all(|id| h.record(*id).received_at.is_none()));

    let report = dispatcher.shutdown().await;
    assert!(report.is_clean());
    assert!(report.final_flush_applied >= 15);
    assert!(h.all_processed(&ids));
}
