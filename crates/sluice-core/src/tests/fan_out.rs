use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use super::harness::{self, Harness, RecordingHandler, wait_until};
use crate::config::DispatcherConfig;
use crate::domain::RecordId;

#[tokio::test(start_paused = true)]
async fn each_member_only_handles_its_own_partitions() {
    let h = Harness::new(DispatcherConfig {
        consumer_instance_count: 3,
        ..harness::config()
    });
    assert_eq!(h.broker.partitions(), 6);
    let ids: Vec<RecordId> = (0..12)
        .flat_map(|g| h.seed(&format!("tenant-{g}"), 25))
        .collect();

    let handler = Arc::new(RecordingHandler::default());
    let dispatcher = h.start_with_consumers(handler.clone()).await;
    let members = dispatcher.consumer_members().to_vec();
    assert_eq!(members.len(), 3);

    // assignment is disjoint and covers every partition
    let topic = h.config.topic.clone();
    let group = h.config.consumer_group.clone();
    let mut covered = HashSet::new();
    for member in &members {
        let assigned = h.broker.assignment_of(&topic, &group, *member);
        assert_eq!(assigned.len(), 2);
        for p in assigned {
            assert!(covered.insert(p), "partition {p} assigned twice");
        }
    }
    assert_eq!(covered.len(), 6);

    assert!(wait_until(Duration::from_secs(60), || h.all_processed(&ids)).await);
    let assignments: HashMap<_, _> = members
        .iter()
        .map(|m| (*m, h.broker.assignment_of(&topic, &group, *m)))
        .collect();
    dispatcher.shutdown().await;

    let handled = handler.handled();
    let mut seen = HashSet::new();
    for (ctx, id) in &handled {
        assert!(
            assignments[&ctx.member].contains(&ctx.partition),
            "{} handled partition {} outside its assignment",
            ctx.member,
            ctx.partition
        );
        assert!(seen.insert(*id), "record {id} handled twice");
        assert_eq!(ctx.attempt, 1);

        let record = h.record(*id);
        assert_eq!(h.broker.partition_for(&record.group_key), ctx.partition);
    }
    assert_eq!(seen.len(), ids.len());

    // more than one member did work
    let busy: HashSet<_> = handled.iter().map(|(ctx, _)| ctx.member).collect();
    assert!(busy.len() > 1);
}

#[tokio::test(start_paused = true)]
async fn per_group_order_holds_within_a_partition() {
    let h = Harness::new(harness::config());
    let ids: Vec<RecordId> = ["a", "b", "c"]
        .iter()
        .flat_map(|g| h.seed(g, 40))
        .collect();

    let handler = Arc::new(RecordingHandler::default());
    let dispatcher = h.start_with_consumers(handler.clone()).await;
    assert!(wait_until(Duration::from_secs(60), || h.all_processed(&ids)).await);
    dispatcher.shutdown().await;

    let mut last_rank: HashMap<String, i64> = HashMap::new();
    for (_, id) in handler.handled() {
        let record = h.record(id);
        let prev = last_rank.insert(record.group_key.to_string(), record.rank);
        if let Some(prev) = prev {
            assert!(prev < record.rank, "{} out of order", record.group_key);
        }
    }
}
