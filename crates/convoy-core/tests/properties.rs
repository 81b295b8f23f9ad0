//! Property tests for cycle detection and subscription cursors.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)]

use chrono::Utc;
use convoy_core::{
    deadlock::find_cycles, EventFilter, EventLog, EventType, NewEvent, StartAt, Store, WaitEdge,
};
use proptest::prelude::*;

fn edge(waiter: &str, holder: &str) -> WaitEdge {
    WaitEdge {
        waiter: waiter.to_string(),
        holder: holder.to_string(),
        resource_key: format!("{holder}.ts"),
        recorded_at: Utc::now(),
    }
}

fn ring(size: usize) -> Vec<WaitEdge> {
    (0..size)
        .map(|i| edge(&format!("loop-{i:02}"), &format!("loop-{:02}", (i + 1) % size)))
        .collect()
}

proptest! {
    #[test]
    fn ring_is_one_cycle_of_every_member(size in 2usize..12) {
        let cycles = find_cycles(&ring(size));
        prop_assert_eq!(cycles.len(), 1);
        prop_assert_eq!(cycles[0].len(), size);
    }

    #[test]
    fn forward_only_edges_never_cycle(pairs in prop::collection::vec((0u8..20, 0u8..20), 0..40)) {
        // Edges only point from a lower to a higher id, so the graph is acyclic.
        let edges: Vec<WaitEdge> = pairs
            .into_iter()
            .filter(|(a, b)| a < b)
            .map(|(a, b)| edge(&format!("loop-{a:02}"), &format!("loop-{b:02}")))
            .collect();
        prop_assert!(find_cycles(&edges).is_empty());
    }

    #[test]
    fn ring_plus_tail_reports_only_the_ring(size in 2usize..8, tail in 1usize..5) {
        let mut edges = ring(size);
        for t in 0..tail {
            edges.push(edge(&format!("tail-{t}"), "loop-00"));
        }
        let cycles = find_cycles(&edges);
        prop_assert_eq!(cycles.len(), 1);
        prop_assert!(cycles[0].iter().all(|m| m.starts_with("loop-")));
    }

    #[test]
    fn acked_events_never_redelivered(
        publishes in prop::collection::vec(1usize..5, 1..6),
        ack_offsets in prop::collection::vec(0usize..6, 1..6),
    ) {
        tokio_test::block_on(async {
            let store = Store::in_memory().await.unwrap();
            let log = EventLog::new(store);
            log.subscribe("observer", EventFilter::all(), StartAt::Beginning).await.unwrap();

            let mut acked = 0i64;
            for (batch, offset) in publishes.iter().zip(ack_offsets.iter().cycle()) {
                for _ in 0..*batch {
                    log.publish(NewEvent::new("loop-1", EventType::TestStarted)).await.unwrap();
                }
                let polled = log.poll("observer").await.unwrap();
                assert!(polled.iter().all(|e| e.id > acked));
                assert!(polled.windows(2).all(|w| w[0].id < w[1].id));
                let event = &polled[(*offset).min(polled.len() - 1)];
                log.ack("observer", event.id).await.unwrap();
                acked = acked.max(event.id);
                // A stale ack never moves the cursor back.
                log.ack("observer", 0).await.unwrap();
                assert_eq!(log.subscription("observer").await.unwrap().last_acked_seq, acked);
            }
        });
    }
}
