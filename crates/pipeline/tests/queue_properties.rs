//! Properties that must hold under concurrency: one holder per lease,
//! attempt caps, and counters that always add up.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::{pool_config, prompts, Harness, ScriptedGenerator};
use futures::future::join_all;
use genbatch_core::batch::{ItemOutcome, ItemPayload, NewBatchItem};
use genbatch_core::generation::GenerationError;
use genbatch_core::status::BatchStatus;
use genbatch_pipeline::memory::MemoryQueue;
use genbatch_pipeline::progress::BatchEvent;
use genbatch_pipeline::queue::{JobQueue, Nack};
use tokio::sync::broadcast::error::TryRecvError;

const LEASE: Duration = Duration::from_secs(60);

fn items(batch_id: i64, count: usize, max_attempts: i32) -> Vec<NewBatchItem> {
    (0..count)
        .map(|i| NewBatchItem {
            batch_id,
            position: i as i32,
            payload: ItemPayload::new(format!("prompt {i}")),
            max_attempts,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Leases
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_workers_never_share_an_item() {
    let queue = Arc::new(MemoryQueue::new());
    let ids = queue.enqueue(items(1, 200, 3)).await.unwrap();

    let tasks = (0..8).map(|w| {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            let worker = format!("w{w}");
            let mut leased = Vec::new();
            while let Some(lease) = queue.lease(&worker, LEASE).await.unwrap() {
                leased.push(lease.item.id);
                tokio::task::yield_now().await;
            }
            leased
        })
    });

    let mut seen = HashSet::new();
    let mut total = 0;
    for result in join_all(tasks).await {
        for id in result.unwrap() {
            total += 1;
            assert!(seen.insert(id), "item {id} leased twice");
        }
    }
    assert_eq!(total, ids.len());
}

#[tokio::test]
async fn item_is_never_leased_past_its_attempt_cap() {
    let queue = MemoryQueue::new();
    queue.enqueue(items(1, 1, 3)).await.unwrap();

    let mut terminal = None;
    for attempt in 1..=3 {
        let lease = queue.lease("w1", LEASE).await.unwrap().unwrap();
        assert_eq!(lease.item.attempt_count, attempt);
        terminal = queue
            .nack(
                lease.id,
                Nack::Requeue {
                    delay: Duration::ZERO,
                    error: "transient_api: 503".into(),
                },
            )
            .await
            .unwrap();
    }

    let terminal = terminal.expect("third failure is terminal");
    assert_eq!(terminal.outcome, ItemOutcome::Failed);
    assert_eq!(terminal.attempt_count, 3);
    assert!(queue.lease("w1", LEASE).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_runs_each_item_once_without_overlap() {
    let h = Harness::start(ScriptedGenerator::new(), pool_config(8));
    let batch_id = h.submit(&prompts(40)).await;

    let snapshot = h.wait(batch_id).await;
    assert_eq!(snapshot.succeeded, 40);
    assert_eq!(h.generator.calls().len(), 40);
    assert_eq!(h.generator.max_overlap(), 1);
    h.stop().await;
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_snapshot_adds_up() {
    let generator = ScriptedGenerator::new();
    for i in (1..=30).step_by(4) {
        generator.always_fail(
            &format!("prompt {i}"),
            GenerationError::InvalidRequest {
                status: 422,
                body: "bad size".into(),
            },
        );
    }
    for i in (3..=30).step_by(7) {
        generator.always_fail(
            &format!("prompt {i}"),
            GenerationError::Network("connection reset".into()),
        );
    }
    let h = Harness::start(generator, pool_config(4));
    let mut events = h.ctx.tracker.subscribe();

    let batch_id = h.submit(&prompts(30)).await;
    let last = h.wait(batch_id).await;

    let mut seen = 0;
    let mut terminal_events = 0;
    loop {
        match events.try_recv() {
            Ok(event) => {
                let s = event.snapshot();
                assert!(s.is_consistent(), "inconsistent snapshot {s:?}");
                if matches!(event, BatchEvent::Terminal(_)) {
                    terminal_events += 1;
                }
                seen += 1;
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            Err(TryRecvError::Lagged(_)) => continue,
        }
    }

    assert_eq!(seen, 30);
    assert_eq!(terminal_events, 1);
    assert!(last.is_consistent());
    assert_eq!(last.succeeded + last.failed, 30);
    assert_eq!(last.failed, 11);
    assert_eq!(last.status, BatchStatus::Completed);
    h.stop().await;
}
