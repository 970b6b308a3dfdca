//! Integration tests for the batch repositories against a real database.
//!
//! Run with `DATABASE_URL` set and `cargo test -- --ignored`.

use genbatch_core::batch::{ItemOutcome, ItemPayload, NewBatch, NewBatchItem};
use genbatch_core::credentials::SealedCredential;
use genbatch_core::status::{BatchStatus, ItemStatus};
use genbatch_db::models::result_asset::CreateResultAsset;
use genbatch_db::repositories::{BatchRepo, ItemRepo, ResultAssetRepo};
use sqlx::PgPool;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn sealed() -> SealedCredential {
    SealedCredential {
        ciphertext: vec![1, 2, 3, 4],
        nonce: vec![0; 12],
    }
}

async fn seed_batch(pool: &PgPool, prompts: &[&str], max_attempts: i32) -> (i64, Vec<i64>) {
    let batch = BatchRepo::create(
        pool,
        &NewBatch {
            owner_id: 1,
            total_items: prompts.len() as i32,
            credential: sealed(),
        },
    )
    .await
    .unwrap();

    let items: Vec<NewBatchItem> = prompts
        .iter()
        .enumerate()
        .map(|(i, prompt)| NewBatchItem {
            batch_id: batch.id,
            position: i as i32,
            payload: ItemPayload::new(*prompt),
            max_attempts,
        })
        .collect();
    let ids = ItemRepo::insert_many(pool, &items).await.unwrap();
    (batch.id, ids)
}

async fn expire_leases(pool: &PgPool) {
    sqlx::query("UPDATE batch_items SET lease_expires_at = NOW() - INTERVAL '1 second' WHERE lease_id IS NOT NULL")
        .execute(pool)
        .await
        .unwrap();
}

// ---------------------------------------------------------------------------
// Leasing
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn claim_leases_each_item_once(pool: PgPool) {
    let (_, ids) = seed_batch(&pool, &["a", "b"], 3).await;

    let first = ItemRepo::claim_next(&pool, Uuid::new_v4(), "w1", 60.0)
        .await
        .unwrap()
        .unwrap();
    let second = ItemRepo::claim_next(&pool, Uuid::new_v4(), "w2", 60.0)
        .await
        .unwrap()
        .unwrap();
    assert_ne!(first.id, second.id);
    assert_eq!(first.attempt_count, 1);
    assert_eq!(first.status().unwrap(), ItemStatus::Leased);
    assert!(ids.contains(&first.id) && ids.contains(&second.id));

    let none = ItemRepo::claim_next(&pool, Uuid::new_v4(), "w3", 60.0)
        .await
        .unwrap();
    assert!(none.is_none());
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn cancelled_batch_is_not_leased(pool: PgPool) {
    let (batch_id, _) = seed_batch(&pool, &["a"], 3).await;
    BatchRepo::request_cancel(&pool, batch_id).await.unwrap().unwrap();

    let claimed = ItemRepo::claim_next(&pool, Uuid::new_v4(), "w1", 60.0)
        .await
        .unwrap();
    assert!(claimed.is_none());

    let skipped = ItemRepo::finish_queued(&pool, batch_id, ItemStatus::Skipped, "cancelled: batch cancelled")
        .await
        .unwrap();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].status().unwrap(), ItemStatus::Skipped);

    let swept = ItemRepo::finish_halted(&pool, "cancelled: batch cancelled").await.unwrap();
    assert!(swept.is_empty());
}

// ---------------------------------------------------------------------------
// Lease ownership
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn stale_lease_cannot_complete(pool: PgPool) {
    seed_batch(&pool, &["a"], 3).await;
    let stale = Uuid::new_v4();
    ItemRepo::claim_next(&pool, stale, "w1", 60.0).await.unwrap().unwrap();

    expire_leases(&pool).await;
    let reclaimed = ItemRepo::reclaim_expired(&pool, "lease_expired: w1").await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].status().unwrap(), ItemStatus::Queued);

    let fresh = Uuid::new_v4();
    let again = ItemRepo::claim_next(&pool, fresh, "w2", 60.0).await.unwrap().unwrap();
    assert_eq!(again.attempt_count, 2);

    assert!(ItemRepo::finish(&pool, stale, ItemStatus::Failed, "late").await.unwrap().is_none());
    let done = ItemRepo::finish(&pool, fresh, ItemStatus::Failed, "permanent_api: nope")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.terminal().unwrap().unwrap().outcome, ItemOutcome::Failed);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn requeue_fails_item_after_last_attempt(pool: PgPool) {
    seed_batch(&pool, &["a"], 2).await;

    let lease = Uuid::new_v4();
    ItemRepo::claim_next(&pool, lease, "w1", 60.0).await.unwrap().unwrap();
    let row = ItemRepo::requeue(&pool, lease, 0.0, "transient_api: 503").await.unwrap().unwrap();
    assert_eq!(row.status().unwrap(), ItemStatus::Queued);

    let lease = Uuid::new_v4();
    ItemRepo::claim_next(&pool, lease, "w1", 60.0).await.unwrap().unwrap();
    let row = ItemRepo::requeue(&pool, lease, 0.0, "transient_api: 503").await.unwrap().unwrap();
    assert_eq!(row.status().unwrap(), ItemStatus::Failed);
    assert_eq!(row.attempt_count, 2);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn requeued_item_waits_for_backoff(pool: PgPool) {
    seed_batch(&pool, &["a"], 3).await;
    let lease = Uuid::new_v4();
    ItemRepo::claim_next(&pool, lease, "w1", 60.0).await.unwrap().unwrap();
    ItemRepo::requeue(&pool, lease, 3600.0, "transient_api: 429").await.unwrap().unwrap();

    assert!(ItemRepo::claim_next(&pool, Uuid::new_v4(), "w1", 60.0).await.unwrap().is_none());
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn concurrent_claims_never_share_an_item(pool: PgPool) {
    let prompts: Vec<String> = (0..12).map(|i| format!("prompt {i}")).collect();
    let refs: Vec<&str> = prompts.iter().map(String::as_str).collect();
    let (_, ids) = seed_batch(&pool, &refs, 3).await;

    let handles: Vec<_> = (0..6)
        .map(|n| {
            let pool = pool.clone();
            tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(row) =
                    ItemRepo::claim_next(&pool, Uuid::new_v4(), &format!("w{n}"), 60.0)
                        .await
                        .unwrap()
                {
                    claimed.push(row.id);
                }
                claimed
            })
        })
        .collect();

    let mut claimed = Vec::new();
    for handle in handles {
        claimed.extend(handle.await.unwrap());
    }
    claimed.sort_unstable();
    let mut expected = ids;
    expected.sort_unstable();
    assert_eq!(claimed, expected);
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

/// Lease the next item and end it with `status`. Returns the item ID.
async fn run_next(pool: &PgPool, status: ItemStatus) -> i64 {
    let lease = Uuid::new_v4();
    let row = ItemRepo::claim_next(pool, lease, "w1", 60.0).await.unwrap().unwrap();
    match status {
        ItemStatus::Succeeded => ItemRepo::complete(pool, lease, 0).await.unwrap().unwrap(),
        other => ItemRepo::finish(pool, lease, other, "permanent_api: 400")
            .await
            .unwrap()
            .unwrap(),
    };
    row.id
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn draining_completes_batch_and_discards_credential(pool: PgPool) {
    let (batch_id, _) = seed_batch(&pool, &["a", "b"], 3).await;
    assert!(BatchRepo::mark_running(&pool, batch_id).await.unwrap());

    let a = run_next(&pool, ItemStatus::Succeeded).await;
    let row = BatchRepo::record_outcome(&pool, batch_id, a).await.unwrap().unwrap();
    assert_eq!(row.status_id, BatchStatus::Running.id());
    assert_eq!(row.succeeded_count, 1);
    assert!(BatchRepo::credential(&pool, batch_id).await.unwrap().is_some());

    let b = run_next(&pool, ItemStatus::Failed).await;
    let row = BatchRepo::record_outcome(&pool, batch_id, b).await.unwrap().unwrap();
    assert_eq!(row.status_id, BatchStatus::Completed.id());
    assert_eq!(row.failed_count, 1);
    assert!(row.completed_at.is_some());
    assert!(BatchRepo::credential(&pool, batch_id).await.unwrap().is_none());
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn outcome_is_counted_once_and_only_when_terminal(pool: PgPool) {
    let (batch_id, ids) = seed_batch(&pool, &["a", "b"], 3).await;

    // Still queued.
    assert!(BatchRepo::record_outcome(&pool, batch_id, ids[0]).await.unwrap().is_none());

    let a = run_next(&pool, ItemStatus::Failed).await;
    assert!(BatchRepo::record_outcome(&pool, batch_id, a).await.unwrap().is_some());
    assert!(BatchRepo::record_outcome(&pool, batch_id, a).await.unwrap().is_none());

    let batch = BatchRepo::find_by_id(&pool, batch_id).await.unwrap().unwrap();
    assert_eq!((batch.failed_count, batch.succeeded_count), (1, 0));
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn reconcile_repairs_missed_counter_updates(pool: PgPool) {
    let (batch_id, _) = seed_batch(&pool, &["a"], 3).await;
    let item_id = run_next(&pool, ItemStatus::Failed).await;

    // Counter update never happened.
    assert_eq!(BatchRepo::reconcile_counters(&pool).await.unwrap(), 1);
    let batch = BatchRepo::find_by_id(&pool, batch_id).await.unwrap().unwrap();
    assert_eq!(batch.failed_count, 1);
    assert_eq!(batch.status_id, BatchStatus::Failed.id());

    assert_eq!(BatchRepo::reconcile_counters(&pool).await.unwrap(), 0);
    // The late report from the original worker is a no-op.
    assert!(BatchRepo::record_outcome(&pool, batch_id, item_id).await.unwrap().is_none());
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn reconcile_racing_live_reports_counts_each_item_once(pool: PgPool) {
    let prompts: Vec<String> = (0..20).map(|i| format!("prompt {i}")).collect();
    let refs: Vec<&str> = prompts.iter().map(String::as_str).collect();
    let (batch_id, _) = seed_batch(&pool, &refs, 3).await;

    let mut finished = Vec::new();
    for i in 0..20 {
        let status = if i % 4 == 0 { ItemStatus::Failed } else { ItemStatus::Succeeded };
        finished.push(run_next(&pool, status).await);
    }

    let reconcilers: Vec<_> = (0..2)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move { BatchRepo::reconcile_counters(&pool).await.unwrap() })
        })
        .collect();
    let reporters: Vec<_> = finished
        .into_iter()
        .map(|item_id| {
            let pool = pool.clone();
            tokio::spawn(async move {
                BatchRepo::record_outcome(&pool, batch_id, item_id).await.unwrap()
            })
        })
        .collect();
    for handle in reconcilers {
        handle.await.unwrap();
    }
    for handle in reporters {
        handle.await.unwrap();
    }

    let batch = BatchRepo::find_by_id(&pool, batch_id).await.unwrap().unwrap();
    assert_eq!((batch.succeeded_count, batch.failed_count), (15, 5));
    assert_eq!(batch.status_id, BatchStatus::Completed.id());
    assert_eq!(BatchRepo::reconcile_counters(&pool).await.unwrap(), 0);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn abandon_fails_all_pending_items(pool: PgPool) {
    let batch = BatchRepo::create(
        &pool,
        &NewBatch {
            owner_id: 1,
            total_items: 3,
            credential: sealed(),
        },
    )
    .await
    .unwrap();

    let row = BatchRepo::abandon(&pool, batch.id, "storage: insert failed")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.failed_count, 3);
    assert_eq!(row.status_id, BatchStatus::Failed.id());
    assert_eq!(row.abort_reason.as_deref(), Some("storage: insert failed"));
    assert!(BatchRepo::credential(&pool, batch.id).await.unwrap().is_none());
    assert!(BatchRepo::abandon(&pool, batch.id, "again").await.unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn result_insert_is_idempotent_per_delivery(pool: PgPool) {
    let (batch_id, ids) = seed_batch(&pool, &["a"], 3).await;
    let input = CreateResultAsset {
        item_id: ids[0],
        batch_id,
        attempt: 1,
        storage_path: format!("{batch_id}/{}-1.png", ids[0]),
        content_type: "image/png".into(),
        size_bytes: 4,
        checksum: "abcd".into(),
    };
    let first = ResultAssetRepo::insert_or_get(&pool, &input).await.unwrap();
    let again = ResultAssetRepo::insert_or_get(
        &pool,
        &CreateResultAsset {
            checksum: "other".into(),
            ..input.clone()
        },
    )
    .await
    .unwrap();
    assert_eq!(first.id, again.id);
    assert_eq!(again.checksum, "abcd");

    let second = ResultAssetRepo::insert_or_get(
        &pool,
        &CreateResultAsset {
            attempt: 2,
            storage_path: format!("{batch_id}/{}-2.png", ids[0]),
            checksum: "ef01".into(),
            ..input.clone()
        },
    )
    .await
    .unwrap();
    assert_ne!(first.id, second.id);
    assert_eq!(second.checksum, "ef01");
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn only_committed_results_are_listed_and_kept(pool: PgPool) {
    let (batch_id, ids) = seed_batch(&pool, &["a"], 3).await;
    let asset = |attempt: i32| CreateResultAsset {
        item_id: ids[0],
        batch_id,
        attempt,
        storage_path: format!("{batch_id}/{}-{attempt}.png", ids[0]),
        content_type: "image/png".into(),
        size_bytes: 4,
        checksum: format!("sum{attempt}"),
    };
    let stale = ResultAssetRepo::insert_or_get(&pool, &asset(1)).await.unwrap();
    let fresh = ResultAssetRepo::insert_or_get(&pool, &asset(2)).await.unwrap();
    assert!(ResultAssetRepo::list_by_batch(&pool, batch_id).await.unwrap().is_empty());

    let lease = Uuid::new_v4();
    ItemRepo::claim_next(&pool, lease, "w1", 60.0).await.unwrap().unwrap();
    ItemRepo::complete(&pool, lease, fresh.id).await.unwrap().unwrap();

    let listed = ResultAssetRepo::list_by_batch(&pool, batch_id).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, fresh.id);
    assert_eq!(listed[0].attempt, 2);

    assert!(ResultAssetRepo::delete_unreferenced(&pool, fresh.id).await.unwrap().is_none());
    let deleted = ResultAssetRepo::delete_unreferenced(&pool, stale.id).await.unwrap().unwrap();
    assert_eq!(deleted.storage_path, stale.storage_path);
    assert!(ResultAssetRepo::find_by_delivery(&pool, ids[0], 1).await.unwrap().is_none());
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn lease_check_tracks_expiry_and_completion(pool: PgPool) {
    seed_batch(&pool, &["a"], 3).await;
    let lease = Uuid::new_v4();
    ItemRepo::claim_next(&pool, lease, "w1", 60.0).await.unwrap().unwrap();
    assert!(ItemRepo::is_held(&pool, lease).await.unwrap());

    expire_leases(&pool).await;
    assert!(!ItemRepo::is_held(&pool, lease).await.unwrap());
    assert!(!ItemRepo::is_held(&pool, Uuid::new_v4()).await.unwrap());
}
