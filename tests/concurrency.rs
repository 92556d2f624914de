mod common;

use common::{deferred_policy, harness_with, join_request, Harness};
use futures::future::join_all;
use restock_waitlist::db;
use restock_waitlist::deposit::PaymentOutcome;
use restock_waitlist::model::OrderStatus;
use restock_waitlist::WaitlistError;
use tempfile::TempDir;

/// File-backed database so concurrent writers contend on real locks.
async fn file_harness() -> (TempDir, Harness) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("waitlist.db").display());
    let pool = db::init_pool(&url).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    let h = harness_with(pool, deferred_policy()).await;
    (dir, h)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_joins_admit_one_entry_per_email() {
    let (_dir, h) = file_harness().await;
    h.catalog.put(42, None, 4_000, false).await;

    let attempts = (0..8).map(|i| {
        let email = if i % 2 == 0 { "Same@X.com" } else { "same@x.com" };
        h.engine.join(join_request(42, email))
    });
    let results = join_all(attempts).await;

    let ok = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(ok, 1);
    for result in results.iter().filter(|r| r.is_err()) {
        assert!(matches!(result, Err(WaitlistError::AlreadyOnWaitlist)));
    }
    assert_eq!(h.engine.count_active(42, None).await.unwrap(), 1);
    assert_eq!(h.jobs_of_type("join_confirmed").await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_joins_get_distinct_positions() {
    let (_dir, h) = file_harness().await;
    h.catalog.put(42, None, 4_000, false).await;

    let emails: Vec<String> = (0..6).map(|i| format!("u{i}@x.com")).collect();
    let results = join_all(emails.iter().map(|e| h.engine.join(join_request(42, e)))).await;
    let mut positions: Vec<i64> = results.into_iter().map(|r| r.unwrap().position).collect();
    positions.sort_unstable();
    assert_eq!(positions, vec![1, 2, 3, 4, 5, 6]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_webhooks_confirm_once() {
    let (_dir, h) = file_harness().await;
    h.catalog.put(42, None, 4_000, false).await;
    let joined = h.join(42, "paid@x.com").await;
    let checkout = h.engine.request_deposit(joined.entry_id).await.unwrap();

    let deliveries = (0..4).map(|_| {
        h.engine
            .on_payment_status_changed(&checkout.order_ref, &OrderStatus::Completed)
    });
    let outcomes: Vec<PaymentOutcome> = join_all(deliveries)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let newly = outcomes
        .iter()
        .filter(|o| matches!(o, PaymentOutcome::Promoted { newly_confirmed: true }))
        .count();
    assert_eq!(newly, 1);
    assert_eq!(h.jobs_of_type("deposit_confirmed").await, 1);
    assert_eq!(h.engine.live_rank(joined.entry_id).await.unwrap(), 1);
}
