//! End-to-end store scenarios crossing repository boundaries.

use chrono::{TimeZone, Utc};

use quill_models::{PaymentStatus, PurchaseLookup, SubscriptionTier, UsageContext, UsageFeature};
use quill_store::{InitiatePurchase, Store};

/// A user on a 1000-token limit burns through it in three chunks; each
/// write lands in the ledger, and by the time the limit is hit the full
/// alert set exists exactly once.
#[tokio::test]
async fn test_burn_through_quota_in_chunks() {
    let store = Store::in_memory().await.unwrap();
    let now = Utc.with_ymd_and_hms(2025, 6, 10, 12, 0, 0).unwrap();

    // Shrink the limit so the scenario stays readable
    store
        .quota()
        .get_or_create("u1", SubscriptionTier::Free)
        .await
        .unwrap();
    sqlx::query("UPDATE quota_accounts SET monthly_limit = 1000 WHERE user_id = 'u1'")
        .execute(store.pool())
        .await
        .unwrap();

    let ctx = UsageContext::new(UsageFeature::CharacterChat).with_conversation(1);

    let account = store
        .quota()
        .record_usage("u1", 400, &ctx, SubscriptionTier::Free, false, now)
        .await
        .unwrap();
    assert_eq!(account.current_usage, 400);
    assert!(!account.is_over_quota());

    let account = store
        .quota()
        .record_usage("u1", 400, &ctx, SubscriptionTier::Free, false, now)
        .await
        .unwrap();
    assert_eq!(account.current_usage, 800);

    let account = store
        .quota()
        .record_usage("u1", 400, &ctx, SubscriptionTier::Free, false, now)
        .await
        .unwrap();
    assert_eq!(account.current_usage, 1200);
    assert!(account.is_over_quota());

    // Ledger has all three events
    let (events, _) = store.usage().list_page("u1", 10, None).await.unwrap();
    assert_eq!(events.len(), 3);
    assert_eq!(store.usage().month_total("u1", 2025, 6).await.unwrap(), 1200);

    // Full alert set, each threshold exactly once
    let alerts = store.alerts().list("u1", true).await.unwrap();
    let mut thresholds: Vec<i64> = alerts.iter().map(|a| a.threshold).collect();
    thresholds.sort_unstable();
    assert_eq!(thresholds, vec![50, 80, 95, 100]);
}

/// Purchase credits survive the monthly reset of the usage counter:
/// the limit is permanent until the tier changes, only usage resets.
#[tokio::test]
async fn test_purchased_tokens_survive_reset() {
    let store = Store::in_memory().await.unwrap();
    let june = Utc.with_ymd_and_hms(2025, 6, 10, 0, 0, 0).unwrap();
    let july = Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap();

    let ctx = UsageContext::new(UsageFeature::StoryAssistance);
    store
        .quota()
        .record_usage("u1", 10_000, &ctx, SubscriptionTier::Free, false, june)
        .await
        .unwrap();

    let purchase = store
        .purchases()
        .initiate(
            &InitiatePurchase {
                user_id: "u1".to_string(),
                tokens_purchased: 25_000,
                amount_paid_cents: 999,
                currency: "USD".to_string(),
                payment_provider: "stripe".to_string(),
                idempotency_key: Some("scenario-key".to_string()),
            },
            june,
        )
        .await
        .unwrap();
    store
        .purchases()
        .complete(&PurchaseLookup::PurchaseId(purchase.id), Some("pay_1"), june)
        .await
        .unwrap();

    let account = store.quota().get("u1").await.unwrap().unwrap();
    assert_eq!(account.monthly_limit, 75_000);
    assert_eq!(account.current_usage, 10_000);

    // July rolls the counter but not the limit
    assert!(store.quota().check_and_reset("u1", july).await.unwrap());
    let account = store.quota().get("u1").await.unwrap().unwrap();
    assert_eq!(account.monthly_limit, 75_000);
    assert_eq!(account.current_usage, 0);

    // June was archived with the usage it ended on
    let months = store.history().list_for_user("u1").await.unwrap();
    assert_eq!(months.len(), 1);
    assert_eq!(months[0].month, 6);
    assert_eq!(months[0].total_usage, 10_000);
    assert_eq!(months[0].allocated_limit, 75_000);
}

/// Concurrent writers on the production pool shape (file-backed, WAL,
/// multiple connections) serialize on the write lock instead of
/// failing with a busy error, and no increment is lost.
#[tokio::test]
async fn test_concurrent_writers_on_file_backed_pool() {
    let path = std::env::temp_dir().join(format!("quill-scenario-{}.db", uuid::Uuid::new_v4()));
    let url = format!("sqlite://{}", path.display());
    let store = Store::connect(&url).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..10 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let ctx = UsageContext::new(UsageFeature::CharacterChat);
            store
                .quota()
                .record_usage(
                    &format!("u{}", i % 2),
                    100,
                    &ctx,
                    SubscriptionTier::Free,
                    false,
                    Utc::now(),
                )
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    for user in ["u0", "u1"] {
        let account = store.quota().get(user).await.unwrap().unwrap();
        assert_eq!(account.current_usage, 500);
        let (events, _) = store.usage().list_page(user, 10, None).await.unwrap();
        assert_eq!(events.len(), 5);
    }

    store.pool().close().await;
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{}", path.display(), suffix));
    }
}

/// A client retrying an interrupted checkout with the same idempotency
/// key never produces a second charge or a second credit.
#[tokio::test]
async fn test_checkout_retry_is_idempotent() {
    let store = Store::in_memory().await.unwrap();
    let now = Utc::now();

    let request = InitiatePurchase {
        user_id: "u1".to_string(),
        tokens_purchased: 5_000,
        amount_paid_cents: 499,
        currency: "USD".to_string(),
        payment_provider: "stripe".to_string(),
        idempotency_key: Some("abc".to_string()),
    };

    let first = store.purchases().initiate(&request, now).await.unwrap();
    let retry = store.purchases().initiate(&request, now).await.unwrap();
    assert_eq!(first.id, retry.id);

    let lookup = PurchaseLookup::TransactionId(first.transaction_id);
    store.purchases().complete(&lookup, Some("pay_7"), now).await.unwrap();
    let again = store.purchases().complete(&lookup, Some("pay_8"), now).await.unwrap();
    assert_eq!(again.payment_status, PaymentStatus::Completed);
    assert_eq!(again.payment_id.as_deref(), Some("pay_7"));

    let account = store.quota().get("u1").await.unwrap().unwrap();
    assert_eq!(account.monthly_limit, 5_000);

    // The settled key can no longer spawn a new transaction
    let after = store.purchases().initiate(&request, now).await.unwrap();
    assert_eq!(after.id, first.id);
    assert_eq!(after.payment_status, PaymentStatus::Completed);
}
