use chrono::{Duration, Utc};
use rstest::{fixture, rstest};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::db::models::{
    audit_log::{AdjustmentKind, NewAuditEntry},
    balances::{BalanceAmounts, BalanceWrite, UserBalance},
    freeze_records::{FinalizeOutcome, FreezeStatus, FreezeTransition, InsertOutcome, NewFreezeRecord},
    recharge_orders::{NewRechargeOrder, PaymentOutcome, PaymentStatus},
};
use crate::storage::{BalanceStorage, ORDER_ID_CONSTRAINT, Storage, in_memory::InMemoryStorage};
use crate::types::{OrderId, RequestId, UserId};

#[cfg(feature = "postgres-tests")]
use crate::storage::postgres::PostgresStorage;

fn dec(value: i64) -> Decimal {
    Decimal::new(value, 0)
}

fn new_freeze(request_id: &str, user_id: UserId, amount: Decimal) -> NewFreezeRecord {
    NewFreezeRecord {
        request_id: RequestId::from(request_id),
        user_id,
        model_id: "chat".to_string(),
        conversation_id: None,
        amount_frozen: amount,
        estimated_cost: amount,
        failure_reason: None,
    }
}

fn new_order(order_id: &str, user_id: UserId) -> NewRechargeOrder {
    NewRechargeOrder {
        order_id: OrderId::from(order_id),
        user_id,
        package_id: Some("pack_1000".to_string()),
        payment_amount: dec(10),
        credit_amount: dec(1000),
        order_expire_at: Utc::now() + Duration::minutes(30),
    }
}

/// Create a user and bring their balance to `available` with a single swap
async fn funded_user<S: Storage>(storage: &S, available: Decimal) -> UserBalance {
    let user_id = Uuid::new_v4();
    let balance = storage.create_balance(user_id).await.unwrap();
    storage
        .swap_balance(&BalanceWrite::on(
            &balance,
            BalanceAmounts {
                available,
                frozen: Decimal::ZERO,
            },
        ))
        .await
        .unwrap()
        .unwrap()
}

#[fixture]
fn in_memory_storage() -> InMemoryStorage {
    InMemoryStorage::new()
}

async fn run_test_create_balance_is_idempotent<S: Storage>(storage: &S) {
    let balance = funded_user(storage, dec(100)).await;

    let again = storage.create_balance(balance.user_id).await.unwrap();
    assert_eq!(again.available, dec(100));
    assert_eq!(again.version, balance.version);
}

#[rstest]
#[tokio::test]
async fn test_create_balance_is_idempotent(in_memory_storage: InMemoryStorage) {
    run_test_create_balance_is_idempotent(&in_memory_storage).await;
}

#[cfg(feature = "postgres-tests")]
#[sqlx::test]
async fn test_create_balance_is_idempotent_postgres(pool: sqlx::PgPool) {
    run_test_create_balance_is_idempotent(&PostgresStorage::new(pool)).await;
}

async fn run_test_swap_balance_rejects_stale_version<S: Storage>(storage: &S) {
    let balance = funded_user(storage, dec(100)).await;
    let next = BalanceAmounts {
        available: dec(40),
        frozen: dec(60),
    };

    let first = storage.swap_balance(&BalanceWrite::on(&balance, next)).await.unwrap();
    let first = first.expect("fresh version should apply");
    assert_eq!(first.version, balance.version + 1);

    // Same expected version again: must lose
    let second = storage.swap_balance(&BalanceWrite::on(&balance, next)).await.unwrap();
    assert!(second.is_none());

    let stored = storage.get_balance(balance.user_id).await.unwrap().unwrap();
    assert_eq!(stored.available, dec(40));
    assert_eq!(stored.frozen, dec(60));
}

#[rstest]
#[tokio::test]
async fn test_swap_balance_rejects_stale_version(in_memory_storage: InMemoryStorage) {
    run_test_swap_balance_rejects_stale_version(&in_memory_storage).await;
}

#[cfg(feature = "postgres-tests")]
#[sqlx::test]
async fn test_swap_balance_rejects_stale_version_postgres(pool: sqlx::PgPool) {
    run_test_swap_balance_rejects_stale_version(&PostgresStorage::new(pool)).await;
}

async fn run_test_insert_freeze_returns_existing<S: Storage>(storage: &S) {
    let balance = funded_user(storage, dec(100)).await;

    let first = storage.insert_freeze(new_freeze("req-dup", balance.user_id, dec(10)), None).await.unwrap();
    assert!(matches!(first, InsertOutcome::Inserted(ref r) if r.status == FreezeStatus::Frozen));

    let second = storage.insert_freeze(new_freeze("req-dup", balance.user_id, dec(99)), None).await.unwrap();
    match second {
        InsertOutcome::Existing(record) => assert_eq!(record.amount_frozen, dec(10)),
        other => panic!("expected existing record, got {other:?}"),
    }
}

#[rstest]
#[tokio::test]
async fn test_insert_freeze_returns_existing(in_memory_storage: InMemoryStorage) {
    run_test_insert_freeze_returns_existing(&in_memory_storage).await;
}

#[cfg(feature = "postgres-tests")]
#[sqlx::test]
async fn test_insert_freeze_returns_existing_postgres(pool: sqlx::PgPool) {
    run_test_insert_freeze_returns_existing(&PostgresStorage::new(pool)).await;
}

async fn run_test_insert_freeze_with_balance_is_atomic<S: Storage>(storage: &S) {
    let balance = funded_user(storage, dec(100)).await;
    let hold = |from: &UserBalance| {
        BalanceWrite::on(
            from,
            BalanceAmounts {
                available: from.available - dec(30),
                frozen: from.frozen + dec(30),
            },
        )
    };

    // Stale version: neither the record nor the balance change lands
    let stale = UserBalance {
        version: balance.version - 1,
        ..balance.clone()
    };
    let outcome = storage
        .insert_freeze(new_freeze("req-joint", balance.user_id, dec(30)), Some(&hold(&stale)))
        .await
        .unwrap();
    assert_eq!(outcome, InsertOutcome::BalanceConflict);
    assert!(storage.get_freeze(&RequestId::from("req-joint")).await.unwrap().is_none());

    let outcome = storage
        .insert_freeze(new_freeze("req-joint", balance.user_id, dec(30)), Some(&hold(&balance)))
        .await
        .unwrap();
    assert!(matches!(outcome, InsertOutcome::Inserted(_)));
    let stored = storage.get_balance(balance.user_id).await.unwrap().unwrap();
    assert_eq!(stored.available, dec(70));
    assert_eq!(stored.frozen, dec(30));

    // A duplicate key writes nothing, even with a valid balance write
    let outcome = storage
        .insert_freeze(new_freeze("req-joint", balance.user_id, dec(30)), Some(&hold(&stored)))
        .await
        .unwrap();
    assert!(matches!(outcome, InsertOutcome::Existing(_)));
    let unchanged = storage.get_balance(balance.user_id).await.unwrap().unwrap();
    assert_eq!(unchanged, stored);
}

#[rstest]
#[tokio::test]
async fn test_insert_freeze_with_balance_is_atomic(in_memory_storage: InMemoryStorage) {
    run_test_insert_freeze_with_balance_is_atomic(&in_memory_storage).await;
}

#[cfg(feature = "postgres-tests")]
#[sqlx::test]
async fn test_insert_freeze_with_balance_is_atomic_postgres(pool: sqlx::PgPool) {
    run_test_insert_freeze_with_balance_is_atomic(&PostgresStorage::new(pool)).await;
}

async fn run_test_insert_failed_record<S: Storage>(storage: &S) {
    let balance = funded_user(storage, dec(1)).await;
    let mut record = new_freeze("req-poor", balance.user_id, dec(3010));
    record.failure_reason = Some("insufficient_balance".to_string());

    let outcome = storage.insert_freeze(record, None).await.unwrap();
    let InsertOutcome::Inserted(record) = outcome else {
        panic!("expected insert, got {outcome:?}");
    };
    assert_eq!(record.status, FreezeStatus::Failed);
    assert!(record.failed_at.is_some());

    // Failed records are terminal and never listed as stale
    assert!(storage.list_frozen_before(Utc::now() + Duration::seconds(1), 10).await.unwrap().is_empty());
}

#[rstest]
#[tokio::test]
async fn test_insert_failed_record(in_memory_storage: InMemoryStorage) {
    run_test_insert_failed_record(&in_memory_storage).await;
}

#[cfg(feature = "postgres-tests")]
#[sqlx::test]
async fn test_insert_failed_record_postgres(pool: sqlx::PgPool) {
    run_test_insert_failed_record(&PostgresStorage::new(pool)).await;
}

async fn run_test_finalize_freeze_happens_once<S: Storage>(storage: &S) {
    let balance = funded_user(storage, dec(100)).await;
    let request_id = RequestId::from("req-once");
    storage.insert_freeze(new_freeze("req-once", balance.user_id, dec(10)), None).await.unwrap();

    let refund = FreezeTransition::Refund {
        reason: "upstream error".to_string(),
    };
    let first = storage.finalize_freeze(&request_id, &refund, None, Utc::now()).await.unwrap();
    assert!(matches!(first, FinalizeOutcome::Finalized { ref record, .. } if record.status == FreezeStatus::Refunded));

    let settle = FreezeTransition::Settle {
        actual_cost: dec(5),
        uncollected: Decimal::ZERO,
        input_tokens: 1,
        output_tokens: 1,
        failure_reason: None,
    };
    let second = storage.finalize_freeze(&request_id, &settle, None, Utc::now()).await.unwrap();
    match second {
        FinalizeOutcome::AlreadyFinalized(record) => {
            assert_eq!(record.status, FreezeStatus::Refunded);
            assert!(record.actual_cost.is_none());
        }
        other => panic!("expected already finalized, got {other:?}"),
    }

    let missing = storage
        .finalize_freeze(&RequestId::from("req-missing"), &refund, None, Utc::now())
        .await
        .unwrap();
    assert_eq!(missing, FinalizeOutcome::NotFound);
}

#[rstest]
#[tokio::test]
async fn test_finalize_freeze_happens_once(in_memory_storage: InMemoryStorage) {
    run_test_finalize_freeze_happens_once(&in_memory_storage).await;
}

#[cfg(feature = "postgres-tests")]
#[sqlx::test]
async fn test_finalize_freeze_happens_once_postgres(pool: sqlx::PgPool) {
    run_test_finalize_freeze_happens_once(&PostgresStorage::new(pool)).await;
}

async fn run_test_finalize_with_stale_balance_writes_nothing<S: Storage>(storage: &S) {
    let balance = funded_user(storage, dec(100)).await;
    let request_id = RequestId::from("req-stale");
    storage.insert_freeze(new_freeze("req-stale", balance.user_id, dec(10)), None).await.unwrap();

    // Move the balance on so `balance` is stale
    let moved = storage
        .swap_balance(&BalanceWrite::on(
            &balance,
            BalanceAmounts {
                available: dec(90),
                frozen: dec(10),
            },
        ))
        .await
        .unwrap()
        .unwrap();

    let stale_write = BalanceWrite::on(
        &balance,
        BalanceAmounts {
            available: dec(100),
            frozen: Decimal::ZERO,
        },
    );
    let refund = FreezeTransition::Refund {
        reason: "cancelled".to_string(),
    };
    let outcome = storage
        .finalize_freeze(&request_id, &refund, Some(&stale_write), Utc::now())
        .await
        .unwrap();
    assert_eq!(outcome, FinalizeOutcome::BalanceConflict);

    let record = storage.get_freeze(&request_id).await.unwrap().unwrap();
    assert_eq!(record.status, FreezeStatus::Frozen);

    let fresh_write = BalanceWrite::on(
        &moved,
        BalanceAmounts {
            available: dec(100),
            frozen: Decimal::ZERO,
        },
    );
    let outcome = storage
        .finalize_freeze(&request_id, &refund, Some(&fresh_write), Utc::now())
        .await
        .unwrap();
    match outcome {
        FinalizeOutcome::Finalized { record, balance } => {
            assert_eq!(record.status, FreezeStatus::Refunded);
            let balance = balance.unwrap();
            assert_eq!(balance.available, dec(100));
            assert_eq!(balance.frozen, Decimal::ZERO);
        }
        other => panic!("expected finalized, got {other:?}"),
    }
}

#[rstest]
#[tokio::test]
async fn test_finalize_with_stale_balance_writes_nothing(in_memory_storage: InMemoryStorage) {
    run_test_finalize_with_stale_balance_writes_nothing(&in_memory_storage).await;
}

#[cfg(feature = "postgres-tests")]
#[sqlx::test]
async fn test_finalize_with_stale_balance_writes_nothing_postgres(pool: sqlx::PgPool) {
    run_test_finalize_with_stale_balance_writes_nothing(&PostgresStorage::new(pool)).await;
}

async fn run_test_list_frozen_before_skips_terminal<S: Storage>(storage: &S) {
    let balance = funded_user(storage, dec(100)).await;
    storage.insert_freeze(new_freeze("req-a", balance.user_id, dec(1)), None).await.unwrap();
    storage.insert_freeze(new_freeze("req-b", balance.user_id, dec(1)), None).await.unwrap();
    storage
        .finalize_freeze(
            &RequestId::from("req-b"),
            &FreezeTransition::Fail {
                reason: "contention".to_string(),
            },
            None,
            Utc::now(),
        )
        .await
        .unwrap();

    let stale = storage.list_frozen_before(Utc::now() + Duration::seconds(1), 10).await.unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].request_id.as_str(), "req-a");

    let none = storage.list_frozen_before(Utc::now() - Duration::hours(1), 10).await.unwrap();
    assert!(none.is_empty());
}

#[rstest]
#[tokio::test]
async fn test_list_frozen_before_skips_terminal(in_memory_storage: InMemoryStorage) {
    run_test_list_frozen_before_skips_terminal(&in_memory_storage).await;
}

#[cfg(feature = "postgres-tests")]
#[sqlx::test]
async fn test_list_frozen_before_skips_terminal_postgres(pool: sqlx::PgPool) {
    run_test_list_frozen_before_skips_terminal(&PostgresStorage::new(pool)).await;
}

async fn run_test_insert_order_rejects_duplicate_id<S: Storage>(storage: &S) {
    let balance = funded_user(storage, Decimal::ZERO).await;
    storage.insert_order(new_order("RC1", balance.user_id)).await.unwrap();

    let err = storage.insert_order(new_order("RC1", balance.user_id)).await.unwrap_err();
    assert!(err.is_unique_violation_on(ORDER_ID_CONSTRAINT), "unexpected error: {err:?}");
}

#[rstest]
#[tokio::test]
async fn test_insert_order_rejects_duplicate_id(in_memory_storage: InMemoryStorage) {
    run_test_insert_order_rejects_duplicate_id(&in_memory_storage).await;
}

#[cfg(feature = "postgres-tests")]
#[sqlx::test]
async fn test_insert_order_rejects_duplicate_id_postgres(pool: sqlx::PgPool) {
    run_test_insert_order_rejects_duplicate_id(&PostgresStorage::new(pool)).await;
}

async fn run_test_complete_order_payment_credits_once<S: Storage>(storage: &S) {
    let balance = funded_user(storage, Decimal::ZERO).await;
    let order_id = OrderId::from("RC2");
    storage.insert_order(new_order("RC2", balance.user_id)).await.unwrap();

    let credit = BalanceWrite::on(
        &balance,
        BalanceAmounts {
            available: dec(1000),
            frozen: Decimal::ZERO,
        },
    );
    let outcome = storage
        .complete_order_payment(&order_id, "wx-1", Utc::now(), &credit)
        .await
        .unwrap();
    let credited = match outcome {
        PaymentOutcome::Completed { order, balance } => {
            assert_eq!(order.payment_status, PaymentStatus::Paid);
            assert_eq!(order.wechat_transaction_id.as_deref(), Some("wx-1"));
            balance
        }
        other => panic!("expected completed, got {other:?}"),
    };
    assert_eq!(credited.available, dec(1000));

    let replay = BalanceWrite::on(
        &credited,
        BalanceAmounts {
            available: dec(2000),
            frozen: Decimal::ZERO,
        },
    );
    let outcome = storage
        .complete_order_payment(&order_id, "wx-1", Utc::now(), &replay)
        .await
        .unwrap();
    assert!(matches!(outcome, PaymentOutcome::AlreadyPaid(_)));

    let stored = storage.get_balance(balance.user_id).await.unwrap().unwrap();
    assert_eq!(stored.available, dec(1000));
}

#[rstest]
#[tokio::test]
async fn test_complete_order_payment_credits_once(in_memory_storage: InMemoryStorage) {
    run_test_complete_order_payment_credits_once(&in_memory_storage).await;
}

#[cfg(feature = "postgres-tests")]
#[sqlx::test]
async fn test_complete_order_payment_credits_once_postgres(pool: sqlx::PgPool) {
    run_test_complete_order_payment_credits_once(&PostgresStorage::new(pool)).await;
}

async fn run_test_transaction_id_settles_one_order<S: Storage>(storage: &S) {
    let balance = funded_user(storage, Decimal::ZERO).await;
    storage.insert_order(new_order("RC3", balance.user_id)).await.unwrap();
    storage.insert_order(new_order("RC4", balance.user_id)).await.unwrap();

    let credit = BalanceWrite::on(
        &balance,
        BalanceAmounts {
            available: dec(1000),
            frozen: Decimal::ZERO,
        },
    );
    let outcome = storage
        .complete_order_payment(&OrderId::from("RC3"), "wx-shared", Utc::now(), &credit)
        .await
        .unwrap();
    let PaymentOutcome::Completed { balance: credited, .. } = outcome else {
        panic!("expected completed, got {outcome:?}");
    };

    let second = BalanceWrite::on(
        &credited,
        BalanceAmounts {
            available: dec(2000),
            frozen: Decimal::ZERO,
        },
    );
    let outcome = storage
        .complete_order_payment(&OrderId::from("RC4"), "wx-shared", Utc::now(), &second)
        .await
        .unwrap();
    assert_eq!(outcome, PaymentOutcome::DuplicateTransaction);

    let order = storage.get_order(&OrderId::from("RC4")).await.unwrap().unwrap();
    assert_eq!(order.payment_status, PaymentStatus::Pending);
    let stored = storage.get_balance(balance.user_id).await.unwrap().unwrap();
    assert_eq!(stored.available, dec(1000));
}

#[rstest]
#[tokio::test]
async fn test_transaction_id_settles_one_order(in_memory_storage: InMemoryStorage) {
    run_test_transaction_id_settles_one_order(&in_memory_storage).await;
}

#[cfg(feature = "postgres-tests")]
#[sqlx::test]
async fn test_transaction_id_settles_one_order_postgres(pool: sqlx::PgPool) {
    run_test_transaction_id_settles_one_order(&PostgresStorage::new(pool)).await;
}

async fn run_test_cancel_expired_orders_skips_flagged<S: Storage>(storage: &S) {
    let balance = funded_user(storage, Decimal::ZERO).await;
    for id in ["RC5", "RC6", "RC7"] {
        storage.insert_order(new_order(id, balance.user_id)).await.unwrap();
    }
    storage.flag_order_for_review(&OrderId::from("RC6"), "amount mismatch").await.unwrap();

    let later = Utc::now() + Duration::hours(1);
    let cancelled = storage.cancel_expired_orders(later).await.unwrap();
    assert_eq!(cancelled, vec![OrderId::from("RC5"), OrderId::from("RC7")]);

    let flagged = storage.get_order(&OrderId::from("RC6")).await.unwrap().unwrap();
    assert_eq!(flagged.payment_status, PaymentStatus::Pending);
    assert!(flagged.flagged_for_review);

    // Nothing left to cancel
    assert!(storage.cancel_expired_orders(later).await.unwrap().is_empty());
}

#[rstest]
#[tokio::test]
async fn test_cancel_expired_orders_skips_flagged(in_memory_storage: InMemoryStorage) {
    run_test_cancel_expired_orders_skips_flagged(&in_memory_storage).await;
}

#[cfg(feature = "postgres-tests")]
#[sqlx::test]
async fn test_cancel_expired_orders_skips_flagged_postgres(pool: sqlx::PgPool) {
    run_test_cancel_expired_orders_skips_flagged(&PostgresStorage::new(pool)).await;
}

async fn run_test_audit_entries_newest_first<S: Storage>(storage: &S) {
    let mut balance = funded_user(storage, Decimal::ZERO).await;
    let other = funded_user(storage, Decimal::ZERO).await;
    let admin = Uuid::new_v4();

    for amount in [10, 20] {
        let write = BalanceWrite::on(
            &balance,
            BalanceAmounts {
                available: balance.available + dec(amount),
                frozen: Decimal::ZERO,
            },
        );
        let entry = NewAuditEntry {
            admin_id: admin,
            user_id: balance.user_id,
            operation_type: AdjustmentKind::Grant,
            amount: dec(amount),
            reason: Some("promo".to_string()),
        };
        let (_, updated) = storage.append_adjustment(entry, &write).await.unwrap().unwrap();
        balance = updated;
    }
    assert_eq!(balance.available, dec(30));

    let entries = storage.list_audit_entries(Some(balance.user_id), 10).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].amount, dec(20));
    assert_eq!(entries[1].amount, dec(10));

    assert!(storage.list_audit_entries(Some(other.user_id), 10).await.unwrap().is_empty());
    assert_eq!(storage.list_audit_entries(None, 1).await.unwrap().len(), 1);
}

#[rstest]
#[tokio::test]
async fn test_audit_entries_newest_first(in_memory_storage: InMemoryStorage) {
    run_test_audit_entries_newest_first(&in_memory_storage).await;
}

#[cfg(feature = "postgres-tests")]
#[sqlx::test]
async fn test_audit_entries_newest_first_postgres(pool: sqlx::PgPool) {
    run_test_audit_entries_newest_first(&PostgresStorage::new(pool)).await;
}

async fn run_test_adjustment_on_stale_version_is_not_logged<S: Storage>(storage: &S) {
    let balance = funded_user(storage, dec(50)).await;
    let stale = UserBalance {
        version: balance.version - 1,
        ..balance.clone()
    };
    let write = BalanceWrite::on(
        &stale,
        BalanceAmounts {
            available: dec(40),
            frozen: Decimal::ZERO,
        },
    );
    let entry = NewAuditEntry {
        admin_id: Uuid::new_v4(),
        user_id: balance.user_id,
        operation_type: AdjustmentKind::Deduct,
        amount: dec(10),
        reason: None,
    };
    assert!(storage.append_adjustment(entry, &write).await.unwrap().is_none());
    assert!(storage.list_audit_entries(Some(balance.user_id), 10).await.unwrap().is_empty());
}

#[rstest]
#[tokio::test]
async fn test_adjustment_on_stale_version_is_not_logged(in_memory_storage: InMemoryStorage) {
    run_test_adjustment_on_stale_version_is_not_logged(&in_memory_storage).await;
}

#[cfg(feature = "postgres-tests")]
#[sqlx::test]
async fn test_adjustment_on_stale_version_is_not_logged_postgres(pool: sqlx::PgPool) {
    run_test_adjustment_on_stale_version_is_not_logged(&PostgresStorage::new(pool)).await;
}

#[tokio::test]
async fn test_injected_conflicts_are_consumed() {
    let storage = InMemoryStorage::new();
    let balance = funded_user(&storage, dec(10)).await;
    storage.inject_conflicts(2);

    let write = BalanceWrite::on(
        &balance,
        BalanceAmounts {
            available: dec(5),
            frozen: dec(5),
        },
    );
    assert!(storage.swap_balance(&write).await.unwrap().is_none());
    assert!(storage.swap_balance(&write).await.unwrap().is_none());
    assert!(storage.swap_balance(&write).await.unwrap().is_some());
}
