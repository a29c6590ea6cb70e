//! PostgreSQL storage implementation.
//!
//! Joint writes run in a single transaction. The balance row is always the last row locked, so
//! concurrent finalize, payment and adjustment transactions cannot deadlock against each other.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgConnection, PgPool};

use super::{AuditStorage, BalanceStorage, FreezeStorage, OrderStorage};
use crate::db::errors::{DbError, Result};
use crate::db::models::{
    audit_log::{AuditEntry, NewAuditEntry},
    balances::{BalanceWrite, UserBalance},
    freeze_records::{FinalizeOutcome, FreezeRecord, FreezeStatus, FreezeTransition, InsertOutcome, NewFreezeRecord},
    recharge_orders::{NewRechargeOrder, PaymentOutcome, PaymentStatus, RechargeOrder},
};
use crate::types::{OrderId, RequestId, UserId};

/// Partial unique index guarding a gateway transaction id across paid orders
pub const PAID_TRANSACTION_CONSTRAINT: &str = "recharge_orders_paid_transaction_unique";

const BALANCE_COLUMNS: &str = "user_id, available, frozen, version, updated_at";

const FREEZE_COLUMNS: &str = "request_id, user_id, model_id, conversation_id, amount_frozen, estimated_cost, status, \
     actual_cost, uncollected_amount, input_tokens, output_tokens, failure_reason, frozen_at, settled_at, refunded_at, failed_at";

const ORDER_COLUMNS: &str = "order_id, user_id, package_id, payment_amount, credit_amount, payment_status, \
     wechat_transaction_id, order_expire_at, flagged_for_review, review_note, created_at, paid_at";

const AUDIT_COLUMNS: &str = "id, admin_id, user_id, operation_type, amount, reason, created_at";

/// Column values written by a terminal transition. Everything else on the row is left alone.
struct TransitionColumns<'a> {
    status: FreezeStatus,
    actual_cost: Option<Decimal>,
    uncollected: Decimal,
    input_tokens: Option<i64>,
    output_tokens: Option<i64>,
    failure_reason: Option<&'a str>,
    settled_at: Option<DateTime<Utc>>,
    refunded_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
}

impl<'a> TransitionColumns<'a> {
    fn new(transition: &'a FreezeTransition, at: DateTime<Utc>) -> Self {
        let mut columns = Self {
            status: transition.target_status(),
            actual_cost: None,
            uncollected: Decimal::ZERO,
            input_tokens: None,
            output_tokens: None,
            failure_reason: None,
            settled_at: None,
            refunded_at: None,
            failed_at: None,
        };
        match transition {
            FreezeTransition::Settle {
                actual_cost,
                uncollected,
                input_tokens,
                output_tokens,
                failure_reason,
            } => {
                columns.failure_reason = failure_reason.as_deref();
                columns.actual_cost = Some(*actual_cost);
                columns.uncollected = *uncollected;
                columns.input_tokens = Some(*input_tokens);
                columns.output_tokens = Some(*output_tokens);
                columns.settled_at = Some(at);
            }
            FreezeTransition::Refund { reason } => {
                columns.failure_reason = Some(reason);
                columns.refunded_at = Some(at);
            }
            FreezeTransition::Fail { reason } => {
                columns.failure_reason = Some(reason);
                columns.failed_at = Some(at);
            }
        }
        columns
    }
}

/// PostgreSQL implementation of the storage traits.
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn apply_balance(conn: &mut PgConnection, write: &BalanceWrite, at: DateTime<Utc>) -> Result<Option<UserBalance>> {
        let query = format!(
            "UPDATE user_balances SET available = $1, frozen = $2, version = version + 1, updated_at = $3 \
             WHERE user_id = $4 AND version = $5 RETURNING {BALANCE_COLUMNS}"
        );
        let row = sqlx::query_as::<_, UserBalance>(&query)
            .bind(write.next.available)
            .bind(write.next.frozen)
            .bind(at)
            .bind(write.user_id)
            .bind(write.expected_version)
            .fetch_optional(conn)
            .await?;
        Ok(row)
    }

    async fn fetch_freeze(conn: &mut PgConnection, request_id: &RequestId) -> Result<Option<FreezeRecord>> {
        let query = format!("SELECT {FREEZE_COLUMNS} FROM freeze_records WHERE request_id = $1");
        let row = sqlx::query_as::<_, FreezeRecord>(&query)
            .bind(request_id)
            .fetch_optional(conn)
            .await?;
        Ok(row)
    }
}

impl BalanceStorage for PostgresStorage {
    async fn get_balance(&self, user_id: UserId) -> Result<Option<UserBalance>> {
        let query = format!("SELECT {BALANCE_COLUMNS} FROM user_balances WHERE user_id = $1");
        let row = sqlx::query_as::<_, UserBalance>(&query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn create_balance(&self, user_id: UserId) -> Result<UserBalance> {
        sqlx::query("INSERT INTO user_balances (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        self.get_balance(user_id).await?.ok_or(DbError::NotFound)
    }

    async fn swap_balance(&self, write: &BalanceWrite) -> Result<Option<UserBalance>> {
        let mut conn = self.pool.acquire().await?;
        Self::apply_balance(&mut *conn, write, Utc::now()).await
    }
}

impl FreezeStorage for PostgresStorage {
    async fn insert_freeze(&self, record: NewFreezeRecord, balance: Option<&BalanceWrite>) -> Result<InsertOutcome> {
        let now = Utc::now();
        let status = record.status();
        let failed_at = (status == FreezeStatus::Failed).then_some(now);
        let mut tx = self.pool.begin().await?;

        let query = format!(
            "INSERT INTO freeze_records (request_id, user_id, model_id, conversation_id, amount_frozen, estimated_cost, \
             status, failure_reason, frozen_at, failed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (request_id) DO NOTHING \
             RETURNING {FREEZE_COLUMNS}"
        );
        let inserted = sqlx::query_as::<_, FreezeRecord>(&query)
            .bind(&record.request_id)
            .bind(record.user_id)
            .bind(&record.model_id)
            .bind(&record.conversation_id)
            .bind(record.amount_frozen)
            .bind(record.estimated_cost)
            .bind(status)
            .bind(&record.failure_reason)
            .bind(now)
            .bind(failed_at)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(inserted) = inserted else {
            let existing = Self::fetch_freeze(&mut *tx, &record.request_id).await?.ok_or(DbError::NotFound)?;
            return Ok(InsertOutcome::Existing(existing));
        };

        if let Some(write) = balance {
            if Self::apply_balance(&mut *tx, write, now).await?.is_none() {
                return Ok(InsertOutcome::BalanceConflict);
            }
        }

        tx.commit().await?;
        Ok(InsertOutcome::Inserted(inserted))
    }

    async fn get_freeze(&self, request_id: &RequestId) -> Result<Option<FreezeRecord>> {
        let mut conn = self.pool.acquire().await?;
        Self::fetch_freeze(&mut *conn, request_id).await
    }

    async fn finalize_freeze(
        &self,
        request_id: &RequestId,
        transition: &FreezeTransition,
        balance: Option<&BalanceWrite>,
        at: DateTime<Utc>,
    ) -> Result<FinalizeOutcome> {
        let columns = TransitionColumns::new(transition, at);
        let mut tx = self.pool.begin().await?;

        // The status predicate is what makes the transition happen at most once
        let query = format!(
            "UPDATE freeze_records SET status = $2, actual_cost = $3, uncollected_amount = $4, input_tokens = $5, \
             output_tokens = $6, failure_reason = $7, settled_at = $8, refunded_at = $9, failed_at = $10 \
             WHERE request_id = $1 AND status = 'frozen' \
             RETURNING {FREEZE_COLUMNS}"
        );
        let updated = sqlx::query_as::<_, FreezeRecord>(&query)
            .bind(request_id)
            .bind(columns.status)
            .bind(columns.actual_cost)
            .bind(columns.uncollected)
            .bind(columns.input_tokens)
            .bind(columns.output_tokens)
            .bind(columns.failure_reason)
            .bind(columns.settled_at)
            .bind(columns.refunded_at)
            .bind(columns.failed_at)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(record) = updated else {
            let existing = Self::fetch_freeze(&mut *tx, request_id).await?;
            return Ok(match existing {
                Some(record) => FinalizeOutcome::AlreadyFinalized(record),
                None => FinalizeOutcome::NotFound,
            });
        };

        let balance = match balance {
            Some(write) => match Self::apply_balance(&mut *tx, write, at).await? {
                Some(balance) => Some(balance),
                // Dropping the transaction rolls back the record update
                None => return Ok(FinalizeOutcome::BalanceConflict),
            },
            None => None,
        };

        tx.commit().await?;
        Ok(FinalizeOutcome::Finalized { record, balance })
    }

    async fn list_frozen_before(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<FreezeRecord>> {
        let query = format!(
            "SELECT {FREEZE_COLUMNS} FROM freeze_records \
             WHERE status = 'frozen' AND frozen_at < $1 \
             ORDER BY frozen_at ASC \
             LIMIT $2"
        );
        let rows = sqlx::query_as::<_, FreezeRecord>(&query)
            .bind(cutoff)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }
}

impl OrderStorage for PostgresStorage {
    async fn insert_order(&self, order: NewRechargeOrder) -> Result<RechargeOrder> {
        let query = format!(
            "INSERT INTO recharge_orders (order_id, user_id, package_id, payment_amount, credit_amount, payment_status, order_expire_at) \
             VALUES ($1, $2, $3, $4, $5, 'pending', $6) \
             RETURNING {ORDER_COLUMNS}"
        );
        let row = sqlx::query_as::<_, RechargeOrder>(&query)
            .bind(&order.order_id)
            .bind(order.user_id)
            .bind(&order.package_id)
            .bind(order.payment_amount)
            .bind(order.credit_amount)
            .bind(order.order_expire_at)
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }

    async fn get_order(&self, order_id: &OrderId) -> Result<Option<RechargeOrder>> {
        let query = format!("SELECT {ORDER_COLUMNS} FROM recharge_orders WHERE order_id = $1");
        let row = sqlx::query_as::<_, RechargeOrder>(&query)
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn complete_order_payment(
        &self,
        order_id: &OrderId,
        transaction_id: &str,
        paid_at: DateTime<Utc>,
        balance: &BalanceWrite,
    ) -> Result<PaymentOutcome> {
        let mut tx = self.pool.begin().await?;

        let query = format!("SELECT {ORDER_COLUMNS} FROM recharge_orders WHERE order_id = $1 FOR UPDATE");
        let Some(order) = sqlx::query_as::<_, RechargeOrder>(&query)
            .bind(order_id)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(PaymentOutcome::NotFound);
        };

        match order.payment_status {
            PaymentStatus::Paid => return Ok(PaymentOutcome::AlreadyPaid(order)),
            PaymentStatus::Failed | PaymentStatus::Cancelled => return Ok(PaymentOutcome::NotPending(order)),
            PaymentStatus::Pending => {}
        }

        let query = format!(
            "UPDATE recharge_orders SET payment_status = 'paid', wechat_transaction_id = $2, paid_at = $3 \
             WHERE order_id = $1 RETURNING {ORDER_COLUMNS}"
        );
        let order = match sqlx::query_as::<_, RechargeOrder>(&query)
            .bind(order_id)
            .bind(transaction_id)
            .bind(paid_at)
            .fetch_one(&mut *tx)
            .await
        {
            Ok(order) => order,
            Err(e) => {
                let e = DbError::from(e);
                if e.is_unique_violation_on(PAID_TRANSACTION_CONSTRAINT) {
                    return Ok(PaymentOutcome::DuplicateTransaction);
                }
                return Err(e);
            }
        };

        let Some(balance) = Self::apply_balance(&mut *tx, balance, paid_at).await? else {
            return Ok(PaymentOutcome::BalanceConflict);
        };

        tx.commit().await?;
        Ok(PaymentOutcome::Completed { order, balance })
    }

    async fn flag_order_for_review(&self, order_id: &OrderId, note: &str) -> Result<()> {
        let result = sqlx::query("UPDATE recharge_orders SET flagged_for_review = TRUE, review_note = $2 WHERE order_id = $1")
            .bind(order_id)
            .bind(note)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    async fn cancel_expired_orders(&self, now: DateTime<Utc>) -> Result<Vec<OrderId>> {
        let mut cancelled = sqlx::query_scalar::<_, OrderId>(
            "UPDATE recharge_orders SET payment_status = 'cancelled' \
             WHERE payment_status = 'pending' AND NOT flagged_for_review AND order_expire_at < $1 \
             RETURNING order_id",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        cancelled.sort();
        Ok(cancelled)
    }
}

impl AuditStorage for PostgresStorage {
    async fn append_adjustment(&self, entry: NewAuditEntry, balance: &BalanceWrite) -> Result<Option<(AuditEntry, UserBalance)>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let Some(balance) = Self::apply_balance(&mut *tx, balance, now).await? else {
            return Ok(None);
        };

        let entry = entry.into_entry(now);
        let query = format!(
            "INSERT INTO admin_audit_log (id, admin_id, user_id, operation_type, amount, reason, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {AUDIT_COLUMNS}"
        );
        let entry = sqlx::query_as::<_, AuditEntry>(&query)
            .bind(entry.id)
            .bind(entry.admin_id)
            .bind(entry.user_id)
            .bind(entry.operation_type)
            .bind(entry.amount)
            .bind(&entry.reason)
            .bind(entry.created_at)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some((entry, balance)))
    }

    async fn list_audit_entries(&self, user_id: Option<UserId>, limit: i64) -> Result<Vec<AuditEntry>> {
        let query = format!(
            "SELECT {AUDIT_COLUMNS} FROM admin_audit_log \
             WHERE ($1::uuid IS NULL OR user_id = $1) \
             ORDER BY seq DESC \
             LIMIT $2"
        );
        let rows = sqlx::query_as::<_, AuditEntry>(&query)
            .bind(user_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }
}
