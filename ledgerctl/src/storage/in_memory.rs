//! In-memory storage implementation.
//!
//! All tables live behind a single mutex, so every trait operation is trivially atomic across the
//! rows it touches. Optimistic version checks still apply: a read followed by a conditional write
//! in a later call can lose to a concurrent writer exactly as it would against PostgreSQL.
//! Suitable for tests and single-process deployments. Data is lost on restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{AuditStorage, BalanceStorage, FreezeStorage, ORDER_ID_CONSTRAINT, OrderStorage};
use crate::db::errors::{DbError, Result};
use crate::db::models::{
    audit_log::{AuditEntry, NewAuditEntry},
    balances::{BalanceWrite, UserBalance},
    freeze_records::{FinalizeOutcome, FreezeRecord, FreezeStatus, FreezeTransition, InsertOutcome, NewFreezeRecord},
    recharge_orders::{NewRechargeOrder, PaymentOutcome, PaymentStatus, RechargeOrder},
};
use crate::types::{OrderId, RequestId, UserId};

#[derive(Default)]
struct Tables {
    balances: HashMap<UserId, UserBalance>,
    freezes: HashMap<RequestId, FreezeRecord>,
    orders: HashMap<OrderId, RechargeOrder>,
    audit: Vec<AuditEntry>,
}

impl Tables {
    /// Version-checked balance write. Does not touch any other table.
    fn apply_balance(&mut self, write: &BalanceWrite, at: DateTime<Utc>) -> Result<Option<UserBalance>> {
        let Some(row) = self.balances.get_mut(&write.user_id) else {
            return Err(DbError::NotFound);
        };
        if row.version != write.expected_version {
            return Ok(None);
        }
        if write.next.available.is_sign_negative() || write.next.frozen.is_sign_negative() {
            return Err(DbError::CheckViolation {
                constraint: Some("user_balances_non_negative".to_string()),
                table: Some("user_balances".to_string()),
                message: format!("balance for {} would go negative", write.user_id),
            });
        }
        row.available = write.next.available;
        row.frozen = write.next.frozen;
        row.version += 1;
        row.updated_at = at;
        Ok(Some(row.clone()))
    }

    /// Whether a conditional write on `write.user_id` would currently succeed
    fn balance_matches(&self, write: &BalanceWrite) -> Result<bool> {
        self.balances
            .get(&write.user_id)
            .map(|row| row.version == write.expected_version)
            .ok_or(DbError::NotFound)
    }
}

/// In-memory implementation of the storage traits.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    tables: Arc<Mutex<Tables>>,
    forced_conflicts: Arc<AtomicU32>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force the next `count` conditional balance writes to report a version conflict.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn inject_conflicts(&self, count: u32) {
        self.forced_conflicts.store(count, Ordering::SeqCst);
    }

    fn take_forced_conflict(&self) -> bool {
        self.forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl BalanceStorage for InMemoryStorage {
    async fn get_balance(&self, user_id: UserId) -> Result<Option<UserBalance>> {
        Ok(self.tables.lock().balances.get(&user_id).cloned())
    }

    async fn create_balance(&self, user_id: UserId) -> Result<UserBalance> {
        let mut tables = self.tables.lock();
        Ok(tables.balances.entry(user_id).or_insert_with(|| UserBalance::empty(user_id)).clone())
    }

    async fn swap_balance(&self, write: &BalanceWrite) -> Result<Option<UserBalance>> {
        if self.take_forced_conflict() {
            return Ok(None);
        }
        self.tables.lock().apply_balance(write, Utc::now())
    }
}

impl FreezeStorage for InMemoryStorage {
    async fn insert_freeze(&self, record: NewFreezeRecord, balance: Option<&BalanceWrite>) -> Result<InsertOutcome> {
        let mut tables = self.tables.lock();
        if let Some(existing) = tables.freezes.get(&record.request_id) {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }

        let now = Utc::now();
        if let Some(write) = balance {
            if self.take_forced_conflict() || !tables.balance_matches(write)? {
                return Ok(InsertOutcome::BalanceConflict);
            }
            tables.apply_balance(write, now)?;
        }

        let record = record.into_record(now);
        tables.freezes.insert(record.request_id.clone(), record.clone());
        Ok(InsertOutcome::Inserted(record))
    }

    async fn get_freeze(&self, request_id: &RequestId) -> Result<Option<FreezeRecord>> {
        Ok(self.tables.lock().freezes.get(request_id).cloned())
    }

    async fn finalize_freeze(
        &self,
        request_id: &RequestId,
        transition: &FreezeTransition,
        balance: Option<&BalanceWrite>,
        at: DateTime<Utc>,
    ) -> Result<FinalizeOutcome> {
        let mut tables = self.tables.lock();

        let Some(current) = tables.freezes.get(request_id) else {
            return Ok(FinalizeOutcome::NotFound);
        };
        if current.status != FreezeStatus::Frozen {
            return Ok(FinalizeOutcome::AlreadyFinalized(current.clone()));
        }

        let balance = match balance {
            Some(write) => {
                if self.take_forced_conflict() || !tables.balance_matches(write)? {
                    return Ok(FinalizeOutcome::BalanceConflict);
                }
                tables.apply_balance(write, at)?
            }
            None => None,
        };

        let record = tables.freezes.get_mut(request_id).ok_or(DbError::NotFound)?;
        transition.apply(record, at);
        Ok(FinalizeOutcome::Finalized {
            record: record.clone(),
            balance,
        })
    }

    async fn list_frozen_before(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<FreezeRecord>> {
        let tables = self.tables.lock();
        let mut stale: Vec<FreezeRecord> = tables
            .freezes
            .values()
            .filter(|r| r.status == FreezeStatus::Frozen && r.frozen_at < cutoff)
            .cloned()
            .collect();
        stale.sort_by_key(|r| r.frozen_at);
        stale.truncate(limit.max(0) as usize);
        Ok(stale)
    }
}

impl OrderStorage for InMemoryStorage {
    async fn insert_order(&self, order: NewRechargeOrder) -> Result<RechargeOrder> {
        let mut tables = self.tables.lock();
        if tables.orders.contains_key(&order.order_id) {
            return Err(DbError::UniqueViolation {
                constraint: Some(ORDER_ID_CONSTRAINT.to_string()),
                table: Some("recharge_orders".to_string()),
                message: "duplicate key value violates unique constraint".to_string(),
                conflicting_value: Some(order.order_id.to_string()),
            });
        }
        let order = order.into_order(Utc::now());
        tables.orders.insert(order.order_id.clone(), order.clone());
        Ok(order)
    }

    async fn get_order(&self, order_id: &OrderId) -> Result<Option<RechargeOrder>> {
        Ok(self.tables.lock().orders.get(order_id).cloned())
    }

    async fn complete_order_payment(
        &self,
        order_id: &OrderId,
        transaction_id: &str,
        paid_at: DateTime<Utc>,
        balance: &BalanceWrite,
    ) -> Result<PaymentOutcome> {
        let mut tables = self.tables.lock();

        let Some(order) = tables.orders.get(order_id) else {
            return Ok(PaymentOutcome::NotFound);
        };
        match order.payment_status {
            PaymentStatus::Paid => return Ok(PaymentOutcome::AlreadyPaid(order.clone())),
            PaymentStatus::Failed | PaymentStatus::Cancelled => return Ok(PaymentOutcome::NotPending(order.clone())),
            PaymentStatus::Pending => {}
        }

        let transaction_taken = tables.orders.values().any(|o| {
            o.payment_status == PaymentStatus::Paid
                && o.order_id != *order_id
                && o.wechat_transaction_id.as_deref() == Some(transaction_id)
        });
        if transaction_taken {
            return Ok(PaymentOutcome::DuplicateTransaction);
        }

        if self.take_forced_conflict() || !tables.balance_matches(balance)? {
            return Ok(PaymentOutcome::BalanceConflict);
        }
        let Some(balance) = tables.apply_balance(balance, paid_at)? else {
            return Ok(PaymentOutcome::BalanceConflict);
        };

        let order = tables.orders.get_mut(order_id).ok_or(DbError::NotFound)?;
        order.payment_status = PaymentStatus::Paid;
        order.wechat_transaction_id = Some(transaction_id.to_string());
        order.paid_at = Some(paid_at);
        Ok(PaymentOutcome::Completed {
            order: order.clone(),
            balance,
        })
    }

    async fn flag_order_for_review(&self, order_id: &OrderId, note: &str) -> Result<()> {
        let mut tables = self.tables.lock();
        let order = tables.orders.get_mut(order_id).ok_or(DbError::NotFound)?;
        order.flagged_for_review = true;
        order.review_note = Some(note.to_string());
        Ok(())
    }

    async fn cancel_expired_orders(&self, now: DateTime<Utc>) -> Result<Vec<OrderId>> {
        let mut tables = self.tables.lock();
        let mut cancelled = Vec::new();
        for order in tables.orders.values_mut() {
            if order.payment_status == PaymentStatus::Pending && !order.flagged_for_review && order.order_expire_at < now {
                order.payment_status = PaymentStatus::Cancelled;
                cancelled.push(order.order_id.clone());
            }
        }
        cancelled.sort();
        Ok(cancelled)
    }
}

impl AuditStorage for InMemoryStorage {
    async fn append_adjustment(&self, entry: NewAuditEntry, balance: &BalanceWrite) -> Result<Option<(AuditEntry, UserBalance)>> {
        if self.take_forced_conflict() {
            return Ok(None);
        }
        let mut tables = self.tables.lock();
        let now = Utc::now();
        let Some(balance) = tables.apply_balance(balance, now)? else {
            return Ok(None);
        };
        let entry = entry.into_entry(now);
        tables.audit.push(entry.clone());
        Ok(Some((entry, balance)))
    }

    async fn list_audit_entries(&self, user_id: Option<UserId>, limit: i64) -> Result<Vec<AuditEntry>> {
        let tables = self.tables.lock();
        Ok(tables
            .audit
            .iter()
            .rev()
            .filter(|e| user_id.is_none_or(|id| e.user_id == id))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}
