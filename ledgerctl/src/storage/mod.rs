//! Storage traits for the ledger tables.
//!
//! Every operation here is atomic with respect to the rows it names. Operations that must move a
//! ledger, order or audit row together with a balance row take a [`BalanceWrite`] and commit both
//! or neither: if the balance row is no longer at `expected_version` nothing is written and the
//! outcome reports a conflict, which the caller retries through
//! [`crate::billing::balance::BalanceStore::update_with`].
//!
//! Two implementations exist: [`postgres::PostgresStorage`] for production and
//! [`in_memory::InMemoryStorage`] for tests and single-process development.

use std::future::Future;

use chrono::{DateTime, Utc};

use crate::db::errors::Result;
use crate::db::models::{
    audit_log::{AuditEntry, NewAuditEntry},
    balances::{BalanceWrite, UserBalance},
    freeze_records::{FinalizeOutcome, FreezeRecord, FreezeTransition, InsertOutcome, NewFreezeRecord},
    recharge_orders::{NewRechargeOrder, PaymentOutcome, RechargeOrder},
};
use crate::types::{OrderId, RequestId, UserId};

pub mod in_memory;
pub mod postgres;

#[cfg(test)]
mod tests;

/// Name of the primary key constraint on `recharge_orders`; violations mean an order id collision.
pub const ORDER_ID_CONSTRAINT: &str = "recharge_orders_pkey";

/// Per-user balance rows with optimistic versioning.
pub trait BalanceStorage: Send + Sync {
    fn get_balance(&self, user_id: UserId) -> impl Future<Output = Result<Option<UserBalance>>> + Send;

    /// Create a zero balance row. Returns the existing row if one is already present.
    fn create_balance(&self, user_id: UserId) -> impl Future<Output = Result<UserBalance>> + Send;

    /// Conditionally replace a balance. `None` means the version check failed.
    fn swap_balance(&self, write: &BalanceWrite) -> impl Future<Output = Result<Option<UserBalance>>> + Send;
}

/// The freeze ledger. `request_id` uniqueness is the de-duplication mechanism.
pub trait FreezeStorage: BalanceStorage {
    /// Insert a record together with an optional balance write, or return the record already
    /// stored under the same key (in which case nothing is written).
    fn insert_freeze(
        &self,
        record: NewFreezeRecord,
        balance: Option<&BalanceWrite>,
    ) -> impl Future<Output = Result<InsertOutcome>> + Send;

    fn get_freeze(&self, request_id: &RequestId) -> impl Future<Output = Result<Option<FreezeRecord>>> + Send;

    /// Move a record out of `frozen`, at most once, together with an optional balance write.
    fn finalize_freeze(
        &self,
        request_id: &RequestId,
        transition: &FreezeTransition,
        balance: Option<&BalanceWrite>,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<FinalizeOutcome>> + Send;

    /// Records still `frozen` since before `cutoff`, oldest first.
    fn list_frozen_before(&self, cutoff: DateTime<Utc>, limit: i64) -> impl Future<Output = Result<Vec<FreezeRecord>>> + Send;
}

/// Recharge orders.
pub trait OrderStorage: BalanceStorage {
    /// Insert a new `pending` order. An existing `order_id` yields
    /// [`crate::db::errors::DbError::UniqueViolation`] on [`ORDER_ID_CONSTRAINT`].
    fn insert_order(&self, order: NewRechargeOrder) -> impl Future<Output = Result<RechargeOrder>> + Send;

    fn get_order(&self, order_id: &OrderId) -> impl Future<Output = Result<Option<RechargeOrder>>> + Send;

    /// Transition `pending -> paid` and credit the balance in one atomic write.
    fn complete_order_payment(
        &self,
        order_id: &OrderId,
        transaction_id: &str,
        paid_at: DateTime<Utc>,
        balance: &BalanceWrite,
    ) -> impl Future<Output = Result<PaymentOutcome>> + Send;

    fn flag_order_for_review(&self, order_id: &OrderId, note: &str) -> impl Future<Output = Result<()>> + Send;

    /// Cancel every unflagged `pending` order whose expiry is before `now`. Returns the cancelled ids.
    fn cancel_expired_orders(&self, now: DateTime<Utc>) -> impl Future<Output = Result<Vec<OrderId>>> + Send;
}

/// Append-only log of operator balance adjustments.
pub trait AuditStorage: BalanceStorage {
    /// Append an entry together with the balance change it describes. `None` on version conflict.
    fn append_adjustment(
        &self,
        entry: NewAuditEntry,
        balance: &BalanceWrite,
    ) -> impl Future<Output = Result<Option<(AuditEntry, UserBalance)>>> + Send;

    /// Newest entries first, optionally for a single user.
    fn list_audit_entries(&self, user_id: Option<UserId>, limit: i64) -> impl Future<Output = Result<Vec<AuditEntry>>> + Send;
}

/// Everything the services need from one backend.
pub trait Storage: FreezeStorage + OrderStorage + AuditStorage + 'static {}

impl<T> Storage for T where T: FreezeStorage + OrderStorage + AuditStorage + 'static {}
