//! Operator balance adjustments and the append-only audit log.
//!
//! Every manual grant or deduction is written together with its audit entry: either both land or
//! neither does.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{info, instrument};

use crate::billing::balance::{BalanceError, BalanceStore, Commit, plan_debit, plan_recharge};
use crate::billing::estimator::round_money;
use crate::db::errors::DbError;
use crate::db::models::audit_log::{AdjustmentKind, AuditEntry, NewAuditEntry};
use crate::db::models::balances::UserBalance;
use crate::storage::Storage;
use crate::types::{AdminId, UserId, abbrev_uuid};

/// Upper bound on entries returned by one feed read
pub const MAX_AUDIT_PAGE: i64 = 1000;

pub struct BalanceAdjustments<S> {
    storage: Arc<S>,
    balances: BalanceStore<S>,
}

impl<S> Clone for BalanceAdjustments<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            balances: self.balances.clone(),
        }
    }
}

impl<S: Storage> BalanceAdjustments<S> {
    pub fn new(storage: Arc<S>, balances: BalanceStore<S>) -> Self {
        Self { storage, balances }
    }

    /// Grant or deduct `amount` and record who did it. Deductions never take `available` below zero.
    #[instrument(skip(self, reason), fields(admin_id = %abbrev_uuid(&admin_id), user_id = %abbrev_uuid(&user_id)), err)]
    pub async fn adjust(
        &self,
        admin_id: AdminId,
        user_id: UserId,
        kind: AdjustmentKind,
        amount: Decimal,
        reason: Option<String>,
    ) -> Result<(AuditEntry, UserBalance), BalanceError> {
        let amount = round_money(amount);
        let storage = &*self.storage;
        let reason = reason.as_deref();

        let (entry, balance) = self
            .balances
            .update_with(
                user_id,
                "adjust",
                |current| {
                    let next = match kind {
                        AdjustmentKind::Grant => plan_recharge(current.amounts(), amount)?,
                        AdjustmentKind::Deduct => plan_debit(current.amounts(), amount)?,
                    };
                    Ok::<_, BalanceError>((next, ()))
                },
                move |write, ()| async move {
                    let entry = NewAuditEntry {
                        admin_id,
                        user_id,
                        operation_type: kind,
                        amount,
                        reason: reason.map(str::to_string),
                    };
                    Ok(match storage.append_adjustment(entry, &write).await? {
                        Some(applied) => Commit::Applied(applied),
                        None => Commit::Conflict,
                    })
                },
            )
            .await?;

        info!(
            operation = ?kind,
            %amount,
            available = %balance.available,
            "Manual balance adjustment applied"
        );
        Ok((entry, balance))
    }
}

/// Read side of the audit log.
pub struct AdminAuditLog<S> {
    storage: Arc<S>,
}

impl<S> Clone for AdminAuditLog<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
        }
    }
}

impl<S: Storage> AdminAuditLog<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    /// Newest first, optionally for one user. `limit` is clamped to `1..=MAX_AUDIT_PAGE`.
    pub async fn entries(&self, user_id: Option<UserId>, limit: i64) -> Result<Vec<AuditEntry>, DbError> {
        self.storage
            .list_audit_entries(user_id, limit.clamp(1, MAX_AUDIT_PAGE))
            .await
    }
}
