//! API request/response models for balances and manual adjustments.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::audit_log::AuditEntryResponse;
use crate::db::models::audit_log::AdjustmentKind;
use crate::db::models::balances::UserBalance;
use crate::types::{AdminId, UserId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub user_id: UserId,
    /// Spendable credits
    pub available: Decimal,
    /// Credits held by in-flight charges
    pub frozen: Decimal,
    pub total: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl From<UserBalance> for BalanceResponse {
    fn from(balance: UserBalance) -> Self {
        Self {
            total: balance.total(),
            user_id: balance.user_id,
            available: balance.available,
            frozen: balance.frozen,
            updated_at: balance.updated_at,
        }
    }
}

/// Operator grant or deduction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdjustmentCreate {
    /// Operator performing the adjustment, recorded in the audit log
    pub admin_id: AdminId,
    pub operation_type: AdjustmentKind,
    /// Positive amount to grant or deduct
    pub amount: Decimal,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjustmentResponse {
    pub entry: AuditEntryResponse,
    pub balance: BalanceResponse,
}
