//! Storage models for recharge orders.

use crate::types::{OrderId, PackageId, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Payment status stored as TEXT in database
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct RechargeOrder {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub package_id: Option<PackageId>,
    /// What the gateway must report as paid
    pub payment_amount: Decimal,
    /// What is credited to `available` once paid
    pub credit_amount: Decimal,
    pub payment_status: PaymentStatus,
    pub wechat_transaction_id: Option<String>,
    pub order_expire_at: DateTime<Utc>,
    pub flagged_for_review: bool,
    pub review_note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl RechargeOrder {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.order_expire_at
    }
}

#[derive(Debug, Clone)]
pub struct NewRechargeOrder {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub package_id: Option<PackageId>,
    pub payment_amount: Decimal,
    pub credit_amount: Decimal,
    pub order_expire_at: DateTime<Utc>,
}

impl NewRechargeOrder {
    pub fn into_order(self, created_at: DateTime<Utc>) -> RechargeOrder {
        RechargeOrder {
            order_id: self.order_id,
            user_id: self.user_id,
            package_id: self.package_id,
            payment_amount: self.payment_amount,
            credit_amount: self.credit_amount,
            payment_status: PaymentStatus::Pending,
            wechat_transaction_id: None,
            order_expire_at: self.order_expire_at,
            flagged_for_review: false,
            review_note: None,
            created_at,
            paid_at: None,
        }
    }
}

/// Result of the joint `pending -> paid` + balance credit write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentOutcome {
    Completed {
        order: RechargeOrder,
        balance: super::balances::UserBalance,
    },
    AlreadyPaid(RechargeOrder),
    /// The order is `cancelled` or `failed`
    NotPending(RechargeOrder),
    /// The transaction id is already attached to another paid order
    DuplicateTransaction,
    BalanceConflict,
    NotFound,
}
