//! Storage models for the freeze ledger.

use crate::types::{ModelId, RequestId, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Freeze record status stored as TEXT in database
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FreezeStatus {
    Frozen,
    Settled,
    Refunded,
    Failed,
}

impl FreezeStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, FreezeStatus::Frozen)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FreezeStatus::Frozen => "frozen",
            FreezeStatus::Settled => "settled",
            FreezeStatus::Refunded => "refunded",
            FreezeStatus::Failed => "failed",
        }
    }
}

/// Reason codes recorded on `failed` records.
pub mod failure_reasons {
    pub const INSUFFICIENT_BALANCE: &str = "insufficient_balance";
}

/// One row per billable attempt, keyed by the caller's idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct FreezeRecord {
    pub request_id: RequestId,
    pub user_id: UserId,
    pub model_id: ModelId,
    pub conversation_id: Option<String>,
    pub amount_frozen: Decimal,
    pub estimated_cost: Decimal,
    pub status: FreezeStatus,
    pub actual_cost: Option<Decimal>,
    /// Part of `actual_cost` that could not be collected from the user's balance
    pub uncollected_amount: Decimal,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub failure_reason: Option<String>,
    pub frozen_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

/// Insert request for a new record.
///
/// Records are inserted `frozen`, or directly `failed` when `failure_reason` is set (the freeze was
/// rejected and no funds were ever held).
#[derive(Debug, Clone)]
pub struct NewFreezeRecord {
    pub request_id: RequestId,
    pub user_id: UserId,
    pub model_id: ModelId,
    pub conversation_id: Option<String>,
    pub amount_frozen: Decimal,
    pub estimated_cost: Decimal,
    pub failure_reason: Option<String>,
}

impl NewFreezeRecord {
    pub fn status(&self) -> FreezeStatus {
        if self.failure_reason.is_some() {
            FreezeStatus::Failed
        } else {
            FreezeStatus::Frozen
        }
    }

    pub fn into_record(self, frozen_at: DateTime<Utc>) -> FreezeRecord {
        let status = self.status();
        FreezeRecord {
            request_id: self.request_id,
            user_id: self.user_id,
            model_id: self.model_id,
            conversation_id: self.conversation_id,
            amount_frozen: self.amount_frozen,
            estimated_cost: self.estimated_cost,
            status,
            actual_cost: None,
            uncollected_amount: Decimal::ZERO,
            input_tokens: None,
            output_tokens: None,
            failure_reason: self.failure_reason,
            frozen_at,
            settled_at: None,
            refunded_at: None,
            failed_at: (status == FreezeStatus::Failed).then_some(frozen_at),
        }
    }
}

/// The single terminal transition a record may take out of `frozen`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FreezeTransition {
    Settle {
        actual_cost: Decimal,
        uncollected: Decimal,
        input_tokens: i64,
        output_tokens: i64,
        /// Set when work failed after dispatch and only the dispatch fee is charged
        failure_reason: Option<String>,
    },
    Refund {
        reason: String,
    },
    Fail {
        reason: String,
    },
}

impl FreezeTransition {
    pub fn target_status(&self) -> FreezeStatus {
        match self {
            FreezeTransition::Settle { .. } => FreezeStatus::Settled,
            FreezeTransition::Refund { .. } => FreezeStatus::Refunded,
            FreezeTransition::Fail { .. } => FreezeStatus::Failed,
        }
    }

    /// Apply this transition to a record currently in `frozen`
    pub fn apply(&self, record: &mut FreezeRecord, at: DateTime<Utc>) {
        record.status = self.target_status();
        match self {
            FreezeTransition::Settle {
                actual_cost,
                uncollected,
                input_tokens,
                output_tokens,
                failure_reason,
            } => {
                record.failure_reason = failure_reason.clone();
                record.actual_cost = Some(*actual_cost);
                record.uncollected_amount = *uncollected;
                record.input_tokens = Some(*input_tokens);
                record.output_tokens = Some(*output_tokens);
                record.settled_at = Some(at);
            }
            FreezeTransition::Refund { reason } => {
                record.failure_reason = Some(reason.clone());
                record.refunded_at = Some(at);
            }
            FreezeTransition::Fail { reason } => {
                record.failure_reason = Some(reason.clone());
                record.failed_at = Some(at);
            }
        }
    }
}

/// Result of inserting a record whose key may already exist, optionally joined with a balance write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(FreezeRecord),
    /// A record with this `request_id` was already stored; nothing was written
    Existing(FreezeRecord),
    /// The joined balance write lost its version check; nothing was written
    BalanceConflict,
}

/// Result of a terminal transition, optionally joined with a balance write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Finalized {
        record: FreezeRecord,
        balance: Option<super::balances::UserBalance>,
    },
    /// Another writer already moved the record out of `frozen`
    AlreadyFinalized(FreezeRecord),
    /// The joined balance write lost its version check; nothing was written
    BalanceConflict,
    NotFound,
}
