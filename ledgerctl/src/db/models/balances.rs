//! Storage models for user balances.

use crate::types::UserId;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A user's prepaid compute balance.
///
/// `available` and `frozen` are never negative. `version` increases by one on every write and is
/// the optimistic lock every mutation conditions on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct UserBalance {
    pub user_id: UserId,
    pub available: Decimal,
    pub frozen: Decimal,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl UserBalance {
    /// Zero balance row, as created at registration
    pub fn empty(user_id: UserId) -> Self {
        Self {
            user_id,
            available: Decimal::ZERO,
            frozen: Decimal::ZERO,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn amounts(&self) -> BalanceAmounts {
        BalanceAmounts {
            available: self.available,
            frozen: self.frozen,
        }
    }

    /// `available + frozen`
    pub fn total(&self) -> Decimal {
        self.available + self.frozen
    }
}

/// The two balance columns a conditional write replaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceAmounts {
    pub available: Decimal,
    pub frozen: Decimal,
}

/// A conditional balance write: applies `next` only if the row is still at `expected_version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceWrite {
    pub user_id: UserId,
    pub expected_version: i64,
    pub next: BalanceAmounts,
}

impl BalanceWrite {
    pub fn on(current: &UserBalance, next: BalanceAmounts) -> Self {
        Self {
            user_id: current.user_id,
            expected_version: current.version,
            next,
        }
    }
}
