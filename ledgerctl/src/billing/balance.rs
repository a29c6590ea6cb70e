//! Balance arithmetic and the optimistic read-modify-write loop.
//!
//! Every balance mutation is split in two: a pure planner that turns the current
//! `(available, frozen)` pair into the next one (or a business error), and
//! [`BalanceStore::update_with`], which reads the row, runs the planner, and commits conditioned on
//! the version it read. A lost race re-reads and re-plans, up to the configured retry budget.
//!
//! Invariants upheld by the planners:
//! - neither column ever goes negative
//! - a freeze moves value between the columns without changing `available + frozen`
//! - only settlement and debit reduce the total, only recharge and refund increase it

use std::future::Future;
use std::sync::Arc;

use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use super::retry::RetryPolicy;
use crate::db::errors::DbError;
use crate::db::models::balances::{BalanceAmounts, BalanceWrite, UserBalance};
use crate::metrics;
use crate::storage::BalanceStorage;
use crate::types::UserId;

#[derive(Debug, Error)]
pub enum BalanceError {
    #[error("insufficient balance: required {required}, available {available}")]
    InsufficientFunds { required: Decimal, available: Decimal },

    #[error("no balance account for user {0}")]
    UnknownAccount(UserId),

    #[error("balance update for user {user_id} conflicted {attempts} times")]
    Contention { user_id: UserId, attempts: u32 },

    #[error("amount must be positive, got {0}")]
    InvalidAmount(Decimal),

    #[error("cannot release {amount} from a frozen balance of {frozen}")]
    FrozenUnderflow { frozen: Decimal, amount: Decimal },

    #[error(transparent)]
    Storage(#[from] DbError),
}

/// How a settlement was split between collection and write-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settlement {
    /// Amount actually taken from the user (frozen portion plus any shortfall collected)
    pub charged: Decimal,
    /// Overage that could not be collected from `available`
    pub uncollected: Decimal,
}

fn require_positive(amount: Decimal) -> Result<(), BalanceError> {
    if amount <= Decimal::ZERO {
        return Err(BalanceError::InvalidAmount(amount));
    }
    Ok(())
}

fn release_frozen(current: BalanceAmounts, amount: Decimal) -> Result<Decimal, BalanceError> {
    if amount.is_sign_negative() {
        return Err(BalanceError::InvalidAmount(amount));
    }
    if amount > current.frozen {
        return Err(BalanceError::FrozenUnderflow {
            frozen: current.frozen,
            amount,
        });
    }
    Ok(current.frozen - amount)
}

/// Move `amount` from `available` to `frozen`.
pub fn plan_freeze(current: BalanceAmounts, amount: Decimal) -> Result<BalanceAmounts, BalanceError> {
    if amount.is_sign_negative() {
        return Err(BalanceError::InvalidAmount(amount));
    }
    if current.available < amount {
        return Err(BalanceError::InsufficientFunds {
            required: amount,
            available: current.available,
        });
    }
    Ok(BalanceAmounts {
        available: current.available - amount,
        frozen: current.frozen + amount,
    })
}

/// Release `frozen_amount` and charge `actual` against it.
///
/// Any difference below the frozen amount goes back to `available`. A shortfall above it is taken
/// from `available` as far as it goes; the remainder is reported as uncollected rather than driving
/// the balance negative.
pub fn plan_settle(
    current: BalanceAmounts,
    frozen_amount: Decimal,
    actual: Decimal,
) -> Result<(BalanceAmounts, Settlement), BalanceError> {
    if actual.is_sign_negative() {
        return Err(BalanceError::InvalidAmount(actual));
    }
    let frozen = release_frozen(current, frozen_amount)?;

    if actual <= frozen_amount {
        let next = BalanceAmounts {
            available: current.available + (frozen_amount - actual),
            frozen,
        };
        return Ok((
            next,
            Settlement {
                charged: actual,
                uncollected: Decimal::ZERO,
            },
        ));
    }

    let shortfall = actual - frozen_amount;
    let collected = shortfall.min(current.available);
    let next = BalanceAmounts {
        available: current.available - collected,
        frozen,
    };
    Ok((
        next,
        Settlement {
            charged: frozen_amount + collected,
            uncollected: shortfall - collected,
        },
    ))
}

/// Full reversal of a freeze.
pub fn plan_refund(current: BalanceAmounts, frozen_amount: Decimal) -> Result<BalanceAmounts, BalanceError> {
    let frozen = release_frozen(current, frozen_amount)?;
    Ok(BalanceAmounts {
        available: current.available + frozen_amount,
        frozen,
    })
}

pub fn plan_recharge(current: BalanceAmounts, amount: Decimal) -> Result<BalanceAmounts, BalanceError> {
    require_positive(amount)?;
    Ok(BalanceAmounts {
        available: current.available + amount,
        frozen: current.frozen,
    })
}

/// Remove `amount` from `available`. Refuses rather than going below zero.
pub fn plan_debit(current: BalanceAmounts, amount: Decimal) -> Result<BalanceAmounts, BalanceError> {
    require_positive(amount)?;
    if current.available < amount {
        return Err(BalanceError::InsufficientFunds {
            required: amount,
            available: current.available,
        });
    }
    Ok(BalanceAmounts {
        available: current.available - amount,
        frozen: current.frozen,
    })
}

/// Result of one conditional commit attempt inside [`BalanceStore::update_with`].
#[derive(Debug)]
pub enum Commit<R> {
    Applied(R),
    /// The balance version moved; re-read and re-plan
    Conflict,
}

/// Per-user balances with bounded optimistic retry.
pub struct BalanceStore<S> {
    storage: Arc<S>,
    retry: RetryPolicy,
}

impl<S> Clone for BalanceStore<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            retry: self.retry.clone(),
        }
    }
}

impl<S: BalanceStorage> BalanceStore<S> {
    pub fn new(storage: Arc<S>, retry: RetryPolicy) -> Self {
        Self { storage, retry }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub async fn get(&self, user_id: UserId) -> Result<UserBalance, BalanceError> {
        self.storage
            .get_balance(user_id)
            .await?
            .ok_or(BalanceError::UnknownAccount(user_id))
    }

    /// Create the zero balance row for a newly registered user. Idempotent.
    #[instrument(skip(self), err)]
    pub async fn ensure_account(&self, user_id: UserId) -> Result<UserBalance, BalanceError> {
        Ok(self.storage.create_balance(user_id).await?)
    }

    /// Read-modify-write loop shared by every balance mutation.
    ///
    /// `plan` computes the next amounts plus an arbitrary output from the row just read. `commit`
    /// receives the conditional write and that output, and reports whether the write applied.
    /// Business errors from `plan` are returned immediately; only [`Commit::Conflict`] is retried.
    pub async fn update_with<T, R, E, P, C, Fut>(
        &self,
        user_id: UserId,
        operation: &'static str,
        mut plan: P,
        mut commit: C,
    ) -> Result<R, E>
    where
        P: FnMut(&UserBalance) -> Result<(BalanceAmounts, T), E>,
        C: FnMut(BalanceWrite, T) -> Fut,
        Fut: Future<Output = Result<Commit<R>, E>>,
        E: From<BalanceError>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self.get(user_id).await?;
            let (next, output) = plan(&current)?;

            match commit(BalanceWrite::on(&current, next), output).await? {
                Commit::Applied(result) => return Ok(result),
                Commit::Conflict => {
                    metrics::record_balance_conflict(operation);
                    if attempt >= self.retry.max_attempts {
                        metrics::record_contention_exhausted(operation);
                        warn!(%user_id, operation, attempts = attempt, "Balance update gave up after repeated conflicts");
                        return Err(BalanceError::Contention { user_id, attempts: attempt }.into());
                    }
                    let delay = self.retry.backoff(attempt);
                    debug!(%user_id, operation, attempt, ?delay, "Balance version conflict, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// `update_with` for mutations that touch only the balance row
    async fn swap<T, P>(&self, user_id: UserId, operation: &'static str, plan: P) -> Result<(UserBalance, T), BalanceError>
    where
        P: FnMut(&UserBalance) -> Result<(BalanceAmounts, T), BalanceError>,
    {
        let storage = &*self.storage;
        self.update_with(user_id, operation, plan, move |write, output| async move {
            Ok(match storage.swap_balance(&write).await? {
                Some(balance) => Commit::Applied((balance, output)),
                None => Commit::Conflict,
            })
        })
        .await
    }

    #[instrument(skip(self), err)]
    pub async fn try_freeze(&self, user_id: UserId, amount: Decimal) -> Result<UserBalance, BalanceError> {
        let (balance, ()) = self
            .swap(user_id, "freeze", |current| Ok((plan_freeze(current.amounts(), amount)?, ())))
            .await?;
        Ok(balance)
    }

    #[instrument(skip(self), err)]
    pub async fn settle(
        &self,
        user_id: UserId,
        frozen_amount: Decimal,
        actual: Decimal,
    ) -> Result<(UserBalance, Settlement), BalanceError> {
        self.swap(user_id, "settle", |current| plan_settle(current.amounts(), frozen_amount, actual))
            .await
    }

    #[instrument(skip(self), err)]
    pub async fn refund(&self, user_id: UserId, frozen_amount: Decimal) -> Result<UserBalance, BalanceError> {
        let (balance, ()) = self
            .swap(user_id, "refund", |current| Ok((plan_refund(current.amounts(), frozen_amount)?, ())))
            .await?;
        Ok(balance)
    }

    #[instrument(skip(self), err)]
    pub async fn recharge(&self, user_id: UserId, amount: Decimal) -> Result<UserBalance, BalanceError> {
        let (balance, ()) = self
            .swap(user_id, "recharge", |current| Ok((plan_recharge(current.amounts(), amount)?, ())))
            .await?;
        Ok(balance)
    }

    #[instrument(skip(self), err)]
    pub async fn debit(&self, user_id: UserId, amount: Decimal) -> Result<UserBalance, BalanceError> {
        let (balance, ()) = self
            .swap(user_id, "debit", |current| Ok((plan_debit(current.amounts(), amount)?, ())))
            .await?;
        Ok(balance)
    }
}
