//! The freeze ledger: one record per billable attempt, keyed by `request_id`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::instrument;

use crate::db::errors::DbError;
use crate::db::models::balances::BalanceWrite;
use crate::db::models::freeze_records::{FinalizeOutcome, FreezeRecord, FreezeTransition, InsertOutcome, NewFreezeRecord};
use crate::storage::FreezeStorage;
use crate::types::RequestId;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("freeze record {0} not found")]
    NotFound(RequestId),

    /// The record already left `frozen`; carries the transition that won
    #[error("freeze record {} is already {}", .0.request_id, .0.status.as_str())]
    AlreadyFinalized(Box<FreezeRecord>),

    #[error(transparent)]
    Storage(#[from] DbError),
}

pub struct FreezeLedger<S> {
    storage: Arc<S>,
}

impl<S> Clone for FreezeLedger<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
        }
    }
}

impl<S: FreezeStorage> FreezeLedger<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    /// Create a record, or return the one already stored under this `request_id`.
    ///
    /// An [`InsertOutcome::Existing`] is how a duplicate request is detected; it is not an error.
    /// With a balance write the record and the hold on funds land together or not at all.
    #[instrument(skip(self, record, balance), fields(request_id = %record.request_id), err)]
    pub async fn create_frozen(
        &self,
        record: NewFreezeRecord,
        balance: Option<&BalanceWrite>,
    ) -> Result<InsertOutcome, LedgerError> {
        Ok(self.storage.insert_freeze(record, balance).await?)
    }

    pub async fn get(&self, request_id: &RequestId) -> Result<Option<FreezeRecord>, LedgerError> {
        Ok(self.storage.get_freeze(request_id).await?)
    }

    pub async fn mark_settled(
        &self,
        request_id: &RequestId,
        actual_cost: Decimal,
        input_tokens: i64,
        output_tokens: i64,
    ) -> Result<FreezeRecord, LedgerError> {
        let transition = FreezeTransition::Settle {
            actual_cost,
            uncollected: Decimal::ZERO,
            input_tokens,
            output_tokens,
            failure_reason: None,
        };
        self.transition(request_id, &transition).await
    }

    pub async fn mark_refunded(&self, request_id: &RequestId, reason: &str) -> Result<FreezeRecord, LedgerError> {
        let transition = FreezeTransition::Refund {
            reason: reason.to_string(),
        };
        self.transition(request_id, &transition).await
    }

    /// Terminal state for an attempt whose freeze was never applied
    pub async fn mark_failed(&self, request_id: &RequestId, reason: &str) -> Result<FreezeRecord, LedgerError> {
        let transition = FreezeTransition::Fail {
            reason: reason.to_string(),
        };
        self.transition(request_id, &transition).await
    }

    /// Record-only transition, with no balance change attached
    #[instrument(skip(self, transition), fields(status = transition.target_status().as_str()), err)]
    async fn transition(&self, request_id: &RequestId, transition: &FreezeTransition) -> Result<FreezeRecord, LedgerError> {
        match self.finalize(request_id, transition, None, Utc::now()).await? {
            FinalizeOutcome::Finalized { record, .. } => Ok(record),
            FinalizeOutcome::AlreadyFinalized(record) => Err(LedgerError::AlreadyFinalized(Box::new(record))),
            FinalizeOutcome::NotFound => Err(LedgerError::NotFound(request_id.clone())),
            FinalizeOutcome::BalanceConflict => Err(LedgerError::Storage(DbError::Other(anyhow::anyhow!(
                "balance conflict reported for a record-only transition on {request_id}"
            )))),
        }
    }

    /// Terminal transition joined with an optional balance write; the raw storage outcome.
    pub async fn finalize(
        &self,
        request_id: &RequestId,
        transition: &FreezeTransition,
        balance: Option<&BalanceWrite>,
        at: DateTime<Utc>,
    ) -> Result<FinalizeOutcome, LedgerError> {
        Ok(self.storage.finalize_freeze(request_id, transition, balance, at).await?)
    }

    /// Records still `frozen` since before `cutoff`, oldest first
    pub async fn list_stale(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<FreezeRecord>, LedgerError> {
        Ok(self.storage.list_frozen_before(cutoff, limit).await?)
    }
}
