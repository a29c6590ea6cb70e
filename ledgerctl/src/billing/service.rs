//! Usage billing: estimate, freeze, run the billed work, then settle or refund.
//!
//! ```text
//! Requested --freeze--> Frozen --work ok--------------------> Settled  (actual cost)
//!     |                    |----work failed, dispatched-----> Settled  (dispatch fee)
//!     |                    '----work failed, not dispatched--> Refunded
//!     '--insufficient balance--> Failed
//! ```
//!
//! Freezing inserts the ledger record and holds the funds in one atomic write, so a record is
//! never `frozen` without its hold. Settlement and refund likewise move the record and the balance
//! together. Neither holds any lock across the caller's work.
//!
//! A retried `request_id` never runs work twice: terminal records replay their outcome and a
//! record still `frozen` reports [`BillingError::RequestInFlight`].
//!
//! Requests whose work is running in this process are tracked so the reconciliation sweep leaves
//! them to the charge that owns them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bon::Builder;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use scopeguard::ScopeGuard;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

use super::balance::{BalanceError, BalanceStore, Commit, Settlement, plan_freeze, plan_refund, plan_settle};
use super::estimator::{PricingCatalog, PricingModel, estimate_cost, final_cost};
use super::ledger::{FreezeLedger, LedgerError};
use crate::db::errors::DbError;
use crate::db::models::freeze_records::{
    FinalizeOutcome, FreezeRecord, FreezeStatus, FreezeTransition, InsertOutcome, NewFreezeRecord, failure_reasons,
};
use crate::metrics;
use crate::storage::Storage;
use crate::types::{ModelId, RequestId, UserId, abbrev_uuid};

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("unknown model {0}")]
    UnknownModel(ModelId),

    #[error("insufficient balance: {required} required")]
    InsufficientBalance { required: Decimal },

    #[error("no balance account for user {0}")]
    UnknownAccount(UserId),

    /// Optimistic retries exhausted before anything was written
    #[error("balance is busy, please try again")]
    Contention,

    #[error("request {0} is already being processed")]
    RequestInFlight(RequestId),

    #[error("request id {0} was already used for a different charge")]
    RequestIdConflict(RequestId),

    /// Work finished but the settlement could not be written; reconciliation will resolve it
    #[error("settlement of request {0} deferred to reconciliation")]
    SettlementDeferred(RequestId),

    #[error("request {request_id} was rejected: {reason}")]
    Rejected { request_id: RequestId, reason: String },

    #[error("ledger inconsistency: {0}")]
    Inconsistent(String),

    #[error(transparent)]
    Storage(#[from] DbError),
}

impl From<BalanceError> for BillingError {
    fn from(err: BalanceError) -> Self {
        match err {
            BalanceError::InsufficientFunds { required, .. } => BillingError::InsufficientBalance { required },
            BalanceError::UnknownAccount(user_id) => BillingError::UnknownAccount(user_id),
            BalanceError::Contention { .. } => BillingError::Contention,
            BalanceError::Storage(e) => BillingError::Storage(e),
            other @ (BalanceError::InvalidAmount(_) | BalanceError::FrozenUnderflow { .. }) => {
                BillingError::Inconsistent(other.to_string())
            }
        }
    }
}

impl From<LedgerError> for BillingError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Storage(e) => BillingError::Storage(e),
            other => BillingError::Inconsistent(other.to_string()),
        }
    }
}

/// Token counts reported by successful work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Why billed work did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkFailure {
    pub reason: String,
}

impl WorkFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

impl std::fmt::Display for WorkFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason)
    }
}

/// Handed to billed work. Call [`DispatchMarker::mark_dispatched`] once the content has passed
/// screening: from then on any failure is charged the dispatch fee instead of refunded.
#[derive(Debug, Clone, Default)]
pub struct DispatchMarker {
    dispatched: Arc<AtomicBool>,
}

impl DispatchMarker {
    pub fn mark_dispatched(&self) {
        self.dispatched.store(true, Ordering::SeqCst);
    }

    pub fn is_dispatched(&self) -> bool {
        self.dispatched.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Builder)]
pub struct ChargeRequest {
    /// Client-generated, stable across retries of the same logical request
    #[builder(into)]
    pub request_id: RequestId,
    pub user_id: UserId,
    #[builder(into)]
    pub model_id: ModelId,
    #[builder(into)]
    pub conversation_id: Option<String>,
    /// Output budget used to size the freeze; capped at the model's per-request limit
    pub assumed_max_tokens: u32,
}

/// Outcome of a charge, replayed verbatim for retries of the same `request_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChargeReceipt {
    pub request_id: RequestId,
    pub status: FreezeStatus,
    pub estimated_cost: Decimal,
    pub actual_cost: Option<Decimal>,
    pub uncollected: Decimal,
    pub failure_reason: Option<String>,
    /// Served from an earlier attempt without running work
    pub replayed: bool,
}

impl ChargeReceipt {
    pub fn from_record(record: &FreezeRecord, replayed: bool) -> Self {
        Self {
            request_id: record.request_id.clone(),
            status: record.status,
            estimated_cost: record.estimated_cost,
            actual_cost: record.actual_cost,
            uncollected: record.uncollected_amount,
            failure_reason: record.failure_reason.clone(),
            replayed,
        }
    }

    /// What was actually taken from the user's balance
    pub fn charged(&self) -> Decimal {
        self.actual_cost.unwrap_or(Decimal::ZERO) - self.uncollected
    }
}

enum FreezeStep {
    Frozen(FreezeRecord),
    Existing(FreezeRecord),
}

enum Finalized {
    /// This call performed the transition
    Now(FreezeRecord),
    /// Another writer got there first
    Earlier(FreezeRecord),
}

fn commit_finalize(outcome: FinalizeOutcome, request_id: &RequestId) -> Result<Commit<Finalized>, BillingError> {
    match outcome {
        FinalizeOutcome::Finalized { record, .. } => Ok(Commit::Applied(Finalized::Now(record))),
        FinalizeOutcome::AlreadyFinalized(record) => Ok(Commit::Applied(Finalized::Earlier(record))),
        FinalizeOutcome::BalanceConflict => Ok(Commit::Conflict),
        FinalizeOutcome::NotFound => Err(BillingError::Inconsistent(format!("freeze record {request_id} disappeared"))),
    }
}

fn token_count(tokens: u64) -> i64 {
    i64::try_from(tokens).unwrap_or(i64::MAX)
}

/// Charges in this process per request id, from before the freeze until finalization.
#[derive(Debug, Clone, Default)]
struct InFlightRequests(Arc<Mutex<HashMap<RequestId, usize>>>);

impl InFlightRequests {
    fn enter(&self, request_id: &RequestId) -> InFlightEntry {
        *self.0.lock().entry(request_id.clone()).or_default() += 1;
        InFlightEntry {
            requests: self.clone(),
            request_id: request_id.clone(),
        }
    }

    fn contains(&self, request_id: &RequestId) -> bool {
        self.0.lock().contains_key(request_id)
    }
}

/// Releases its request id from the in-flight set when dropped.
#[derive(Debug)]
struct InFlightEntry {
    requests: InFlightRequests,
    request_id: RequestId,
}

impl Drop for InFlightEntry {
    fn drop(&mut self) {
        let mut requests = self.requests.0.lock();
        if let Some(count) = requests.get_mut(&self.request_id) {
            *count -= 1;
            if *count == 0 {
                requests.remove(&self.request_id);
            }
        }
    }
}

pub struct UsageBillingService<S> {
    balances: BalanceStore<S>,
    ledger: FreezeLedger<S>,
    pricing: Arc<PricingCatalog>,
    work_timeout: Option<Duration>,
    in_flight: InFlightRequests,
}

impl<S> Clone for UsageBillingService<S> {
    fn clone(&self) -> Self {
        Self {
            balances: self.balances.clone(),
            ledger: self.ledger.clone(),
            pricing: Arc::clone(&self.pricing),
            work_timeout: self.work_timeout,
            in_flight: self.in_flight.clone(),
        }
    }
}

impl<S: Storage> UsageBillingService<S> {
    pub fn new(balances: BalanceStore<S>, ledger: FreezeLedger<S>, pricing: Arc<PricingCatalog>) -> Self {
        Self {
            balances,
            ledger,
            pricing,
            work_timeout: None,
            in_flight: InFlightRequests::default(),
        }
    }

    /// Treat work still running after `timeout` as failed
    pub fn with_work_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.work_timeout = timeout;
        self
    }

    pub fn ledger(&self) -> &FreezeLedger<S> {
        &self.ledger
    }

    pub fn pricing(&self) -> &PricingCatalog {
        &self.pricing
    }

    /// Whether a charge in this process still owns the frozen record for `request_id`
    pub fn is_in_flight(&self, request_id: &RequestId) -> bool {
        self.in_flight.contains(request_id)
    }

    /// Charge for one unit of work. See [`Self::charge_with_cancel`].
    pub async fn charge<F, Fut>(&self, request: ChargeRequest, work: F) -> Result<ChargeReceipt, BillingError>
    where
        F: FnOnce(DispatchMarker) -> Fut,
        Fut: Future<Output = Result<TokenUsage, WorkFailure>>,
    {
        self.charge_with_cancel(request, CancellationToken::new(), work).await
    }

    /// Estimate, freeze, run `work`, then settle or refund.
    ///
    /// Cancelling `cancel`, hitting the work timeout, or dropping the returned future while work is
    /// running all count as work failure; the record is still driven to a terminal state.
    #[instrument(skip_all, fields(
        request_id = %request.request_id,
        user_id = %abbrev_uuid(&request.user_id),
        model = %request.model_id,
    ))]
    pub async fn charge_with_cancel<F, Fut>(
        &self,
        request: ChargeRequest,
        cancel: CancellationToken,
        work: F,
    ) -> Result<ChargeReceipt, BillingError>
    where
        F: FnOnce(DispatchMarker) -> Fut,
        Fut: Future<Output = Result<TokenUsage, WorkFailure>>,
    {
        let pricing = self
            .pricing
            .get(&request.model_id)
            .cloned()
            .ok_or_else(|| BillingError::UnknownModel(request.model_id.clone()))?;
        let tokens = pricing.cap_tokens(request.assumed_max_tokens);
        let estimate = estimate_cost(&pricing, tokens);
        let dispatch_fee = final_cost(&pricing, 0, 0);

        let in_flight = self.in_flight.enter(&request.request_id);
        let record = match self.freeze(&request, estimate).await {
            Ok(FreezeStep::Frozen(record)) => record,
            Ok(FreezeStep::Existing(existing)) => return self.replay(&request, existing),
            Err(BillingError::InsufficientBalance { required }) => return self.reject(&request, required).await,
            Err(e) => {
                metrics::record_freeze("error");
                return Err(e);
            }
        };
        metrics::record_freeze("frozen");
        debug!(%estimate, tokens, "Funds frozen");

        let marker = DispatchMarker::default();
        let guard = scopeguard::guard(
            PendingFinalization {
                service: self.clone(),
                record: record.clone(),
                dispatch_fee,
                marker: marker.clone(),
                _in_flight: in_flight,
            },
            PendingFinalization::spawn,
        );

        let started = Instant::now();
        let outcome = self.run_work(work(marker.clone()), &cancel).await;
        metrics::record_work_duration(started.elapsed().as_secs_f64());
        // Held until finalization below completes
        let _pending = ScopeGuard::into_inner(guard);

        match outcome {
            Ok(usage) => {
                let actual = final_cost(&pricing, usage.input_tokens, usage.output_tokens);
                self.settle_frozen(&record, actual, usage, None).await
            }
            Err(failure) => {
                info!(reason = %failure, dispatched = marker.is_dispatched(), "Billed work failed");
                self.resolve_failure(&record, dispatch_fee, marker.is_dispatched(), &failure.reason)
                    .await
            }
        }
    }

    /// Insert the record and hold the estimate in one conditional write
    async fn freeze(&self, request: &ChargeRequest, estimate: Decimal) -> Result<FreezeStep, BillingError> {
        if let Some(existing) = self.ledger.get(&request.request_id).await? {
            return Ok(FreezeStep::Existing(existing));
        }

        let ledger = &self.ledger;
        let new_record = || NewFreezeRecord {
            request_id: request.request_id.clone(),
            user_id: request.user_id,
            model_id: request.model_id.clone(),
            conversation_id: request.conversation_id.clone(),
            amount_frozen: estimate,
            estimated_cost: estimate,
            failure_reason: None,
        };

        self.balances
            .update_with(
                request.user_id,
                "freeze",
                |current| Ok::<_, BillingError>((plan_freeze(current.amounts(), estimate)?, ())),
                move |write, ()| {
                    let record = new_record();
                    async move {
                        Ok(match ledger.create_frozen(record, Some(&write)).await? {
                            InsertOutcome::Inserted(record) => Commit::Applied(FreezeStep::Frozen(record)),
                            InsertOutcome::Existing(record) => Commit::Applied(FreezeStep::Existing(record)),
                            InsertOutcome::BalanceConflict => Commit::Conflict,
                        })
                    }
                },
            )
            .await
    }

    /// Persist a `failed` record for a freeze the balance could not cover
    async fn reject(&self, request: &ChargeRequest, required: Decimal) -> Result<ChargeReceipt, BillingError> {
        let record = NewFreezeRecord {
            request_id: request.request_id.clone(),
            user_id: request.user_id,
            model_id: request.model_id.clone(),
            conversation_id: request.conversation_id.clone(),
            amount_frozen: Decimal::ZERO,
            estimated_cost: required,
            failure_reason: Some(failure_reasons::INSUFFICIENT_BALANCE.to_string()),
        };
        match self.ledger.create_frozen(record, None).await? {
            InsertOutcome::Existing(existing) => self.replay(request, existing),
            InsertOutcome::Inserted(_) | InsertOutcome::BalanceConflict => {
                metrics::record_freeze(failure_reasons::INSUFFICIENT_BALANCE);
                info!(%required, "Charge rejected for insufficient balance");
                Err(BillingError::InsufficientBalance { required })
            }
        }
    }

    /// Answer a retried `request_id` from the stored record
    fn replay(&self, request: &ChargeRequest, existing: FreezeRecord) -> Result<ChargeReceipt, BillingError> {
        if existing.user_id != request.user_id || existing.model_id != request.model_id {
            warn!("Request id reused for a different user or model");
            return Err(BillingError::RequestIdConflict(existing.request_id));
        }

        match existing.status {
            FreezeStatus::Frozen => {
                metrics::record_freeze("in_flight");
                Err(BillingError::RequestInFlight(existing.request_id))
            }
            FreezeStatus::Failed => {
                metrics::record_freeze("replayed");
                match existing.failure_reason.as_deref() {
                    Some(failure_reasons::INSUFFICIENT_BALANCE) => Err(BillingError::InsufficientBalance {
                        required: existing.estimated_cost,
                    }),
                    reason => Err(BillingError::Rejected {
                        request_id: existing.request_id.clone(),
                        reason: reason.unwrap_or("unknown").to_string(),
                    }),
                }
            }
            FreezeStatus::Settled | FreezeStatus::Refunded => {
                metrics::record_freeze("replayed");
                debug!(status = existing.status.as_str(), "Replaying finished charge");
                Ok(ChargeReceipt::from_record(&existing, true))
            }
        }
    }

    async fn run_work<Fut>(&self, work: Fut, cancel: &CancellationToken) -> Result<TokenUsage, WorkFailure>
    where
        Fut: Future<Output = Result<TokenUsage, WorkFailure>>,
    {
        let bounded = async {
            match self.work_timeout {
                Some(limit) => tokio::time::timeout(limit, work)
                    .await
                    .unwrap_or_else(|_| Err(WorkFailure::new(format!("work timed out after {limit:?}")))),
                None => work.await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(WorkFailure::new("cancelled")),
            result = bounded => result,
        }
    }

    /// Settle a frozen record at `actual`, moving the balance and the record together.
    pub(crate) async fn settle_frozen(
        &self,
        record: &FreezeRecord,
        actual: Decimal,
        usage: TokenUsage,
        failure_reason: Option<&str>,
    ) -> Result<ChargeReceipt, BillingError> {
        let ledger = &self.ledger;
        let request_id = &record.request_id;
        let amount_frozen = record.amount_frozen;
        let at = Utc::now();

        let result = self
            .balances
            .update_with(
                record.user_id,
                "settle",
                |current| Ok::<_, BillingError>(plan_settle(current.amounts(), amount_frozen, actual)?),
                move |write, settlement: Settlement| async move {
                    let transition = FreezeTransition::Settle {
                        actual_cost: actual,
                        uncollected: settlement.uncollected,
                        input_tokens: token_count(usage.input_tokens),
                        output_tokens: token_count(usage.output_tokens),
                        failure_reason: failure_reason.map(str::to_string),
                    };
                    commit_finalize(ledger.finalize(request_id, &transition, Some(&write), at).await?, request_id)
                },
            )
            .await;

        self.conclude(record, result).await
    }

    /// Return the whole hold to `available`.
    pub(crate) async fn refund_frozen(&self, record: &FreezeRecord, reason: &str) -> Result<ChargeReceipt, BillingError> {
        let ledger = &self.ledger;
        let request_id = &record.request_id;
        let amount_frozen = record.amount_frozen;
        let at = Utc::now();

        let result = self
            .balances
            .update_with(
                record.user_id,
                "refund",
                |current| Ok::<_, BillingError>((plan_refund(current.amounts(), amount_frozen)?, ())),
                move |write, ()| async move {
                    let transition = FreezeTransition::Refund {
                        reason: reason.to_string(),
                    };
                    commit_finalize(ledger.finalize(request_id, &transition, Some(&write), at).await?, request_id)
                },
            )
            .await;

        self.conclude(record, result).await
    }

    /// Failure path: dispatch fee once content was dispatched, full refund otherwise.
    pub(crate) async fn resolve_failure(
        &self,
        record: &FreezeRecord,
        dispatch_fee: Decimal,
        dispatched: bool,
        reason: &str,
    ) -> Result<ChargeReceipt, BillingError> {
        if dispatched {
            self.settle_frozen(record, dispatch_fee, TokenUsage::default(), Some(reason))
                .await
        } else {
            self.refund_frozen(record, reason).await
        }
    }

    async fn conclude(
        &self,
        record: &FreezeRecord,
        result: Result<Finalized, BillingError>,
    ) -> Result<ChargeReceipt, BillingError> {
        match result {
            Ok(Finalized::Now(done)) => {
                metrics::record_settlement(done.status.as_str());
                if done.uncollected_amount > Decimal::ZERO {
                    metrics::record_uncollected_overage(done.uncollected_amount);
                    warn!(
                        request_id = %done.request_id,
                        actual_cost = ?done.actual_cost,
                        uncollected = %done.uncollected_amount,
                        "Actual cost exceeded frozen estimate and available balance; overage written off"
                    );
                }
                info!(
                    request_id = %done.request_id,
                    status = done.status.as_str(),
                    actual_cost = ?done.actual_cost,
                    "Charge finalized"
                );
                Ok(ChargeReceipt::from_record(&done, false))
            }
            Ok(Finalized::Earlier(done)) => {
                debug!(request_id = %done.request_id, status = done.status.as_str(), "Record was finalized concurrently");
                Ok(ChargeReceipt::from_record(&done, false))
            }
            Err(BillingError::Contention) => {
                metrics::record_settlement("deferred");
                warn!(request_id = %record.request_id, "Settlement retries exhausted; leaving record for reconciliation");
                Err(BillingError::SettlementDeferred(record.request_id.clone()))
            }
            Err(e) => {
                // The hold may already have been released by a concurrent finalization
                if let Ok(Some(current)) = self.ledger.get(&record.request_id).await {
                    if current.status.is_terminal() {
                        return Ok(ChargeReceipt::from_record(&current, false));
                    }
                }
                Err(e)
            }
        }
    }

    pub(crate) fn pricing_for(&self, model_id: &str) -> Option<&PricingModel> {
        self.pricing.get(model_id)
    }
}

/// Finalization owed by a charge whose future was dropped while work was in flight.
struct PendingFinalization<S> {
    service: UsageBillingService<S>,
    record: FreezeRecord,
    dispatch_fee: Decimal,
    marker: DispatchMarker,
    _in_flight: InFlightEntry,
}

impl<S: Storage> PendingFinalization<S> {
    fn spawn(self) {
        let request_id = self.record.request_id.clone();
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(%request_id, "Charge dropped outside a runtime; leaving record for reconciliation");
            return;
        };

        warn!(%request_id, "Charge dropped while work was in flight; finalizing in the background");
        let span = info_span!("abandoned_charge", %request_id);
        handle.spawn(
            async move {
                let dispatched = self.marker.is_dispatched();
                if let Err(e) = self
                    .service
                    .resolve_failure(&self.record, self.dispatch_fee, dispatched, "abandoned")
                    .await
                {
                    error!(error = %e, "Failed to finalize abandoned charge");
                }
            }
            .instrument(span),
        );
    }
}
