//! Reconciliation sweep for records left `frozen`.
//!
//! A record stays `frozen` when settlement or refund ran out of retries, or when the process died
//! between freeze and finalization. The sweep re-derives the outcome from the upstream call when a
//! [`UsageLookup`] can report it, and otherwise refunds once the record is older than the grace
//! period. Records whose charge is still running its work in this process are skipped; across
//! processes `billing.work_timeout` ends work before a record can go stale.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::estimator::final_cost;
use super::service::{BillingError, ChargeReceipt, TokenUsage, UsageBillingService};
use crate::config::ReconciliationConfig;
use crate::db::models::freeze_records::{FreezeRecord, FreezeStatus};
use crate::metrics;
use crate::storage::Storage;

/// What the upstream system knows about a billed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsageOutcome {
    Completed(TokenUsage),
    Failed { dispatched: bool },
    Unknown,
}

/// Source of truth for the outcome of a call whose billing was interrupted.
#[async_trait]
pub trait UsageLookup: Send + Sync {
    async fn lookup(&self, record: &FreezeRecord) -> anyhow::Result<UsageOutcome>;
}

/// Lookup for deployments with no upstream record of usage; stale records are refunded.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoUsageLookup;

#[async_trait]
impl UsageLookup for NoUsageLookup {
    async fn lookup(&self, _record: &FreezeRecord) -> anyhow::Result<UsageOutcome> {
        Ok(UsageOutcome::Unknown)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub settled: usize,
    pub refunded: usize,
    /// Still inside the grace period with no known outcome
    pub skipped: usize,
    pub errors: usize,
}

impl ReconcileReport {
    pub fn resolved(&self) -> usize {
        self.settled + self.refunded
    }
}

/// `now - age`, clamped at the earliest representable instant
fn older_than(now: DateTime<Utc>, age: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub struct FreezeReconciler<S> {
    service: UsageBillingService<S>,
    lookup: Arc<dyn UsageLookup>,
    config: ReconciliationConfig,
}

impl<S: Storage> FreezeReconciler<S> {
    pub fn new(service: UsageBillingService<S>, lookup: Arc<dyn UsageLookup>, config: ReconciliationConfig) -> Self {
        Self { service, lookup, config }
    }

    /// One pass over records frozen for longer than `stale_after`.
    #[instrument(skip(self), err)]
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<ReconcileReport, BillingError> {
        let cutoff = older_than(now, self.config.stale_after);
        let refund_cutoff = older_than(now, self.config.refund_after);
        let stale = self.service.ledger().list_stale(cutoff, self.config.batch_size).await?;

        let mut report = ReconcileReport::default();
        for record in stale {
            if self.service.is_in_flight(&record.request_id) {
                debug!(request_id = %record.request_id, "Work still running; leaving record to its charge");
                metrics::record_reconciled("skipped");
                report.skipped += 1;
                continue;
            }
            match self.resolve(&record, refund_cutoff).await {
                Ok(Some(receipt)) => match receipt.status {
                    FreezeStatus::Settled => {
                        metrics::record_reconciled("settled");
                        report.settled += 1;
                    }
                    FreezeStatus::Refunded | FreezeStatus::Failed => {
                        metrics::record_reconciled("refunded");
                        report.refunded += 1;
                    }
                    FreezeStatus::Frozen => report.skipped += 1,
                },
                Ok(None) => {
                    metrics::record_reconciled("skipped");
                    report.skipped += 1;
                }
                Err(e) => {
                    metrics::record_reconciled("error");
                    warn!(request_id = %record.request_id, error = %e, "Failed to reconcile frozen record");
                    report.errors += 1;
                }
            }
        }

        if report != ReconcileReport::default() {
            info!(
                settled = report.settled,
                refunded = report.refunded,
                skipped = report.skipped,
                errors = report.errors,
                "Reconciliation pass finished"
            );
        }
        Ok(report)
    }

    async fn resolve(
        &self,
        record: &FreezeRecord,
        refund_cutoff: DateTime<Utc>,
    ) -> Result<Option<ChargeReceipt>, BillingError> {
        let outcome = match self.lookup.lookup(record).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(request_id = %record.request_id, error = %e, "Usage lookup failed");
                UsageOutcome::Unknown
            }
        };

        let Some(pricing) = self.service.pricing_for(&record.model_id).cloned() else {
            // Pricing was removed since the freeze; the estimate is all we know
            if record.frozen_at < refund_cutoff {
                return self.service.refund_frozen(record, "reconciled: model no longer priced").await.map(Some);
            }
            return Ok(None);
        };

        match outcome {
            UsageOutcome::Completed(usage) => {
                let actual = final_cost(&pricing, usage.input_tokens, usage.output_tokens);
                debug!(request_id = %record.request_id, %actual, "Settling from upstream usage");
                self.service.settle_frozen(record, actual, usage, None).await.map(Some)
            }
            UsageOutcome::Failed { dispatched } => {
                let dispatch_fee = final_cost(&pricing, 0, 0);
                self.service
                    .resolve_failure(record, dispatch_fee, dispatched, "reconciled: upstream failed")
                    .await
                    .map(Some)
            }
            UsageOutcome::Unknown if record.frozen_at < refund_cutoff => self
                .service
                .refund_frozen(record, "reconciled: timed out")
                .await
                .map(Some),
            UsageOutcome::Unknown => Ok(None),
        }
    }

    /// Run [`Self::run_once`] every `interval` until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval = ?self.config.interval,
            stale_after = ?self.config.stale_after,
            refund_after = ?self.config.refund_after,
            "Starting freeze reconciler"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = shutdown.cancelled() => {
                    info!("Freeze reconciler shutting down");
                    return;
                }
            }

            if let Err(e) = self.run_once(Utc::now()).await {
                warn!(error = %e, "Reconciliation pass failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::balance::BalanceStore;
    use crate::billing::estimator::{PricingCatalog, PricingModel};
    use crate::billing::ledger::FreezeLedger;
    use crate::billing::retry::RetryPolicy;
    use crate::billing::service::ChargeRequest;
    use crate::db::models::freeze_records::{InsertOutcome, NewFreezeRecord};
    use crate::db::models::balances::BalanceWrite;
    use crate::storage::BalanceStorage;
    use crate::storage::in_memory::InMemoryStorage;
    use crate::types::{RequestId, UserId};
    use rust_decimal::Decimal;
    use std::collections::HashMap;
    use std::time::Duration;
    use uuid::Uuid;

    fn dec(value: i64) -> Decimal {
        Decimal::new(value, 0)
    }

    struct FixedLookup(UsageOutcome);

    #[async_trait]
    impl UsageLookup for FixedLookup {
        async fn lookup(&self, _record: &FreezeRecord) -> anyhow::Result<UsageOutcome> {
            Ok(self.0.clone())
        }
    }

    struct FailingLookup;

    #[async_trait]
    impl UsageLookup for FailingLookup {
        async fn lookup(&self, _record: &FreezeRecord) -> anyhow::Result<UsageOutcome> {
            anyhow::bail!("upstream unavailable")
        }
    }

    fn config() -> ReconciliationConfig {
        ReconciliationConfig {
            enabled: true,
            interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(300),
            refund_after: Duration::from_secs(3600),
            batch_size: 100,
        }
    }

    struct Fixture {
        service: UsageBillingService<InMemoryStorage>,
        balances: BalanceStore<InMemoryStorage>,
        user_id: UserId,
    }

    /// A user with 5000 available and one 310 hold on `req-1`, as if the process died mid-charge
    async fn stuck_charge() -> Fixture {
        let storage = Arc::new(InMemoryStorage::new());
        let balances = BalanceStore::new(storage.clone(), RetryPolicy::default());
        let ledger = FreezeLedger::new(storage.clone());
        let mut models = HashMap::new();
        models.insert(
            "chat".to_string(),
            PricingModel {
                rate_multiplier: Decimal::ONE,
                base_fee: dec(10),
                input_weight: Decimal::ONE,
                output_weight: dec(3),
                max_tokens_per_request: 4096,
            },
        );
        let service = UsageBillingService::new(balances.clone(), ledger.clone(), Arc::new(PricingCatalog::new(models)));

        let user_id = Uuid::new_v4();
        balances.ensure_account(user_id).await.unwrap();
        balances.recharge(user_id, dec(5000)).await.unwrap();

        let current = storage.get_balance(user_id).await.unwrap().unwrap();
        let write = BalanceWrite::on(
            &current,
            crate::billing::balance::plan_freeze(current.amounts(), dec(310)).unwrap(),
        );
        let record = NewFreezeRecord {
            request_id: RequestId::from("req-1"),
            user_id,
            model_id: "chat".to_string(),
            conversation_id: None,
            amount_frozen: dec(310),
            estimated_cost: dec(310),
            failure_reason: None,
        };
        assert!(matches!(
            ledger.create_frozen(record, Some(&write)).await.unwrap(),
            InsertOutcome::Inserted(_)
        ));

        Fixture {
            service,
            balances,
            user_id,
        }
    }

    fn reconciler(f: &Fixture, lookup: impl UsageLookup + 'static) -> FreezeReconciler<InMemoryStorage> {
        FreezeReconciler::new(f.service.clone(), Arc::new(lookup), config())
    }

    async fn status(f: &Fixture) -> FreezeStatus {
        f.service
            .ledger()
            .get(&RequestId::from("req-1"))
            .await
            .unwrap()
            .unwrap()
            .status
    }

    #[tokio::test]
    async fn test_fresh_records_are_left_alone() {
        let f = stuck_charge().await;
        let report = reconciler(&f, NoUsageLookup).run_once(Utc::now()).await.unwrap();

        assert_eq!(report, ReconcileReport::default());
        assert_eq!(status(&f).await, FreezeStatus::Frozen);
    }

    #[tokio::test]
    async fn test_unknown_outcome_waits_for_grace_period() {
        let f = stuck_charge().await;
        let r = reconciler(&f, NoUsageLookup);

        let report = r.run_once(Utc::now() + chrono::Duration::minutes(10)).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(status(&f).await, FreezeStatus::Frozen);

        let report = r.run_once(Utc::now() + chrono::Duration::hours(2)).await.unwrap();
        assert_eq!(report.refunded, 1);
        assert_eq!(status(&f).await, FreezeStatus::Refunded);

        let balance = f.balances.get(f.user_id).await.unwrap();
        assert_eq!((balance.available, balance.frozen), (dec(5000), Decimal::ZERO));
    }

    #[tokio::test]
    async fn test_completed_upstream_call_is_settled() {
        let f = stuck_charge().await;
        let lookup = FixedLookup(UsageOutcome::Completed(TokenUsage {
            input_tokens: 20,
            output_tokens: 50,
        }));

        let report = reconciler(&f, lookup)
            .run_once(Utc::now() + chrono::Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(report.settled, 1);

        let record = f.service.ledger().get(&RequestId::from("req-1")).await.unwrap().unwrap();
        assert_eq!(record.status, FreezeStatus::Settled);
        assert_eq!(record.actual_cost, Some(dec(180)));
        let balance = f.balances.get(f.user_id).await.unwrap();
        assert_eq!((balance.available, balance.frozen), (dec(4820), Decimal::ZERO));
    }

    #[tokio::test]
    async fn test_dispatched_failure_is_charged_dispatch_fee() {
        let f = stuck_charge().await;
        let lookup = FixedLookup(UsageOutcome::Failed { dispatched: true });

        let report = reconciler(&f, lookup)
            .run_once(Utc::now() + chrono::Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(report.settled, 1);

        let balance = f.balances.get(f.user_id).await.unwrap();
        assert_eq!((balance.available, balance.frozen), (dec(4990), Decimal::ZERO));
    }

    #[tokio::test]
    async fn test_lookup_errors_fall_back_to_timeout_refund() {
        let f = stuck_charge().await;
        let report = reconciler(&f, FailingLookup)
            .run_once(Utc::now() + chrono::Duration::hours(2))
            .await
            .unwrap();

        assert_eq!(report.refunded, 1);
        assert_eq!(report.errors, 0);
    }

    #[tokio::test]
    async fn test_resolved_records_are_not_revisited() {
        let f = stuck_charge().await;
        let r = reconciler(&f, NoUsageLookup);
        let later = Utc::now() + chrono::Duration::hours(2);

        assert_eq!(r.run_once(later).await.unwrap().resolved(), 1);
        assert_eq!(r.run_once(later).await.unwrap(), ReconcileReport::default());

        let balance = f.balances.get(f.user_id).await.unwrap();
        assert_eq!(balance.available, dec(5000));
    }

    #[test_log::test(tokio::test)]
    async fn test_running_charge_is_not_refunded_under_it() {
        let f = stuck_charge().await;
        let service = f.service.clone();
        let user_id = f.user_id;
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let charge = tokio::spawn(async move {
            let request = ChargeRequest::builder()
                .request_id("req-2")
                .user_id(user_id)
                .model_id("chat")
                .assumed_max_tokens(100)
                .build();
            service
                .charge(request, |_| async move {
                    let _ = started_tx.send(());
                    let _ = release_rx.await;
                    Ok(TokenUsage {
                        input_tokens: 20,
                        output_tokens: 50,
                    })
                })
                .await
        });
        started_rx.await.unwrap();
        assert!(f.service.is_in_flight(&RequestId::from("req-2")));

        let r = FreezeReconciler::new(f.service.clone(), Arc::new(NoUsageLookup), ReconciliationConfig::default());
        let report = r.run_once(Utc::now() + chrono::Duration::minutes(31)).await.unwrap();
        // The abandoned req-1 is refunded, the live req-2 is left to its charge
        assert_eq!(report.refunded, 1);
        assert_eq!(report.skipped, 1);

        release_tx.send(()).unwrap();
        let receipt = charge.await.unwrap().unwrap();
        assert_eq!(receipt.status, FreezeStatus::Settled);
        assert_eq!(receipt.actual_cost, Some(dec(180)));
        assert!(!f.service.is_in_flight(&RequestId::from("req-2")));

        let balance = f.balances.get(f.user_id).await.unwrap();
        assert_eq!((balance.available, balance.frozen), (dec(4820), Decimal::ZERO));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let f = stuck_charge().await;
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(reconciler(&f, NoUsageLookup).run(shutdown.clone()));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }
}
