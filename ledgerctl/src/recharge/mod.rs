//! Recharge orders: creation, payment callbacks and expiry.
//!
//! ```text
//! pending --callback ok------> paid       (credit applied in the same write)
//!    |----callback mismatch--> pending    (flagged for review, never auto-cancelled)
//!    '----expiry sweep-------> cancelled
//! ```
//!
//! Gateways redeliver callbacks, so a callback for an order that is already `paid` is answered
//! with [`CallbackOutcome::AlreadyProcessed`] and credits nothing.

pub mod signing;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::prelude::RngExt;
use rand::rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::billing::balance::{BalanceError, BalanceStore, Commit, plan_recharge};
use crate::billing::estimator::round_money;
use crate::config::RechargeConfig;
use crate::db::errors::DbError;
use crate::db::models::balances::UserBalance;
use crate::db::models::recharge_orders::{NewRechargeOrder, PaymentOutcome, PaymentStatus, RechargeOrder};
use crate::metrics;
use crate::storage::{ORDER_ID_CONSTRAINT, Storage};
use crate::types::{OrderId, PackageId, UserId, abbrev_uuid};

/// A purchasable credit package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RechargePackage {
    /// What the user pays
    pub price: Decimal,
    /// What is credited; may exceed `price` for bonus packages
    pub credits: Decimal,
}

impl RechargePackage {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.price <= Decimal::ZERO {
            return Err(format!("price must be positive (got {})", self.price));
        }
        if self.credits <= Decimal::ZERO {
            return Err(format!("credits must be positive (got {})", self.credits));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum RechargeError {
    #[error("recharge order {0} not found")]
    OrderNotFound(OrderId),

    #[error("recharge order {0} has expired")]
    OrderExpired(OrderId),

    #[error("paid amount {received} does not match expected {expected}")]
    AmountMismatch { expected: Decimal, received: Decimal },

    #[error("recharge order {order_id} is {status:?}")]
    OrderClosed { order_id: OrderId, status: PaymentStatus },

    #[error("transaction {0} was already applied to another order")]
    DuplicateTransaction(String),

    #[error("unknown recharge package {0}")]
    UnknownPackage(PackageId),

    #[error("package {package_id} costs {expected}, not {quoted}")]
    PriceMismatch {
        package_id: PackageId,
        expected: Decimal,
        quoted: Decimal,
    },

    #[error("recharge amount must be positive, got {0}")]
    InvalidAmount(Decimal),

    #[error("could not allocate a unique order id after {0} attempts")]
    OrderIdExhausted(u32),

    #[error(transparent)]
    Balance(#[from] BalanceError),

    #[error(transparent)]
    Storage(#[from] DbError),
}

/// Gateway notification that an order was paid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentCallback {
    pub order_id: OrderId,
    pub transaction_id: String,
    pub amount: Decimal,
    /// When the gateway recorded the payment
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    Credited { order: RechargeOrder, balance: UserBalance },
    /// Redelivery for an order that is already paid; nothing was credited
    AlreadyProcessed(RechargeOrder),
}

/// Source of recharge order ids.
pub trait OrderIdGenerator: Send + Sync {
    fn generate(&self, now: DateTime<Utc>) -> OrderId;
}

/// `RC` + UTC `YYYYMMDDHHMMSS` + 8 random digits.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimestampOrderIds;

impl OrderIdGenerator for TimestampOrderIds {
    fn generate(&self, now: DateTime<Utc>) -> OrderId {
        let suffix: u32 = rng().random_range(0..100_000_000);
        OrderId::new(format!("RC{}{suffix:08}", now.format("%Y%m%d%H%M%S")))
    }
}

pub struct RechargeOrderService<S> {
    storage: Arc<S>,
    balances: BalanceStore<S>,
    config: RechargeConfig,
    order_ids: Arc<dyn OrderIdGenerator>,
}

impl<S> Clone for RechargeOrderService<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            balances: self.balances.clone(),
            config: self.config.clone(),
            order_ids: Arc::clone(&self.order_ids),
        }
    }
}

impl<S: Storage> RechargeOrderService<S> {
    pub fn new(storage: Arc<S>, balances: BalanceStore<S>, config: RechargeConfig) -> Self {
        Self {
            storage,
            balances,
            config,
            order_ids: Arc::new(TimestampOrderIds),
        }
    }

    pub fn with_order_ids(mut self, order_ids: Arc<dyn OrderIdGenerator>) -> Self {
        self.order_ids = order_ids;
        self
    }

    pub fn config(&self) -> &RechargeConfig {
        &self.config
    }

    /// Create a `pending` order. Order id collisions are retried with a fresh id.
    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&user_id)), err)]
    pub async fn create_order(
        &self,
        user_id: UserId,
        package_id: Option<PackageId>,
        amount: Decimal,
    ) -> Result<RechargeOrder, RechargeError> {
        let amount = round_money(amount);
        if amount <= Decimal::ZERO {
            return Err(RechargeError::InvalidAmount(amount));
        }

        let credit_amount = match &package_id {
            Some(id) => {
                let package = self
                    .config
                    .packages
                    .get(id)
                    .ok_or_else(|| RechargeError::UnknownPackage(id.clone()))?;
                if package.price != amount {
                    return Err(RechargeError::PriceMismatch {
                        package_id: id.clone(),
                        expected: package.price,
                        quoted: amount,
                    });
                }
                round_money(package.credits)
            }
            None => amount,
        };

        // Orders reference an existing account
        self.balances.get(user_id).await?;

        let ttl = chrono::Duration::from_std(self.config.order_ttl)
            .map_err(|e| DbError::Other(anyhow::anyhow!("order ttl out of range: {e}")))?;

        for attempt in 1..=self.config.order_id_attempts {
            let now = Utc::now();
            let order = NewRechargeOrder {
                order_id: self.order_ids.generate(now),
                user_id,
                package_id: package_id.clone(),
                payment_amount: amount,
                credit_amount,
                order_expire_at: now + ttl,
            };
            match self.storage.insert_order(order).await {
                Ok(order) => {
                    info!(order_id = %order.order_id, %amount, %credit_amount, "Recharge order created");
                    return Ok(order);
                }
                Err(e) if e.is_unique_violation_on(ORDER_ID_CONSTRAINT) => {
                    debug!(attempt, "Order id collision, generating another");
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(attempts = self.config.order_id_attempts, "Gave up allocating a recharge order id");
        Err(RechargeError::OrderIdExhausted(self.config.order_id_attempts))
    }

    pub async fn get_order(&self, order_id: &OrderId) -> Result<RechargeOrder, RechargeError> {
        self.storage
            .get_order(order_id)
            .await?
            .ok_or_else(|| RechargeError::OrderNotFound(order_id.clone()))
    }

    pub async fn handle_payment_callback(&self, callback: &PaymentCallback) -> Result<CallbackOutcome, RechargeError> {
        self.handle_payment_callback_at(callback, Utc::now()).await
    }

    /// Apply a gateway callback as observed at `now`.
    #[instrument(skip(self, callback), fields(order_id = %callback.order_id, transaction_id = %callback.transaction_id), err)]
    pub async fn handle_payment_callback_at(
        &self,
        callback: &PaymentCallback,
        now: DateTime<Utc>,
    ) -> Result<CallbackOutcome, RechargeError> {
        let result = self.process_callback(callback, now).await;
        metrics::record_payment_callback(match &result {
            Ok(CallbackOutcome::Credited { .. }) => "credited",
            Ok(CallbackOutcome::AlreadyProcessed(_)) => "already_processed",
            Err(RechargeError::OrderNotFound(_)) => "not_found",
            Err(RechargeError::OrderExpired(_)) => "expired",
            Err(RechargeError::AmountMismatch { .. }) => "amount_mismatch",
            Err(RechargeError::OrderClosed { .. }) => "closed",
            Err(RechargeError::DuplicateTransaction(_)) => "duplicate_transaction",
            Err(_) => "error",
        });
        result
    }

    async fn process_callback(&self, callback: &PaymentCallback, now: DateTime<Utc>) -> Result<CallbackOutcome, RechargeError> {
        let order = self.get_order(&callback.order_id).await?;

        match order.payment_status {
            PaymentStatus::Paid => {
                if order.wechat_transaction_id.as_deref() != Some(callback.transaction_id.as_str()) {
                    warn!(
                        recorded = ?order.wechat_transaction_id,
                        "Callback for a paid order carries a different transaction id"
                    );
                }
                debug!("Duplicate callback for a paid order");
                return Ok(CallbackOutcome::AlreadyProcessed(order));
            }
            PaymentStatus::Cancelled | PaymentStatus::Failed => {
                return Err(RechargeError::OrderClosed {
                    order_id: order.order_id,
                    status: order.payment_status,
                });
            }
            PaymentStatus::Pending => {}
        }

        if order.is_expired_at(now) {
            info!(expired_at = %order.order_expire_at, "Rejecting callback for an expired order");
            return Err(RechargeError::OrderExpired(order.order_id));
        }

        // Exact comparison; stored amounts are already at money scale
        let received = callback.amount;
        if received != order.payment_amount {
            let note = format!(
                "callback amount {received} does not match expected {} (transaction {})",
                order.payment_amount, callback.transaction_id
            );
            warn!(expected = %order.payment_amount, %received, "Payment amount mismatch; flagging order for review");
            self.storage.flag_order_for_review(&order.order_id, &note).await?;
            return Err(RechargeError::AmountMismatch {
                expected: order.payment_amount,
                received,
            });
        }

        let storage = &*self.storage;
        let order_id = &order.order_id;
        let transaction_id = callback.transaction_id.as_str();
        let credit_amount = order.credit_amount;

        let outcome = self
            .balances
            .update_with(
                order.user_id,
                "recharge",
                |current| Ok::<_, RechargeError>((plan_recharge(current.amounts(), credit_amount)?, ())),
                move |write, ()| async move {
                    match storage.complete_order_payment(order_id, transaction_id, now, &write).await? {
                        PaymentOutcome::Completed { order, balance } => {
                            Ok(Commit::Applied(CallbackOutcome::Credited { order, balance }))
                        }
                        PaymentOutcome::AlreadyPaid(order) => Ok(Commit::Applied(CallbackOutcome::AlreadyProcessed(order))),
                        PaymentOutcome::NotPending(order) => Err(RechargeError::OrderClosed {
                            order_id: order.order_id,
                            status: order.payment_status,
                        }),
                        PaymentOutcome::DuplicateTransaction => {
                            Err(RechargeError::DuplicateTransaction(transaction_id.to_string()))
                        }
                        PaymentOutcome::BalanceConflict => Ok(Commit::Conflict),
                        PaymentOutcome::NotFound => Err(RechargeError::OrderNotFound(order_id.clone())),
                    }
                },
            )
            .await?;

        if let CallbackOutcome::Credited { balance, .. } = &outcome {
            info!(credited = %credit_amount, available = %balance.available, "Recharge order paid");
        }
        Ok(outcome)
    }

    /// Cancel every unflagged pending order past its expiry. No balance effect.
    #[instrument(skip(self), err)]
    pub async fn sweep_expired_orders(&self, now: DateTime<Utc>) -> Result<Vec<OrderId>, RechargeError> {
        let cancelled = self.storage.cancel_expired_orders(now).await?;
        if !cancelled.is_empty() {
            metrics::record_orders_expired(cancelled.len());
            info!(count = cancelled.len(), "Cancelled expired recharge orders");
        }
        Ok(cancelled)
    }

    /// Run [`Self::sweep_expired_orders`] every `sweep_interval` until `shutdown` is cancelled.
    pub async fn run_sweeper(self, shutdown: CancellationToken) {
        let interval: Duration = self.config.sweep_interval;
        info!(?interval, "Starting recharge order expiry sweeper");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.cancelled() => {
                    info!("Recharge order sweeper shutting down");
                    return;
                }
            }

            if let Err(e) = self.sweep_expired_orders(Utc::now()).await {
                warn!(error = %e, "Recharge order sweep failed");
            }
        }
    }
}
