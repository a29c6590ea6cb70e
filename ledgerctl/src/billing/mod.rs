//! Usage billing.
//!
//! Leaf first:
//!
//! - [`estimator`]: pure cost formulas and the pricing catalog
//! - [`balance`]: balance planners and the optimistic update loop ([`BalanceStore`])
//! - [`ledger`]: one record per billable attempt ([`FreezeLedger`])
//! - [`service`]: the charge flow ([`UsageBillingService`])
//! - [`reconcile`]: the sweep that finishes records left `frozen`

pub mod balance;
pub mod estimator;
pub mod ledger;
pub mod reconcile;
pub mod retry;
pub mod service;

pub use balance::{BalanceError, BalanceStore, Settlement};
pub use estimator::{PricingCatalog, PricingModel, estimate_cost, final_cost};
pub use ledger::{FreezeLedger, LedgerError};
pub use reconcile::{FreezeReconciler, NoUsageLookup, ReconcileReport, UsageLookup, UsageOutcome};
pub use retry::RetryPolicy;
pub use service::{
    BillingError, ChargeReceipt, ChargeRequest, DispatchMarker, TokenUsage, UsageBillingService, WorkFailure,
};
