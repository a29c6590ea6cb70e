//! Usage billing metrics for Prometheus.

use once_cell::sync::Lazy;
use prometheus::{
    Counter, Histogram, IntCounterVec, register_counter, register_histogram, register_int_counter_vec,
};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

/// Freeze attempts by outcome (frozen, insufficient_balance, contention, replayed, ...)
static FREEZES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("ledger_freezes_total", "Freeze attempts by outcome", &["outcome"])
        .expect("Failed to register ledger_freezes_total metric")
});

/// Terminal transitions by resulting status, plus deferred settlements
static SETTLEMENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ledger_settlements_total",
        "Freeze records finalized, by terminal status",
        &["status"]
    )
    .expect("Failed to register ledger_settlements_total metric")
});

static UNCOLLECTED_OVERAGE: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "ledger_uncollected_overage_total",
        "Actual cost beyond the frozen estimate that could not be collected from available balance"
    )
    .expect("Failed to register ledger_uncollected_overage_total metric")
});

static BALANCE_CONFLICTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ledger_balance_conflicts_total",
        "Optimistic-lock conflicts on balance writes",
        &["operation"]
    )
    .expect("Failed to register ledger_balance_conflicts_total metric")
});

static CONTENTION_EXHAUSTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ledger_contention_exhausted_total",
        "Balance writes that gave up after the retry budget",
        &["operation"]
    )
    .expect("Failed to register ledger_contention_exhausted_total metric")
});

static RECONCILED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ledger_reconciled_total",
        "Stale freeze records resolved by the reconciliation sweep",
        &["resolution"]
    )
    .expect("Failed to register ledger_reconciled_total metric")
});

/// Duration of caller-supplied work between freeze and settlement
/// Buckets: 100ms, 500ms, 1s, 5s, 10s, 30s, 60s, 120s, 300s
static WORK_DURATION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "ledger_work_duration_seconds",
        "Time spent in billed work between freeze and settlement (seconds)",
        vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    )
    .expect("Failed to register ledger_work_duration_seconds metric")
});

pub fn record_freeze(outcome: &str) {
    FREEZES.with_label_values(&[outcome]).inc();
}

pub fn record_settlement(status: &str) {
    SETTLEMENTS.with_label_values(&[status]).inc();
}

pub fn record_uncollected_overage(amount: Decimal) {
    // Counters only go up
    let amount = amount.to_f64().unwrap_or(0.0);
    if amount > 0.0 {
        UNCOLLECTED_OVERAGE.inc_by(amount);
    }
}

pub fn record_balance_conflict(operation: &str) {
    BALANCE_CONFLICTS.with_label_values(&[operation]).inc();
}

pub fn record_contention_exhausted(operation: &str) {
    CONTENTION_EXHAUSTED.with_label_values(&[operation]).inc();
}

pub fn record_reconciled(resolution: &str) {
    RECONCILED.with_label_values(&[resolution]).inc();
}

pub fn record_work_duration(seconds: f64) {
    WORK_DURATION_SECONDS.observe(seconds);
}
