//! Recharge order metrics for Prometheus.

use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntCounterVec, register_int_counter, register_int_counter_vec};

static PAYMENT_CALLBACKS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ledger_payment_callbacks_total",
        "Payment gateway callbacks by outcome",
        &["outcome"]
    )
    .expect("Failed to register ledger_payment_callbacks_total metric")
});

static ORDERS_EXPIRED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("ledger_orders_expired_total", "Pending recharge orders cancelled by the expiry sweep")
        .expect("Failed to register ledger_orders_expired_total metric")
});

pub fn record_payment_callback(outcome: &str) {
    PAYMENT_CALLBACKS.with_label_values(&[outcome]).inc();
}

pub fn record_orders_expired(count: usize) {
    ORDERS_EXPIRED.inc_by(count as u64);
}
