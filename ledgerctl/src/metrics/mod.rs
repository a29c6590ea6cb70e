//! Prometheus metrics for the ledger.
//!
//! Metrics are registered lazily on the default registry the first time they are touched and
//! exposed by the `/internal/metrics` route.

mod billing;
mod recharge;

pub use billing::{
    record_balance_conflict, record_contention_exhausted, record_freeze, record_reconciled, record_settlement,
    record_uncollected_overage, record_work_duration,
};
pub use recharge::{record_orders_expired, record_payment_callback};

/// Encode every registered metric in the Prometheus text format
pub fn render() -> Result<String, prometheus::Error> {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
