//! Storage record models matching table schemas.
//!
//! Each model struct matches a table in `migrations/` and derives `sqlx::FromRow`. The in-memory
//! store keeps the same structs, so both backends hand out identical values.
//!
//! - [`balances`]: per-user available/frozen balance with its optimistic version
//! - [`freeze_records`]: one row per billable attempt, keyed by `request_id`
//! - [`recharge_orders`]: payment orders awaiting gateway callbacks
//! - [`audit_log`]: append-only operator adjustments

pub mod audit_log;
pub mod balances;
pub mod freeze_records;
pub mod recharge_orders;
