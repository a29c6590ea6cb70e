//! API request and response data models.
//!
//! API models are distinct from the storage rows in [`crate::db::models`] so the two can evolve
//! independently. Money is serialized as decimal strings.

pub mod audit_log;
pub mod balances;
pub mod freeze_records;
pub mod payments;
pub mod recharge_orders;
