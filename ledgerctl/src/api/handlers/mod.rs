//! HTTP request handlers, one module per resource.
//!
//! Handlers are generic over the [`crate::storage::Storage`] backend and return
//! [`crate::errors::Error`], which converts to a status code and a JSON `{"message"}` body.

pub mod audit_log;
pub mod balances;
pub mod freeze_records;
pub mod payments;
pub mod recharge_orders;
pub mod system;
