//! Persistence types shared by every storage backend.
//!
//! ```text
//! ┌──────────────────┐
//! │ billing/recharge │  (services - business rules, retry loops)
//! └────────┬─────────┘
//!          │
//!          ↓
//! ┌──────────────────┐
//! │     storage      │  (Storage traits: postgres / in-memory)
//! └────────┬─────────┘
//!          │
//!          ↓
//! ┌──────────────────┐
//! │    db::models    │  (row types, status enums)
//! └──────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`errors`]: [`errors::DbError`], the storage error taxonomy every backend maps into
//! - [`models`]: record structs and the outcome enums returned by conditional writes

pub mod errors;
pub mod models;
