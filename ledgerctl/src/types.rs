//! Common identifier types.
//!
//! - [`UserId`] / [`AdminId`]: account identifiers (UUIDs, owned by the surrounding user system)
//! - [`RequestId`]: caller-supplied idempotency key for a billable attempt
//! - [`OrderId`]: recharge order identifier, generated by [`crate::recharge`]
//! - [`ModelId`] / [`PackageId`]: references into configured reference data, held by value
//!
//! Records reference each other by these values only, never by embedded objects.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type UserId = Uuid;
pub type AdminId = Uuid;
pub type ModelId = String;
pub type PackageId = String;

/// Abbreviate a UUID to its first 8 characters for more readable logs and traces
/// Example: "550e8400-e29b-41d4-a716-446655440000" -> "550e8400"
pub fn abbrev_uuid(uuid: &Uuid) -> String {
    uuid.to_string().chars().take(8).collect()
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
        #[serde(transparent)]
        #[sqlx(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Client-generated idempotency key, stable across retries of the same logical request.
    RequestId
);

string_id!(
    /// Recharge order number, unique per recharge attempt.
    OrderId
);
