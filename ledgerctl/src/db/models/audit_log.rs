//! Storage models for the admin audit log.

use crate::types::{AdminId, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Manual adjustment type stored as TEXT in database
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentKind {
    Grant,
    Deduct,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct AuditEntry {
    pub id: Uuid,
    pub admin_id: AdminId,
    pub user_id: UserId,
    pub operation_type: AdjustmentKind,
    pub amount: Decimal,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub admin_id: AdminId,
    pub user_id: UserId,
    pub operation_type: AdjustmentKind,
    pub amount: Decimal,
    pub reason: Option<String>,
}

impl NewAuditEntry {
    pub fn into_entry(self, created_at: DateTime<Utc>) -> AuditEntry {
        AuditEntry {
            id: Uuid::new_v4(),
            admin_id: self.admin_id,
            user_id: self.user_id,
            operation_type: self.operation_type,
            amount: self.amount,
            reason: self.reason,
            created_at,
        }
    }
}
