use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::models::audit_log::{AdjustmentKind, AuditEntry};
use crate::types::{AdminId, UserId};

pub const DEFAULT_AUDIT_PAGE: i64 = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntryResponse {
    pub id: Uuid,
    pub admin_id: AdminId,
    pub user_id: UserId,
    pub operation_type: AdjustmentKind,
    pub amount: Decimal,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<AuditEntry> for AuditEntryResponse {
    fn from(entry: AuditEntry) -> Self {
        Self {
            id: entry.id,
            admin_id: entry.admin_id,
            user_id: entry.user_id,
            operation_type: entry.operation_type,
            amount: entry.amount,
            reason: entry.reason,
            created_at: entry.created_at,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct AuditLogQuery {
    /// Only entries for this user
    pub user_id: Option<UserId>,
    /// Maximum entries to return (default 100, at most 1000)
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogResponse {
    /// Newest first
    pub data: Vec<AuditEntryResponse>,
    pub limit: i64,
}
