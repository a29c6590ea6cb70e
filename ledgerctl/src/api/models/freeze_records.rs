use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::db::models::freeze_records::{FreezeRecord, FreezeStatus};
use crate::types::{ModelId, RequestId, UserId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreezeRecordResponse {
    pub request_id: RequestId,
    pub user_id: UserId,
    pub model_id: ModelId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub status: FreezeStatus,
    pub amount_frozen: Decimal,
    pub estimated_cost: Decimal,
    pub actual_cost: Option<Decimal>,
    /// Overage written off at settlement
    pub uncollected_amount: Decimal,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub failure_reason: Option<String>,
    pub frozen_at: DateTime<Utc>,
    /// When the record left `frozen`, whichever way it went
    pub finalized_at: Option<DateTime<Utc>>,
}

impl From<FreezeRecord> for FreezeRecordResponse {
    fn from(record: FreezeRecord) -> Self {
        let finalized_at = record.settled_at.or(record.refunded_at).or(record.failed_at);
        Self {
            request_id: record.request_id,
            user_id: record.user_id,
            model_id: record.model_id,
            conversation_id: record.conversation_id,
            status: record.status,
            amount_frozen: record.amount_frozen,
            estimated_cost: record.estimated_cost,
            actual_cost: record.actual_cost,
            uncollected_amount: record.uncollected_amount,
            input_tokens: record.input_tokens,
            output_tokens: record.output_tokens,
            failure_reason: record.failure_reason,
            frozen_at: record.frozen_at,
            finalized_at,
        }
    }
}
