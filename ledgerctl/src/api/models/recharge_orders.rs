use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::db::models::recharge_orders::{PaymentStatus, RechargeOrder};
use crate::types::{OrderId, PackageId, UserId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RechargeOrderCreate {
    pub user_id: UserId,
    /// Configured package; `amount` must then equal its price
    pub package_id: Option<PackageId>,
    /// Amount the user will pay
    pub amount: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RechargeOrderResponse {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub package_id: Option<PackageId>,
    pub payment_amount: Decimal,
    pub credit_amount: Decimal,
    pub payment_status: PaymentStatus,
    pub transaction_id: Option<String>,
    pub order_expire_at: DateTime<Utc>,
    pub flagged_for_review: bool,
    pub review_note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl From<RechargeOrder> for RechargeOrderResponse {
    fn from(order: RechargeOrder) -> Self {
        Self {
            order_id: order.order_id,
            user_id: order.user_id,
            package_id: order.package_id,
            payment_amount: order.payment_amount,
            credit_amount: order.credit_amount,
            payment_status: order.payment_status,
            transaction_id: order.wechat_transaction_id,
            order_expire_at: order.order_expire_at,
            flagged_for_review: order.flagged_for_review,
            review_note: order.review_note,
            created_at: order.created_at,
            paid_at: order.paid_at,
        }
    }
}
